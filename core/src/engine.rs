/// Sync engine: wires the components together and exposes the
/// observable state and the two commands the UI layer uses.
use crate::aggregator::SummaryAggregator;
use crate::config::Config;
use crate::connection::{ConnectionMonitor, ConnectionWatch};
use crate::directory::ParticipantDirectory;
use crate::error::{ConversationError, Result, SendError};
use crate::feed::RemoteFeed;
use crate::model::{ConversationSummary, ConversationView};
use crate::outbound::OutboundCoordinator;
use crate::reconciler::{Reconciler, ReconcilerExit};
use crate::status::ConversationErrors;
use crate::store::{LocalStore, StoreChange};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Subscription {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<ReconcilerExit>,
}

struct Inner {
    store: LocalStore,
    aggregator: SummaryAggregator,
    feed: Arc<dyn RemoteFeed>,
    monitor: Arc<ConnectionMonitor>,
    outbound: OutboundCoordinator,
    errors: ConversationErrors,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

/// Conversation sync core
#[derive(Clone)]
pub struct ChatSync {
    inner: Arc<Inner>,
}

impl ChatSync {
    /// Open the local store from `config` and build the engine
    pub fn new(
        config: &Config,
        feed: Arc<dyn RemoteFeed>,
        directory: Arc<dyn ParticipantDirectory>,
    ) -> Result<Self> {
        config.validate()?;
        let store = LocalStore::open(config)?;
        Ok(Self::with_store(config, store, feed, directory))
    }

    /// Build the engine over an already opened store
    pub fn with_store(
        config: &Config,
        store: LocalStore,
        feed: Arc<dyn RemoteFeed>,
        directory: Arc<dyn ParticipantDirectory>,
    ) -> Self {
        let monitor = Arc::new(ConnectionMonitor::new());
        let aggregator = SummaryAggregator::new(
            config.local_user_id.clone(),
            config.preview_max_chars,
            directory,
        );
        let outbound = OutboundCoordinator::new(feed.clone(), monitor.watch(), config.local_user_id.clone());
        info!("Sync engine ready for user {}", config.local_user_id);

        Self {
            inner: Arc::new(Inner {
                store,
                aggregator,
                feed,
                monitor,
                outbound,
                errors: ConversationErrors::new(config.event_buffer),
                subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    /// The monitor, for the adapter that owns the liveness probe
    pub fn connection_monitor(&self) -> Arc<ConnectionMonitor> {
        Arc::clone(&self.inner.monitor)
    }

    pub fn connection(&self) -> ConnectionWatch {
        self.inner.monitor.watch()
    }

    /// Drive the connection state from a liveness source
    pub fn attach_liveness<S>(&self, liveness: S) -> JoinHandle<()>
    where
        S: Stream<Item = bool> + Send + 'static,
    {
        self.inner.monitor.spawn_liveness(liveness)
    }

    /// Subscribe to a conversation's feed and start reconciling it.
    /// Restarts a subscription the feed cancelled, clearing its error.
    pub async fn open_conversation(&self, conversation_id: &str) {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        if let Some(existing) = subscriptions.get(conversation_id) {
            let cancelled = matches!(
                self.inner.errors.get(conversation_id).await,
                Some(ConversationError::ListenerCancelled(_))
            );
            if !cancelled && !existing.handle.is_finished() {
                debug!("{} already subscribed", conversation_id);
                return;
            }
            info!("Resubscribing {}", conversation_id);
            if let Some(old) = subscriptions.remove(conversation_id) {
                let _ = old.stop.send(());
                let _ = old.handle.await;
            }
        }

        self.inner.errors.clear(conversation_id).await;
        let events = self.inner.feed.subscribe(conversation_id);
        let reconciler = Reconciler::new(
            conversation_id,
            self.inner.store.clone(),
            self.inner.aggregator.clone(),
        );
        let (stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(reconciler.run(events, stop_rx, self.inner.errors.clone()));
        subscriptions.insert(conversation_id.to_string(), Subscription { stop, handle });
    }

    /// Stop reconciling and release the feed subscription. Idempotent.
    /// In-flight sends are unaffected.
    pub async fn close_conversation(&self, conversation_id: &str) {
        let subscription = self.inner.subscriptions.lock().await.remove(conversation_id);
        self.inner.feed.unsubscribe(conversation_id);
        if let Some(subscription) = subscription {
            let _ = subscription.stop.send(());
            match subscription.handle.await {
                Ok(exit) => debug!("{} closed: {:?}", conversation_id, exit),
                Err(e) => warn!("Reconciler for {} failed: {}", conversation_id, e),
            }
        }
    }

    /// Close every open conversation
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.inner.subscriptions.lock().await.keys().cloned().collect();
        for id in ids {
            self.close_conversation(&id).await;
        }
        info!("Sync engine stopped");
    }

    pub async fn send(&self, conversation_id: &str, text: &str) -> std::result::Result<(), SendError> {
        self.inner.outbound.send(conversation_id, text).await
    }

    pub async fn mark_read(&self, conversation_id: &str) -> Result<()> {
        self.inner.aggregator.mark_read(&self.inner.store, conversation_id).await
    }

    /// Current state of one conversation
    pub async fn conversation_view(&self, conversation_id: &str) -> Result<ConversationView> {
        self.inner.view(conversation_id).await
    }

    /// Summaries, newest activity first
    pub fn conversation_list(&self) -> Result<Vec<ConversationSummary>> {
        self.inner.store.summaries_by_recency()
    }

    /// Current view followed by a new one whenever messages, summary,
    /// connection state or error of the conversation change.
    pub fn observe_conversation(&self, conversation_id: &str) -> BoxStream<'static, ConversationView> {
        let state = ViewObserver {
            inner: Arc::clone(&self.inner),
            conversation_id: conversation_id.to_string(),
            store_rx: self.inner.store.observe(),
            error_rx: self.inner.errors.observe(),
            connection: self.inner.monitor.watch(),
            last: None,
        };
        stream::unfold(state, |mut state| async move {
            let view = state.next_view().await?;
            Some((view, state))
        })
        .boxed()
    }

    /// Current conversation list followed by a new one after every change
    pub fn observe_conversation_list(&self) -> BoxStream<'static, Vec<ConversationSummary>> {
        let state = ListObserver {
            inner: Arc::clone(&self.inner),
            store_rx: self.inner.store.observe(),
            last: None,
        };
        stream::unfold(state, |mut state| async move {
            let list = state.next_list().await?;
            Some((list, state))
        })
        .boxed()
    }
}

impl Inner {
    async fn view(&self, conversation_id: &str) -> Result<ConversationView> {
        let (messages, summary) = self.store.snapshot(conversation_id).await?;
        let summary = match summary {
            Some(summary) => summary,
            None => self.aggregator.placeholder(conversation_id),
        };
        Ok(ConversationView {
            messages,
            summary,
            connection_state: self.monitor.state(),
            error: self.errors.get(conversation_id).await.map(|e| e.to_string()),
        })
    }
}

struct ViewObserver {
    inner: Arc<Inner>,
    conversation_id: String,
    store_rx: broadcast::Receiver<StoreChange>,
    error_rx: broadcast::Receiver<String>,
    connection: ConnectionWatch,
    last: Option<ConversationView>,
}

impl ViewObserver {
    async fn next_view(&mut self) -> Option<ConversationView> {
        loop {
            if self.last.is_some() && !self.wait_for_change().await {
                return None;
            }
            match self.inner.view(&self.conversation_id).await {
                Ok(view) if self.last.as_ref() != Some(&view) => {
                    self.last = Some(view.clone());
                    return Some(view);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Failed to read {}: {}", self.conversation_id, e);
                    if self.last.is_none() && !self.wait_for_change().await {
                        return None;
                    }
                }
            }
        }
    }

    /// Wait for something relevant to this conversation. False once the
    /// engine is gone.
    async fn wait_for_change(&mut self) -> bool {
        loop {
            tokio::select! {
                change = self.store_rx.recv() => match change {
                    Ok(change) if change.conversation_id == self.conversation_id => return true,
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => return true,
                    Err(RecvError::Closed) => return false,
                },
                id = self.error_rx.recv() => match id {
                    Ok(id) if id == self.conversation_id => return true,
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => return true,
                    Err(RecvError::Closed) => return false,
                },
                state = self.connection.changed() => match state {
                    Some(_) => return true,
                    None => return false,
                },
            }
        }
    }
}

struct ListObserver {
    inner: Arc<Inner>,
    store_rx: broadcast::Receiver<StoreChange>,
    last: Option<Vec<ConversationSummary>>,
}

impl ListObserver {
    async fn next_list(&mut self) -> Option<Vec<ConversationSummary>> {
        let mut first = self.last.is_none();
        loop {
            if !first {
                match self.store_rx.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return None,
                }
            }
            first = false;
            match self.inner.store.summaries_by_recency() {
                Ok(list) if self.last.as_ref() != Some(&list) => {
                    self.last = Some(list.clone());
                    return Some(list);
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to read conversation list: {}", e),
            }
        }
    }
}
