/// In-process remote feed
///
/// Keeps an ordered log per conversation and pushes events to at most one
/// subscriber per conversation. While the channel is down, or while a
/// conversation is held, events queue up and are flushed in order once
/// delivery resumes. Subscribing replays the current message set as
/// `Added` events, which is the redelivery a reconnecting client sees,
/// followed by the edits and removals made since the last subscriber of
/// that conversation went away.
use super::{FeedStream, RemoteFeed};
use crate::error::FeedError;
use crate::model::{FeedEvent, Message};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

type Item = std::result::Result<FeedEvent, FeedError>;

#[derive(Default)]
struct MemoryState {
    /// Current messages per conversation, in acceptance order
    logs: HashMap<String, Vec<Message>>,
    last_timestamp: HashMap<String, i64>,
    subscribers: HashMap<String, mpsc::UnboundedSender<Item>>,
    queued: HashMap<String, Vec<FeedEvent>>,
    /// Edits and removals made while a previously subscribed
    /// conversation had no subscriber
    missed: HashMap<String, Vec<FeedEvent>>,
    known: HashSet<String>,
    held: HashSet<String>,
    reject_next: Option<String>,
}

impl MemoryState {
    fn can_deliver(&self, alive: bool, conversation_id: &str) -> bool {
        alive && !self.held.contains(conversation_id)
    }

    /// Apply an event to the log so later snapshots reflect it
    fn record(&mut self, conversation_id: &str, event: &FeedEvent) {
        let log = self.logs.entry(conversation_id.to_string()).or_default();
        match event {
            FeedEvent::Added { message } => {
                if !log.iter().any(|m| m.id == message.id) {
                    log.push(message.clone());
                }
            }
            FeedEvent::Changed { message } => match log.iter_mut().find(|m| m.id == message.id) {
                Some(existing) => *existing = message.clone(),
                None => log.push(message.clone()),
            },
            FeedEvent::Removed { id } => log.retain(|m| &m.id != id),
        }
    }

    fn dispatch(&mut self, alive: bool, conversation_id: &str, event: FeedEvent) {
        if !self.subscribers.contains_key(conversation_id) {
            if self.known.contains(conversation_id) && !matches!(event, FeedEvent::Added { .. }) {
                self.missed
                    .entry(conversation_id.to_string())
                    .or_default()
                    .push(event);
            }
            return;
        }
        if !self.can_deliver(alive, conversation_id) {
            self.queued
                .entry(conversation_id.to_string())
                .or_default()
                .push(event);
            return;
        }
        self.send(conversation_id, Ok(event));
    }

    fn send(&mut self, conversation_id: &str, item: Item) {
        let closed = match self.subscribers.get(conversation_id) {
            Some(tx) => tx.send(item).is_err(),
            None => false,
        };
        if closed {
            debug!("Subscriber for {} went away", conversation_id);
            self.subscribers.remove(conversation_id);
            self.park(conversation_id);
        }
    }

    /// Keep undelivered edits and removals for the next subscriber.
    /// Undelivered `Added` events are covered by the snapshot replay.
    fn park(&mut self, conversation_id: &str) {
        if let Some(events) = self.queued.remove(conversation_id) {
            let kept = events
                .into_iter()
                .filter(|e| !matches!(e, FeedEvent::Added { .. }));
            self.missed
                .entry(conversation_id.to_string())
                .or_default()
                .extend(kept);
        }
    }

    fn flush(&mut self, alive: bool, conversation_id: &str) {
        if !self.can_deliver(alive, conversation_id) {
            return;
        }
        if let Some(events) = self.queued.remove(conversation_id) {
            for event in events {
                self.send(conversation_id, Ok(event));
            }
        }
    }
}

#[derive(Clone)]
pub struct MemoryFeed {
    state: Arc<Mutex<MemoryState>>,
    liveness: Arc<watch::Sender<bool>>,
    append_calls: Arc<AtomicUsize>,
}

impl MemoryFeed {
    /// New feed whose channel starts reachable
    pub fn new() -> Self {
        let (liveness, _) = watch::channel(true);
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            liveness: Arc::new(liveness),
            append_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_alive(&self) -> bool {
        *self.liveness.borrow()
    }

    /// Liveness samples: the current value followed by every change
    pub fn liveness(&self) -> BoxStream<'static, bool> {
        let mut rx = self.liveness.subscribe();
        let first = *rx.borrow_and_update();
        stream::once(async move { first })
            .chain(stream::unfold(rx, |mut rx| async move {
                rx.changed().await.ok()?;
                let alive = *rx.borrow_and_update();
                Some((alive, rx))
            }))
            .boxed()
    }

    /// Flip reachability. Going up flushes everything queued meanwhile.
    pub fn set_alive(&self, alive: bool) {
        info!("Memory feed {}", if alive { "reachable" } else { "unreachable" });
        let mut state = self.lock();
        self.liveness.send_replace(alive);
        if alive {
            let ids: Vec<String> = state.queued.keys().cloned().collect();
            for id in ids {
                state.flush(alive, &id);
            }
        }
    }

    /// Queue events of one conversation until `release`
    pub fn hold(&self, conversation_id: &str) {
        self.lock().held.insert(conversation_id.to_string());
    }

    pub fn release(&self, conversation_id: &str) {
        let alive = self.is_alive();
        let mut state = self.lock();
        state.held.remove(conversation_id);
        state.flush(alive, conversation_id);
    }

    /// Make the next `append` fail with `Rejected(reason)`
    pub fn reject_next_append(&self, reason: impl Into<String>) {
        self.lock().reject_next = Some(reason.into());
    }

    /// Terminate the conversation's subscription with `ListenerCancelled`
    pub fn cancel_listener(&self, conversation_id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Cancelling listener for {}: {}", conversation_id, reason);
        let mut state = self.lock();
        state.park(conversation_id);
        if let Some(tx) = state.subscribers.remove(conversation_id) {
            let _ = tx.send(Err(FeedError::ListenerCancelled(reason)));
        }
    }

    /// Push an arbitrary event, as if another client caused it
    pub fn inject(&self, conversation_id: &str, event: FeedEvent) {
        let alive = self.is_alive();
        let mut state = self.lock();
        state.record(conversation_id, &event);
        if let FeedEvent::Added { message } | FeedEvent::Changed { message } = &event {
            let last = state
                .last_timestamp
                .entry(conversation_id.to_string())
                .or_insert(0);
            *last = (*last).max(message.timestamp);
        }
        state.dispatch(alive, conversation_id, event);
    }

    /// Re-send the current message set as `Added` events to the live subscriber
    pub fn redeliver(&self, conversation_id: &str) {
        let alive = self.is_alive();
        let mut state = self.lock();
        let snapshot = state.logs.get(conversation_id).cloned().unwrap_or_default();
        for message in snapshot {
            state.dispatch(alive, conversation_id, FeedEvent::added(message));
        }
    }

    /// Messages currently in the remote log
    pub fn remote_messages(&self, conversation_id: &str) -> Vec<Message> {
        self.lock()
            .logs
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of `append` calls made so far, accepted or not
    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self, conversation_id: &str) -> bool {
        self.lock().subscribers.contains_key(conversation_id)
    }

    fn next_timestamp(state: &mut MemoryState, conversation_id: &str) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let last = state
            .last_timestamp
            .entry(conversation_id.to_string())
            .or_insert(0);
        *last = now.max(*last + 1);
        *last
    }
}

impl Default for MemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteFeed for MemoryFeed {
    fn subscribe(&self, conversation_id: &str) -> FeedStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();

        state.park(conversation_id);
        let snapshot = state.logs.get(conversation_id).cloned().unwrap_or_default();
        for message in snapshot {
            let _ = tx.send(Ok(FeedEvent::added(message)));
        }
        let missed = state.missed.remove(conversation_id).unwrap_or_default();
        if !missed.is_empty() {
            debug!("Replaying {} missed event(s) for {}", missed.len(), conversation_id);
        }
        for event in missed {
            let _ = tx.send(Ok(event));
        }
        state.known.insert(conversation_id.to_string());
        if state
            .subscribers
            .insert(conversation_id.to_string(), tx)
            .is_some()
        {
            debug!("Replaced existing subscriber for {}", conversation_id);
        }
        info!("Subscribed to {}", conversation_id);

        stream::unfold(rx, |mut rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        })
        .boxed()
    }

    fn unsubscribe(&self, conversation_id: &str) {
        let mut state = self.lock();
        state.park(conversation_id);
        if state.subscribers.remove(conversation_id).is_some() {
            info!("Unsubscribed from {}", conversation_id);
        }
    }

    async fn append(
        &self,
        conversation_id: &str,
        text: &str,
        sender_id: &str,
    ) -> std::result::Result<Message, FeedError> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        let alive = self.is_alive();
        let mut state = self.lock();

        if let Some(reason) = state.reject_next.take() {
            return Err(FeedError::Rejected(reason));
        }
        if !alive {
            return Err(FeedError::Rejected("channel unreachable".to_string()));
        }

        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            text: text.to_string(),
            sender_id: sender_id.to_string(),
            timestamp: Self::next_timestamp(&mut state, conversation_id),
        };
        let event = FeedEvent::added(message.clone());
        state.record(conversation_id, &event);
        state.dispatch(alive, conversation_id, event);
        debug!("Accepted {} in {}", message.id, conversation_id);
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, ts: i64) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            text: id.to_string(),
            sender_id: "u1".to_string(),
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn test_subscribe_replays_log() {
        let feed = MemoryFeed::new();
        feed.inject("c1", FeedEvent::added(msg("m1", 1)));
        feed.inject("c1", FeedEvent::added(msg("m2", 2)));
        feed.inject("c1", FeedEvent::removed("m1"));

        let mut events = feed.subscribe("c1");
        assert_eq!(events.next().await, Some(Ok(FeedEvent::added(msg("m2", 2)))));
    }

    #[tokio::test]
    async fn test_queued_while_down() {
        let feed = MemoryFeed::new();
        let mut events = feed.subscribe("c1");
        feed.set_alive(false);
        feed.inject("c1", FeedEvent::added(msg("m1", 1)));
        feed.inject("c1", FeedEvent::removed("m1"));
        feed.set_alive(true);

        assert_eq!(events.next().await, Some(Ok(FeedEvent::added(msg("m1", 1)))));
        assert_eq!(events.next().await, Some(Ok(FeedEvent::removed("m1"))));
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_timestamps() {
        let feed = MemoryFeed::new();
        let a = feed.append("c1", "one", "me").await.unwrap();
        let b = feed.append("c1", "two", "me").await.unwrap();
        assert!(b.timestamp > a.timestamp);
        assert_ne!(a.id, b.id);
        assert_eq!(feed.remote_messages("c1").len(), 2);
    }

    #[tokio::test]
    async fn test_rejection_and_cancel() {
        let feed = MemoryFeed::new();
        feed.reject_next_append("quota");
        assert_eq!(
            feed.append("c1", "x", "me").await,
            Err(FeedError::Rejected("quota".to_string()))
        );

        let mut events = feed.subscribe("c1");
        feed.cancel_listener("c1", "permission denied");
        assert_eq!(
            events.next().await,
            Some(Err(FeedError::ListenerCancelled("permission denied".to_string())))
        );
        assert_eq!(events.next().await, None);
        assert!(!feed.is_subscribed("c1"));
    }

    #[tokio::test]
    async fn test_resubscribe_replays_missed_edits_and_removals() {
        let feed = MemoryFeed::new();
        feed.inject("c1", FeedEvent::added(msg("m1", 1)));
        feed.inject("c1", FeedEvent::added(msg("m2", 2)));
        drop(feed.subscribe("c1"));
        feed.unsubscribe("c1");

        let mut edited = msg("m1", 1);
        edited.text = "edited".to_string();
        feed.inject("c1", FeedEvent::changed(edited.clone()));
        feed.inject("c1", FeedEvent::removed("m2"));
        feed.inject("c1", FeedEvent::added(msg("m3", 3)));

        let mut events = feed.subscribe("c1");
        assert_eq!(events.next().await, Some(Ok(FeedEvent::added(edited.clone()))));
        assert_eq!(events.next().await, Some(Ok(FeedEvent::added(msg("m3", 3)))));
        assert_eq!(events.next().await, Some(Ok(FeedEvent::changed(edited))));
        assert_eq!(events.next().await, Some(Ok(FeedEvent::removed("m2"))));
    }

    #[tokio::test]
    async fn test_never_subscribed_keeps_no_backlog() {
        let feed = MemoryFeed::new();
        feed.inject("c1", FeedEvent::added(msg("m1", 1)));
        feed.inject("c1", FeedEvent::removed("m1"));
        feed.inject("c1", FeedEvent::added(msg("m2", 2)));

        let mut events = feed.subscribe("c1");
        assert_eq!(events.next().await, Some(Ok(FeedEvent::added(msg("m2", 2)))));
        feed.unsubscribe("c1");
        assert_eq!(events.next().await, None);
    }
}
