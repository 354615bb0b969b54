/// Reconciler: merges one conversation's feed events into the local store
///
/// Every event is applied in a single store transaction together with the
/// summary it implies. Events are handled strictly in arrival order; an
/// event whose transaction fails is held and retried before the next one.
use crate::aggregator::{SummaryAggregator, UnreadEffect};
use crate::error::{ConversationError, FeedError, Result};
use crate::feed::FeedStream;
use crate::model::{sort_timeline, FeedEvent, Message};
use crate::status::ConversationErrors;
use crate::store::{ConversationTxn, LocalStore};
use futures_util::StreamExt;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// What applying one event did to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Updated,
    Removed,
    /// Duplicate delivery, identical edit, or removal of an unknown id
    Unchanged,
}

/// Why a reconciliation loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcilerExit {
    /// Unsubscribed by the consumer
    Stopped,
    /// The feed terminated the subscription abnormally
    Cancelled(String),
    /// The feed stream ended
    Ended,
}

pub struct Reconciler {
    conversation_id: String,
    store: LocalStore,
    aggregator: SummaryAggregator,
    pending: VecDeque<FeedEvent>,
}

impl Reconciler {
    pub fn new(conversation_id: impl Into<String>, store: LocalStore, aggregator: SummaryAggregator) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            store,
            aggregator,
            pending: VecDeque::new(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Events waiting for a retry after a store failure
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Handle the next event, retrying held events first
    pub async fn handle(&mut self, event: FeedEvent) -> Result<()> {
        self.pending.push_back(event);
        self.retry_pending().await
    }

    /// Apply held events in order, stopping at the first failure
    pub async fn retry_pending(&mut self) -> Result<()> {
        while let Some(next) = self.pending.front() {
            match self.apply(next).await {
                Ok(applied) => {
                    debug!(
                        "{}: {:?} for {}",
                        self.conversation_id,
                        applied,
                        next.message_id()
                    );
                    self.pending.pop_front();
                }
                Err(e) => {
                    warn!(
                        "{}: store failure, {} event(s) held for retry: {}",
                        self.conversation_id,
                        self.pending.len(),
                        e
                    );
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Apply one event in a single transaction
    pub async fn apply(&self, event: &FeedEvent) -> Result<Applied> {
        let guard = self.store.lock_conversation(&self.conversation_id).await;
        let mut messages = self.store.messages(&self.conversation_id)?;
        let previous = self.store.summary(&self.conversation_id)?;
        let position = messages.iter().position(|m| m.id == event.message_id());

        let (txn, applied) = match (event, position) {
            (FeedEvent::Added { .. }, Some(_)) => return Ok(Applied::Unchanged),
            (FeedEvent::Added { message }, None) | (FeedEvent::Changed { message }, None) => {
                let message = self.owned(message);
                messages.push(message.clone());
                (ConversationTxn::new().insert_or_update_message(message), Applied::Inserted)
            }
            (FeedEvent::Changed { message }, Some(i)) => {
                let existing = &messages[i];
                if existing.text == message.text && existing.timestamp == message.timestamp {
                    return Ok(Applied::Unchanged);
                }
                let updated = Message {
                    text: message.text.clone(),
                    timestamp: message.timestamp,
                    ..existing.clone()
                };
                messages[i] = updated.clone();
                (ConversationTxn::new().insert_or_update_message(updated), Applied::Updated)
            }
            (FeedEvent::Removed { .. }, None) => return Ok(Applied::Unchanged),
            (FeedEvent::Removed { id }, Some(i)) => {
                messages.remove(i);
                (ConversationTxn::new().delete_message(id.clone()), Applied::Removed)
            }
        };

        let effect = match applied {
            Applied::Inserted => self.aggregator.unread_effect(event, true),
            _ => UnreadEffect::Keep,
        };
        sort_timeline(&mut messages);
        let summary = self
            .aggregator
            .recompute(&self.conversation_id, &messages, previous.as_ref(), effect);

        self.store.commit(&guard, txn.upsert_summary(summary)).await?;
        Ok(applied)
    }

    /// The subscription's conversation is authoritative for the row
    fn owned(&self, message: &Message) -> Message {
        let mut message = message.clone();
        if message.conversation_id != self.conversation_id {
            debug!(
                "Message {} tagged {} arrived on {}",
                message.id, message.conversation_id, self.conversation_id
            );
            message.conversation_id = self.conversation_id.clone();
        }
        message
    }

    /// Consume `events` until stopped, cancelled, or the stream ends.
    /// Store failures are recorded on `errors` and cleared on recovery.
    pub async fn run(
        mut self,
        mut events: FeedStream,
        mut stop: oneshot::Receiver<()>,
        errors: ConversationErrors,
    ) -> ReconcilerExit {
        info!("Reconciling {}", self.conversation_id);
        let exit = loop {
            tokio::select! {
                biased;
                _ = &mut stop => break ReconcilerExit::Stopped,
                item = events.next() => match item {
                    Some(Ok(event)) => match self.handle(event).await {
                        Ok(()) => errors.clear_store_failure(&self.conversation_id).await,
                        Err(e) => {
                            errors
                                .set(
                                    &self.conversation_id,
                                    ConversationError::LocalStoreFailure(e.to_string()),
                                )
                                .await
                        }
                    },
                    Some(Err(FeedError::ListenerCancelled(reason))) => {
                        warn!("{}: listener cancelled: {}", self.conversation_id, reason);
                        errors
                            .set(&self.conversation_id, ConversationError::ListenerCancelled(reason.clone()))
                            .await;
                        break ReconcilerExit::Cancelled(reason);
                    }
                    Some(Err(other)) => {
                        warn!("{}: ignoring feed error: {}", self.conversation_id, other);
                    }
                    None => break ReconcilerExit::Ended,
                },
            }
        };
        if !self.pending.is_empty() {
            if let Err(e) = self.retry_pending().await {
                warn!(
                    "{}: dropping {} held event(s): {}",
                    self.conversation_id,
                    self.pending.len(),
                    e
                );
            }
        }
        info!("Stopped reconciling {}: {:?}", self.conversation_id, exit);
        exit
    }
}
