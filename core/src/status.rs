/// Per-conversation error board shared by reconcilers and observers
use crate::error::ConversationError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

#[derive(Clone)]
pub struct ConversationErrors {
    errors: Arc<RwLock<HashMap<String, ConversationError>>>,
    changes: broadcast::Sender<String>,
}

impl ConversationErrors {
    pub fn new(buffer: usize) -> Self {
        let (changes, _) = broadcast::channel(buffer.max(1));
        Self {
            errors: Arc::new(RwLock::new(HashMap::new())),
            changes,
        }
    }

    /// Receive the conversation id whenever its error changes
    pub fn observe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }

    pub async fn get(&self, conversation_id: &str) -> Option<ConversationError> {
        self.errors.read().await.get(conversation_id).cloned()
    }

    pub async fn set(&self, conversation_id: &str, error: ConversationError) {
        let changed = {
            let mut errors = self.errors.write().await;
            errors.insert(conversation_id.to_string(), error.clone()) != Some(error)
        };
        if changed {
            let _ = self.changes.send(conversation_id.to_string());
        }
    }

    pub async fn clear(&self, conversation_id: &str) {
        let removed = self.errors.write().await.remove(conversation_id).is_some();
        if removed {
            let _ = self.changes.send(conversation_id.to_string());
        }
    }

    /// Clear only a store failure, leaving a listener error in place
    pub async fn clear_store_failure(&self, conversation_id: &str) {
        let removed = {
            let mut errors = self.errors.write().await;
            match errors.get(conversation_id) {
                Some(ConversationError::LocalStoreFailure(_)) => {
                    errors.remove(conversation_id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            let _ = self.changes.send(conversation_id.to_string());
        }
    }
}
