/// Error types for the conversation sync core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A Local Store transaction could not complete
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Listener cancelled for {conversation_id}: {reason}")]
    ListenerCancelled {
        conversation_id: String,
        reason: String,
    },
}

impl From<sled::Error> for SyncError {
    fn from(e: sled::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Outcome of a rejected `send`. Recoverable by user retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,

    #[error("message is empty")]
    Empty,

    #[error("remote rejected message: {0}")]
    RemoteRejected(String),
}

/// Failures reported by a remote feed adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// The remote accepted the attempt but declined the write
    #[error("rejected: {0}")]
    Rejected(String),

    /// The subscription terminated abnormally (permission or protocol failure)
    #[error("listener cancelled: {0}")]
    ListenerCancelled(String),
}

/// Conversation-scoped error surfaced on the observable view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationError {
    ListenerCancelled(String),
    LocalStoreFailure(String),
}

impl ConversationError {
    /// Stable identifier the UI can branch on
    pub fn kind(&self) -> &'static str {
        match self {
            ConversationError::ListenerCancelled(_) => "listener_cancelled",
            ConversationError::LocalStoreFailure(_) => "local_store_failure",
        }
    }
}

impl std::fmt::Display for ConversationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversationError::ListenerCancelled(reason) => {
                write!(f, "{}: {}", self.kind(), reason)
            }
            ConversationError::LocalStoreFailure(reason) => {
                write!(f, "{}: {}", self.kind(), reason)
            }
        }
    }
}
