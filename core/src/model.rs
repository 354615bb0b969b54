/// Shared types for the sync core
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One chat message as accepted by the remote log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Globally unique, assigned by the remote log on acceptance
    pub id: String,
    pub conversation_id: String,
    pub text: String,
    pub sender_id: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl Message {
    /// Timeline order: ascending timestamp, ties broken by id
    pub fn timeline_cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Sort messages into timeline order
pub fn sort_timeline(messages: &mut [Message]) {
    messages.sort_by(Message::timeline_cmp);
}

/// Summary of one conversation thread (for the list view)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: String,
    /// Supplied once at creation by the participant directory
    pub participant_name: String,
    /// Text of the newest message, `None` when the conversation is empty
    pub last_message_preview: Option<String>,
    /// Timestamp of the newest message, 0 when empty
    pub last_message_timestamp: i64,
    pub unread_count: u32,
}

impl ConversationSummary {
    /// Summary for a conversation with no messages yet
    pub fn empty(conversation_id: impl Into<String>, participant_name: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            participant_name: participant_name.into(),
            last_message_preview: None,
            last_message_timestamp: 0,
            unread_count: 0,
        }
    }
}

/// List order: newest activity first, ties by conversation id
pub fn sort_by_recency(summaries: &mut [ConversationSummary]) {
    summaries.sort_by(|a, b| {
        b.last_message_timestamp
            .cmp(&a.last_message_timestamp)
            .then_with(|| a.conversation_id.cmp(&b.conversation_id))
    });
}

/// Liveness of the remote channel, shared by all conversations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Startup, or after an explicit resubscribe
    Connecting,
    /// Liveness reports the channel reachable
    Connected,
    /// Liveness reports the channel unreachable
    Disconnected,
    /// Explicit adapter-level cancellation; terminal until resubscribe
    Error,
}

/// Event delivered by a conversation's remote feed subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    Added { message: Message },
    Changed { message: Message },
    Removed { id: String },
}

impl FeedEvent {
    pub fn added(message: Message) -> Self {
        FeedEvent::Added { message }
    }

    pub fn changed(message: Message) -> Self {
        FeedEvent::Changed { message }
    }

    pub fn removed(id: impl Into<String>) -> Self {
        FeedEvent::Removed { id: id.into() }
    }

    /// Id of the message this event targets
    pub fn message_id(&self) -> &str {
        match self {
            FeedEvent::Added { message } | FeedEvent::Changed { message } => &message.id,
            FeedEvent::Removed { id } => id,
        }
    }
}

/// Snapshot of one conversation as observed by the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    /// Timeline order
    pub messages: Vec<Message>,
    pub summary: ConversationSummary,
    pub connection_state: ConnectionState,
    /// `<kind>: <detail>` when the conversation has a listener or store error
    pub error: Option<String>,
}
