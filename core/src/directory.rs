/// Participant name lookup for new conversation summaries
use std::collections::HashMap;

pub trait ParticipantDirectory: Send + Sync {
    /// Display name of the other party in `conversation_id`
    fn participant_name(&self, conversation_id: &str) -> String;
}

/// Name used when nothing better is known
pub fn fallback_name(conversation_id: &str) -> String {
    format!("User {}", conversation_id)
}

/// Map-backed directory with a fallback for unknown conversations
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    names: HashMap<String, String>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, conversation_id: impl Into<String>, name: impl Into<String>) -> Self {
        self.names.insert(conversation_id.into(), name.into());
        self
    }
}

impl ParticipantDirectory for StaticDirectory {
    fn participant_name(&self, conversation_id: &str) -> String {
        self.names
            .get(conversation_id)
            .cloned()
            .unwrap_or_else(|| fallback_name(conversation_id))
    }
}
