/// Summary aggregation: last-message preview and unread accounting
use crate::directory::ParticipantDirectory;
use crate::error::Result;
use crate::model::{ConversationSummary, FeedEvent, Message};
use crate::store::{ConversationGuard, ConversationTxn, LocalStore};
use std::sync::Arc;
use tracing::debug;

/// How an applied event affects the unread count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreadEffect {
    Increment,
    Keep,
    Reset,
}

/// Derive a summary from the post-update message set.
///
/// `messages` need not be sorted. Preview and timestamp come from the
/// message that sorts last in timeline order.
pub fn summarize(
    conversation_id: &str,
    participant_name: &str,
    messages: &[Message],
    previous_unread: u32,
    effect: UnreadEffect,
    preview_max_chars: Option<usize>,
) -> ConversationSummary {
    let latest = messages.iter().max_by(|a, b| a.timeline_cmp(b));
    let unread_count = match effect {
        UnreadEffect::Increment => previous_unread.saturating_add(1),
        UnreadEffect::Keep => previous_unread,
        UnreadEffect::Reset => 0,
    };

    ConversationSummary {
        conversation_id: conversation_id.to_string(),
        participant_name: participant_name.to_string(),
        last_message_preview: latest.map(|m| preview(&m.text, preview_max_chars)),
        last_message_timestamp: latest.map(|m| m.timestamp).unwrap_or(0),
        unread_count,
    }
}

fn preview(text: &str, max_chars: Option<usize>) -> String {
    match max_chars {
        Some(n) => text.chars().take(n).collect(),
        None => text.to_string(),
    }
}

#[derive(Clone)]
pub struct SummaryAggregator {
    local_user_id: String,
    preview_max_chars: Option<usize>,
    directory: Arc<dyn ParticipantDirectory>,
}

impl SummaryAggregator {
    pub fn new(
        local_user_id: impl Into<String>,
        preview_max_chars: Option<usize>,
        directory: Arc<dyn ParticipantDirectory>,
    ) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            preview_max_chars,
            directory,
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Only a newly inserted `Added` message from someone else counts.
    /// Redelivered duplicates, edits and removals never touch the count.
    pub fn unread_effect(&self, event: &FeedEvent, inserted: bool) -> UnreadEffect {
        match event {
            FeedEvent::Added { message } if inserted && message.sender_id != self.local_user_id => {
                UnreadEffect::Increment
            }
            _ => UnreadEffect::Keep,
        }
    }

    /// Summary for `messages`, keeping the participant name of `previous`
    /// or asking the directory when the conversation has none yet.
    pub fn recompute(
        &self,
        conversation_id: &str,
        messages: &[Message],
        previous: Option<&ConversationSummary>,
        effect: UnreadEffect,
    ) -> ConversationSummary {
        let participant_name = match previous {
            Some(p) => p.participant_name.clone(),
            None => self.directory.participant_name(conversation_id),
        };
        summarize(
            conversation_id,
            &participant_name,
            messages,
            previous.map(|p| p.unread_count).unwrap_or(0),
            effect,
            self.preview_max_chars,
        )
    }

    /// Fallback summary for a conversation the store has not seen
    pub fn placeholder(&self, conversation_id: &str) -> ConversationSummary {
        ConversationSummary::empty(conversation_id, self.directory.participant_name(conversation_id))
    }

    /// Reset the unread count to zero. No-op for unknown conversations.
    pub async fn mark_read(&self, store: &LocalStore, conversation_id: &str) -> Result<()> {
        let guard = store.lock_conversation(conversation_id).await;
        self.mark_read_locked(store, &guard).await
    }

    async fn mark_read_locked(&self, store: &LocalStore, guard: &ConversationGuard) -> Result<()> {
        let conversation_id = guard.conversation_id();
        let Some(mut summary) = store.summary(conversation_id)? else {
            debug!("mark_read on {} without a summary", conversation_id);
            return Ok(());
        };
        if summary.unread_count == 0 {
            return Ok(());
        }
        summary.unread_count = 0;
        store
            .commit(guard, ConversationTxn::new().upsert_summary(summary))
            .await?;
        debug!("Marked {} read", conversation_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;

    fn msg(id: &str, sender: &str, ts: i64, text: &str) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            text: text.to_string(),
            sender_id: sender.to_string(),
            timestamp: ts,
        }
    }

    fn aggregator() -> SummaryAggregator {
        SummaryAggregator::new("me", None, Arc::new(StaticDirectory::new().with("c1", "Alice")))
    }

    #[test]
    fn test_empty_set_has_no_preview() {
        let s = summarize("c1", "Alice", &[], 3, UnreadEffect::Keep, None);
        assert_eq!(s.last_message_preview, None);
        assert_eq!(s.last_message_timestamp, 0);
        assert_eq!(s.unread_count, 3);
    }

    #[test]
    fn test_latest_by_timestamp_regardless_of_order() {
        let messages = vec![msg("m2", "u1", 9, "late"), msg("m1", "u1", 2, "early")];
        let s = summarize("c1", "Alice", &messages, 0, UnreadEffect::Keep, None);
        assert_eq!(s.last_message_preview.as_deref(), Some("late"));
        assert_eq!(s.last_message_timestamp, 9);
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let messages = vec![msg("m1", "u1", 1, "héllo wörld")];
        let s = summarize("c1", "Alice", &messages, 0, UnreadEffect::Keep, Some(4));
        assert_eq!(s.last_message_preview.as_deref(), Some("héll"));
    }

    #[test]
    fn test_unread_effect() {
        let agg = aggregator();
        let theirs = FeedEvent::added(msg("m1", "u1", 1, "hi"));
        let mine = FeedEvent::added(msg("m2", "me", 2, "yo"));

        assert_eq!(agg.unread_effect(&theirs, true), UnreadEffect::Increment);
        assert_eq!(agg.unread_effect(&theirs, false), UnreadEffect::Keep);
        assert_eq!(agg.unread_effect(&mine, true), UnreadEffect::Keep);
        assert_eq!(
            agg.unread_effect(&FeedEvent::changed(msg("m1", "u1", 1, "x")), true),
            UnreadEffect::Keep
        );
        assert_eq!(agg.unread_effect(&FeedEvent::removed("m1"), true), UnreadEffect::Keep);
    }

    #[test]
    fn test_recompute_keeps_participant_name() {
        let agg = aggregator();
        let first = agg.recompute("c1", &[msg("m1", "u1", 1, "hi")], None, UnreadEffect::Increment);
        assert_eq!(first.participant_name, "Alice");

        let mut renamed = first.clone();
        renamed.participant_name = "Alice B.".to_string();
        let next = agg.recompute("c1", &[], Some(&renamed), UnreadEffect::Keep);
        assert_eq!(next.participant_name, "Alice B.");
        assert_eq!(next.unread_count, 1);
    }

    #[tokio::test]
    async fn test_mark_read_resets_to_zero() {
        let store = LocalStore::temporary(16).unwrap();
        let agg = aggregator();
        {
            let guard = store.lock_conversation("c1").await;
            let mut summary = agg.placeholder("c1");
            summary.unread_count = 4;
            store
                .commit(&guard, ConversationTxn::new().upsert_summary(summary))
                .await
                .unwrap();
        }

        agg.mark_read(&store, "c1").await.unwrap();
        assert_eq!(store.summary("c1").unwrap().unwrap().unread_count, 0);

        // Unknown conversation stays unknown
        agg.mark_read(&store, "nope").await.unwrap();
        assert!(store.summary("nope").unwrap().is_none());
    }
}
