/// Outbound coordinator: admission control and submission of new text
///
/// Never writes to the local store. The accepted message becomes visible
/// when its `Added` event comes back through the reconciler.
use crate::connection::ConnectionWatch;
use crate::error::{FeedError, SendError};
use crate::feed::RemoteFeed;
use crate::model::ConnectionState;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct OutboundCoordinator {
    feed: Arc<dyn RemoteFeed>,
    connection: ConnectionWatch,
    local_user_id: String,
}

impl OutboundCoordinator {
    pub fn new(feed: Arc<dyn RemoteFeed>, connection: ConnectionWatch, local_user_id: impl Into<String>) -> Self {
        Self {
            feed,
            connection,
            local_user_id: local_user_id.into(),
        }
    }

    /// Submit `text` to the conversation. Blank text and a channel that
    /// is not `Connected` are rejected without contacting the remote.
    pub async fn send(&self, conversation_id: &str, text: &str) -> Result<(), SendError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SendError::Empty);
        }

        let state = self.connection.current();
        if state != ConnectionState::Connected {
            debug!("Refusing send to {} while {:?}", conversation_id, state);
            return Err(SendError::NotConnected);
        }

        match self.feed.append(conversation_id, text, &self.local_user_id).await {
            Ok(message) => {
                info!("Message {} accepted in {}", message.id, conversation_id);
                Ok(())
            }
            Err(FeedError::Rejected(reason)) | Err(FeedError::ListenerCancelled(reason)) => {
                info!("Send to {} rejected: {}", conversation_id, reason);
                Err(SendError::RemoteRejected(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionMonitor;
    use crate::feed::MemoryFeed;

    fn coordinator(feed: &MemoryFeed, monitor: &ConnectionMonitor) -> OutboundCoordinator {
        OutboundCoordinator::new(Arc::new(feed.clone()), monitor.watch(), "me")
    }

    #[tokio::test]
    async fn test_blank_text_rejected_first() {
        let feed = MemoryFeed::new();
        let monitor = ConnectionMonitor::new();
        // Blank wins over NotConnected
        assert_eq!(coordinator(&feed, &monitor).send("c1", "  \n\t").await, Err(SendError::Empty));
        assert_eq!(feed.append_calls(), 0);
    }

    #[tokio::test]
    async fn test_not_connected_makes_no_remote_call() {
        let feed = MemoryFeed::new();
        let monitor = ConnectionMonitor::new();
        let outbound = coordinator(&feed, &monitor);

        assert_eq!(outbound.send("c1", "hello").await, Err(SendError::NotConnected));
        monitor.report_liveness(true);
        monitor.report_liveness(false);
        assert_eq!(outbound.send("c1", "hello").await, Err(SendError::NotConnected));
        assert_eq!(feed.append_calls(), 0);
    }

    #[tokio::test]
    async fn test_sends_trimmed_text_as_local_user() {
        let feed = MemoryFeed::new();
        let monitor = ConnectionMonitor::new();
        monitor.report_liveness(true);

        coordinator(&feed, &monitor).send("c1", "  hello  ").await.unwrap();
        let remote = feed.remote_messages("c1");
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].text, "hello");
        assert_eq!(remote[0].sender_id, "me");
    }

    #[tokio::test]
    async fn test_remote_rejection_surfaces_reason() {
        let feed = MemoryFeed::new();
        let monitor = ConnectionMonitor::new();
        monitor.report_liveness(true);
        feed.reject_next_append("permission denied");

        assert_eq!(
            coordinator(&feed, &monitor).send("c1", "hi").await,
            Err(SendError::RemoteRejected("permission denied".to_string()))
        );
        assert!(feed.remote_messages("c1").is_empty());
    }
}
