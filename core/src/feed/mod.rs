/// Remote feed adapter contract
///
/// A feed exposes one ordered event stream per conversation plus an
/// `append` operation. Events for one conversation are never reordered
/// by the adapter; streams of different conversations are independent.
pub mod memory;

use crate::error::FeedError;
use crate::model::{FeedEvent, Message};
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Events of one subscription. A `ListenerCancelled` error is the last
/// item the stream yields.
pub type FeedStream = BoxStream<'static, std::result::Result<FeedEvent, FeedError>>;

#[async_trait]
pub trait RemoteFeed: Send + Sync {
    /// Start receiving events for a conversation. Existing messages are
    /// delivered first as `Added` events.
    fn subscribe(&self, conversation_id: &str) -> FeedStream;

    /// Release the subscription. Idempotent.
    fn unsubscribe(&self, conversation_id: &str);

    /// Submit a new message. On success the assigned id and timestamp are
    /// returned; the matching `Added` event may arrive before or after.
    async fn append(
        &self,
        conversation_id: &str,
        text: &str,
        sender_id: &str,
    ) -> std::result::Result<Message, FeedError>;
}

pub use memory::MemoryFeed;
