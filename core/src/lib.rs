/// ChatSync - conversation synchronization core
///
/// Keeps a per-conversation message timeline and summary consistent
/// between a durable local store and an intermittently connected remote
/// feed, with a connection-liveness signal gating outbound writes.

pub mod error;
pub mod config;
pub mod model;
pub mod connection;
pub mod store;
pub mod directory;
pub mod aggregator;
pub mod feed;
pub mod reconciler;
pub mod outbound;
pub mod status;
pub mod engine;

pub use config::Config;
pub use engine::ChatSync;
pub use error::{ConversationError, FeedError, Result, SendError, SyncError};
pub use model::{ConnectionState, ConversationSummary, ConversationView, FeedEvent, Message};
