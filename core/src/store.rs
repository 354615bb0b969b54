/// Local store: messages and conversation summaries in sled
///
/// Two trees share one database so a message write and the summary it
/// implies commit atomically:
///   messages:  <len(conversation_id) u32 BE><conversation_id><message_id> -> Message JSON
///   summaries: "<conversation_id>"               -> ConversationSummary JSON
///
/// Writes are serialized per conversation through `ConversationGuard`.
/// `snapshot` reads messages and summary under the same conversation lock
/// so a reader never pairs a summary with a different message set.
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::model::{sort_by_recency, sort_timeline, ConversationSummary, Message};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, warn};

const MESSAGES_TREE: &str = "messages";
const SUMMARIES_TREE: &str = "summaries";

/// Notification that a conversation's rows changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub conversation_id: String,
}

/// Exclusive write access to one conversation
pub struct ConversationGuard {
    conversation_id: String,
    _guard: OwnedRwLockWriteGuard<()>,
}

impl ConversationGuard {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

/// Writes that must land together for one conversation
#[derive(Debug, Clone, Default)]
pub struct ConversationTxn {
    upsert: Option<Message>,
    delete: Option<String>,
    summary: Option<ConversationSummary>,
}

impl ConversationTxn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_or_update_message(mut self, message: Message) -> Self {
        self.upsert = Some(message);
        self
    }

    pub fn delete_message(mut self, id: impl Into<String>) -> Self {
        self.delete = Some(id.into());
        self
    }

    pub fn upsert_summary(mut self, summary: ConversationSummary) -> Self {
        self.summary = Some(summary);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.upsert.is_none() && self.delete.is_none() && self.summary.is_none()
    }
}

/// Length-prefixed so no conversation id is a key prefix of another's rows
fn message_prefix(conversation_id: &str) -> Vec<u8> {
    let id = conversation_id.as_bytes();
    let mut key = Vec::with_capacity(id.len() + 4);
    key.extend_from_slice(&(id.len() as u32).to_be_bytes());
    key.extend_from_slice(id);
    key
}

fn message_key(conversation_id: &str, message_id: &str) -> Vec<u8> {
    let mut key = message_prefix(conversation_id);
    key.extend_from_slice(message_id.as_bytes());
    key
}

#[derive(Clone)]
pub struct LocalStore {
    db: sled::Db,
    messages: sled::Tree,
    summaries: sled::Tree,
    locks: Arc<Mutex<HashMap<String, Arc<RwLock<()>>>>>,
    changes: broadcast::Sender<StoreChange>,
    flush_on_commit: bool,
    injected_failures: Arc<AtomicUsize>,
}

impl LocalStore {
    /// Open the store described by `config`
    pub fn open(config: &Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        Self::open_path(&config.db_path(), config.event_buffer, config.flush_on_commit)
    }

    /// Open (or create) a store at an explicit path
    pub fn open_path(path: &Path, event_buffer: usize, flush_on_commit: bool) -> Result<Self> {
        debug!("Opening local store at {:?}", path);
        let db = sled::open(path)
            .map_err(|e| SyncError::Storage(format!("Failed to open local store: {}", e)))?;
        let store = Self::from_db(db, event_buffer, flush_on_commit)?;
        info!("Local store initialized at {:?}", path);
        Ok(store)
    }

    /// In-memory store, discarded on drop
    pub fn temporary(event_buffer: usize) -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| SyncError::Storage(format!("Failed to open temporary store: {}", e)))?;
        Self::from_db(db, event_buffer, false)
    }

    fn from_db(db: sled::Db, event_buffer: usize, flush_on_commit: bool) -> Result<Self> {
        let messages = db.open_tree(MESSAGES_TREE)?;
        let summaries = db.open_tree(SUMMARIES_TREE)?;
        let (changes, _) = broadcast::channel(event_buffer.max(1));
        Ok(Self {
            db,
            messages,
            summaries,
            locks: Arc::new(Mutex::new(HashMap::new())),
            changes,
            flush_on_commit,
            injected_failures: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Receive a `StoreChange` after every committed transaction
    pub fn observe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    async fn conversation_lock(&self, conversation_id: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().await;
        // Only the map holds an idle lock
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Serialize writers of one conversation
    pub async fn lock_conversation(&self, conversation_id: &str) -> ConversationGuard {
        let lock = self.conversation_lock(conversation_id).await;
        ConversationGuard {
            conversation_id: conversation_id.to_string(),
            _guard: lock.write_owned().await,
        }
    }

    /// Messages and summary of a conversation as of one committed
    /// transaction. Readers run concurrently; writers wait.
    pub async fn snapshot(
        &self,
        conversation_id: &str,
    ) -> Result<(Vec<Message>, Option<ConversationSummary>)> {
        let lock = self.conversation_lock(conversation_id).await;
        let _read = lock.read().await;
        Ok((self.messages(conversation_id)?, self.summary(conversation_id)?))
    }

    /// Messages of a conversation in timeline order
    pub fn messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let mut out = Vec::new();
        for entry in self.messages.scan_prefix(message_prefix(conversation_id)) {
            let (key, value) = entry?;
            match serde_json::from_slice::<Message>(&value) {
                Ok(msg) => out.push(msg),
                Err(e) => warn!("Skipping unreadable message row {:?}: {}", key, e),
            }
        }
        sort_timeline(&mut out);
        Ok(out)
    }

    pub fn message(&self, conversation_id: &str, message_id: &str) -> Result<Option<Message>> {
        match self.messages.get(message_key(conversation_id, message_id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn summary(&self, conversation_id: &str) -> Result<Option<ConversationSummary>> {
        match self.summaries.get(conversation_id.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// All summaries, newest activity first
    pub fn summaries_by_recency(&self) -> Result<Vec<ConversationSummary>> {
        let mut out = Vec::new();
        for entry in self.summaries.iter() {
            let (key, value) = entry?;
            match serde_json::from_slice::<ConversationSummary>(&value) {
                Ok(summary) => out.push(summary),
                Err(e) => warn!("Skipping unreadable summary row {:?}: {}", key, e),
            }
        }
        sort_by_recency(&mut out);
        Ok(out)
    }

    /// Number of stored messages across all conversations
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    #[cfg(test)]
    async fn tracked_locks(&self) -> usize {
        self.locks.lock().await.len()
    }

    /// Apply `txn` atomically for the guarded conversation
    pub async fn commit(&self, guard: &ConversationGuard, txn: ConversationTxn) -> Result<()> {
        if txn.is_empty() {
            return Ok(());
        }
        let conversation_id = guard.conversation_id();

        if let Some(msg) = &txn.upsert {
            if msg.conversation_id != conversation_id {
                return Err(SyncError::Storage(format!(
                    "message {} belongs to {}, not {}",
                    msg.id, msg.conversation_id, conversation_id
                )));
            }
        }
        if let Some(summary) = &txn.summary {
            if summary.conversation_id != conversation_id {
                return Err(SyncError::Storage(format!(
                    "summary for {} committed under {}",
                    summary.conversation_id, conversation_id
                )));
            }
        }

        if self.take_injected_failure() {
            return Err(SyncError::Storage("injected commit failure".to_string()));
        }

        let upsert = match &txn.upsert {
            Some(msg) => Some((message_key(conversation_id, &msg.id), serde_json::to_vec(msg)?)),
            None => None,
        };
        let delete = txn.delete.as_deref().map(|id| message_key(conversation_id, id));
        let summary = match &txn.summary {
            Some(s) => Some(serde_json::to_vec(s)?),
            None => None,
        };

        let result: std::result::Result<(), TransactionError<()>> = (&self.messages, &self.summaries)
            .transaction(|(messages, summaries)| {
                if let Some((key, value)) = &upsert {
                    messages.insert(key.as_slice(), value.as_slice())?;
                }
                if let Some(key) = &delete {
                    messages.remove(key.as_slice())?;
                }
                if let Some(value) = &summary {
                    summaries.insert(conversation_id.as_bytes(), value.as_slice())?;
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            });
        result.map_err(|e| SyncError::Storage(format!("Failed to commit {}: {:?}", conversation_id, e)))?;

        if self.flush_on_commit {
            self.db
                .flush_async()
                .await
                .map_err(|e| SyncError::Storage(format!("Failed to flush local store: {}", e)))?;
        }

        debug!("Committed transaction for {}", conversation_id);
        let _ = self.changes.send(StoreChange {
            conversation_id: conversation_id.to_string(),
        });
        Ok(())
    }

    /// Make the next `count` commits fail with a storage error.
    /// Used to exercise the reconciler's retry path.
    #[doc(hidden)]
    pub fn inject_commit_failures(&self, count: usize) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(conv: &str, id: &str, ts: i64) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: conv.to_string(),
            text: format!("text {}", id),
            sender_id: "u1".to_string(),
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn test_messages_sorted_by_timestamp_then_id() {
        let store = LocalStore::temporary(16).unwrap();
        let guard = store.lock_conversation("c1").await;
        for m in [msg("c1", "b", 5), msg("c1", "a", 5), msg("c1", "z", 1)] {
            store
                .commit(&guard, ConversationTxn::new().insert_or_update_message(m))
                .await
                .unwrap();
        }

        let ids: Vec<_> = store.messages("c1").unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["z", "a", "b"]);
    }

    #[tokio::test]
    async fn test_conversations_do_not_leak() {
        let store = LocalStore::temporary(16).unwrap();
        let g1 = store.lock_conversation("c1").await;
        store
            .commit(&g1, ConversationTxn::new().insert_or_update_message(msg("c1", "m1", 1)))
            .await
            .unwrap();
        drop(g1);
        // "c1" is a prefix of "c10" but not of its key prefix
        let g10 = store.lock_conversation("c10").await;
        store
            .commit(&g10, ConversationTxn::new().insert_or_update_message(msg("c10", "m2", 2)))
            .await
            .unwrap();

        assert_eq!(store.messages("c1").unwrap().len(), 1);
        assert_eq!(store.messages("c10").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_nul_in_conversation_id_does_not_leak() {
        let store = LocalStore::temporary(16).unwrap();
        let guard = store.lock_conversation("a\0b").await;
        store
            .commit(&guard, ConversationTxn::new().insert_or_update_message(msg("a\0b", "m1", 1)))
            .await
            .unwrap();
        drop(guard);

        assert!(store.messages("a").unwrap().is_empty());
        assert!(store.message("a", "b\0m1").unwrap().is_none());
        assert_eq!(store.messages("a\0b").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_idle_conversation_locks_are_pruned() {
        let store = LocalStore::temporary(16).unwrap();
        for i in 0..20 {
            store.snapshot(&format!("c{}", i)).await.unwrap();
        }
        assert!(store.tracked_locks().await <= 1);

        let held = store.lock_conversation("busy").await;
        store.snapshot("other").await.unwrap();
        store.snapshot("another").await.unwrap();
        assert_eq!(store.tracked_locks().await, 2);
        drop(held);
    }

    #[tokio::test]
    async fn test_commit_rejects_foreign_rows() {
        let store = LocalStore::temporary(16).unwrap();
        let guard = store.lock_conversation("c1").await;
        let err = store
            .commit(&guard, ConversationTxn::new().insert_or_update_message(msg("c2", "m1", 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_injected_failure_leaves_store_untouched() {
        let store = LocalStore::temporary(16).unwrap();
        let mut changes = store.observe();
        store.inject_commit_failures(1);

        let guard = store.lock_conversation("c1").await;
        let txn = ConversationTxn::new()
            .insert_or_update_message(msg("c1", "m1", 1))
            .upsert_summary(ConversationSummary::empty("c1", "Alice"));
        assert!(store.commit(&guard, txn.clone()).await.is_err());
        assert!(store.messages("c1").unwrap().is_empty());
        assert!(changes.try_recv().is_err());

        store.commit(&guard, txn).await.unwrap();
        assert_eq!(store.messages("c1").unwrap().len(), 1);
        assert_eq!(changes.try_recv().unwrap().conversation_id, "c1");
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatsync.db");
        {
            let store = LocalStore::open_path(&path, 16, true).unwrap();
            let guard = store.lock_conversation("c1").await;
            let txn = ConversationTxn::new()
                .insert_or_update_message(msg("c1", "m1", 7))
                .upsert_summary(ConversationSummary::empty("c1", "Alice"));
            store.commit(&guard, txn).await.unwrap();
        }

        let store = LocalStore::open_path(&path, 16, true).unwrap();
        assert_eq!(store.messages("c1").unwrap()[0].timestamp, 7);
        assert_eq!(store.summary("c1").unwrap().unwrap().participant_name, "Alice");
    }
}
