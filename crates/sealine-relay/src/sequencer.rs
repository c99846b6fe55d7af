use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use sealine_db::Database;
use sealine_types::error::RelayError;

/// Assigns the strictly increasing, gapless per-chat envelope id at the
/// server boundary, so clients can detect gaps and duplicates regardless of
/// client clock skew.
///
/// Increments for the same chat are serialized through a per-chat mutex;
/// independent chats do not contend. The counter itself is the durable
/// `chats.last_seq` column, advanced in a single UPDATE.
#[derive(Clone)]
pub struct OrderingSequencer {
    db: Arc<Database>,
    /// One entry per chat ever stamped, never evicted. A few dozen bytes
    /// per chat; a sweep would only matter at millions of chats.
    locks: Arc<RwLock<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl OrderingSequencer {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            locks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn next(&self, chat_id: Uuid) -> Result<u64, RelayError> {
        let lock = self.chat_lock(chat_id).await;
        let _guard = lock.lock().await;
        self.advance(chat_id).await
    }

    /// Counter advance without the chat lock. Callers that must pin other
    /// per-pair state to the stamp order hold the guard from `chat_lock`
    /// across the advance and that state change; a stamp recorded outside
    /// the guard could land out of order.
    pub(crate) async fn advance(&self, chat_id: Uuid) -> Result<u64, RelayError> {
        let db = self.db.clone();
        let id = chat_id.to_string();
        let seq = tokio::task::spawn_blocking(move || db.next_chat_seq(&id))
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .map_err(|e| RelayError::StorageWrite(e.to_string()))?;

        match seq {
            Some(seq) => Ok(seq as u64),
            None => Err(RelayError::ChatNotFound(chat_id)),
        }
    }

    pub(crate) async fn chat_lock(&self, chat_id: Uuid) -> Arc<Mutex<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(&chat_id) {
                return lock.clone();
            }
        }
        let mut locks = self.locks.write().await;
        locks.entry(chat_id).or_default().clone()
    }
}
