use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use sealine_db::Database;
use sealine_db::models::EnvelopeRow;
use sealine_types::error::RelayError;
use sealine_types::models::Envelope;

/// Durable per-recipient queue of undelivered ciphertext envelopes.
///
/// Delivery is at-least-once, never at-most-once: an envelope is only
/// removed by an explicit ack from its recipient, and is redelivered on
/// every reconnect until then. Duplicates are acceptable; loss is not.
#[derive(Clone)]
pub struct PendingQueue {
    db: Arc<Database>,
}

impl PendingQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Durable append. The write commits before the sender is acknowledged;
    /// a failure here means the send is reported as failed, never silently
    /// dropped.
    pub async fn enqueue(&self, envelope: &Envelope) -> Result<(), RelayError> {
        let db = self.db.clone();
        let row = envelope_to_row(envelope);
        tokio::task::spawn_blocking(move || db.insert_envelope(&row))
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .map_err(|e| RelayError::StorageWrite(e.to_string()))
    }

    /// All undelivered envelopes for a recipient in ascending (chat, id)
    /// order — the resync mechanism after reconnect.
    pub async fn drain(&self, recipient_id: Uuid) -> Result<Vec<Envelope>, RelayError> {
        let db = self.db.clone();
        let rid = recipient_id.to_string();
        let rows = tokio::task::spawn_blocking(move || db.drain_envelopes(&rid))
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .map_err(|e| RelayError::Internal(e.to_string()))?;
        rows.iter().map(row_to_envelope).collect()
    }

    /// Remove an envelope after its recipient confirmed receipt. Idempotent:
    /// re-acking a purged id returns false and changes nothing.
    pub async fn ack(
        &self,
        chat_id: Uuid,
        envelope_id: u64,
        recipient_id: Uuid,
    ) -> Result<bool, RelayError> {
        let db = self.db.clone();
        let cid = chat_id.to_string();
        let rid = recipient_id.to_string();
        tokio::task::spawn_blocking(move || db.delete_envelope(&cid, envelope_id as i64, &rid))
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .map_err(|e| RelayError::Internal(e.to_string()))
    }
}

fn envelope_to_row(env: &Envelope) -> EnvelopeRow {
    EnvelopeRow {
        chat_id: env.chat_id.to_string(),
        id: env.id as i64,
        sender_id: env.sender_id.to_string(),
        recipient_id: env.recipient_id.to_string(),
        ciphertext: env.ciphertext.clone(),
        created_at: env.created_at.to_rfc3339(),
    }
}

fn row_to_envelope(row: &EnvelopeRow) -> Result<Envelope, RelayError> {
    let parse_uuid = |s: &str| {
        s.parse::<Uuid>()
            .map_err(|e| RelayError::Internal(format!("corrupt uuid '{}': {}", s, e)))
    };
    Ok(Envelope {
        id: row.id as u64,
        chat_id: parse_uuid(&row.chat_id)?,
        sender_id: parse_uuid(&row.sender_id)?,
        recipient_id: parse_uuid(&row.recipient_id)?,
        ciphertext: row.ciphertext.clone(),
        created_at: DateTime::parse_from_rfc3339(&row.created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                RelayError::Internal(format!("corrupt created_at '{}': {}", row.created_at, e))
            })?,
    })
}
