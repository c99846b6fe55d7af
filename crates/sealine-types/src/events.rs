use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ReceiptStatus;

/// Events pushed from server to client over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PushEvent {
    /// Connection accepted, backlog replay follows.
    #[serde(rename = "READY", rename_all = "camelCase")]
    Ready { user_id: Uuid },

    /// A ciphertext envelope for this recipient. Redelivered on every
    /// reconnect until acked; clients deduplicate by (chatId, envelopeId).
    #[serde(rename = "NEW_MESSAGE", rename_all = "camelCase")]
    NewMessage {
        envelope_id: u64,
        chat_id: Uuid,
        sender_id: Uuid,
        /// Base64 ciphertext.
        ciphertext: String,
        server_timestamp: DateTime<Utc>,
    },

    /// The client's unconsumed prekey pool dropped below the low-water mark;
    /// it should upload a fresh batch.
    #[serde(rename = "REPLENISH_REQUESTED", rename_all = "camelCase")]
    ReplenishRequested { remaining: u32 },

    /// A delivery receipt for an envelope this client sent.
    #[serde(rename = "RECEIPT", rename_all = "camelCase")]
    Receipt {
        chat_id: Uuid,
        envelope_id: u64,
        recipient_id: Uuid,
        status: ReceiptStatus,
    },
}

/// Frames sent from client to server over the WebSocket. Parsed as a tagged
/// enum at the boundary; anything that does not deserialize is rejected
/// before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Confirm receipt of an envelope. This is what removes it from the
    /// pending queue; until then it is redelivered on every reconnect.
    #[serde(rename = "ACK", rename_all = "camelCase")]
    Ack { chat_id: Uuid, envelope_id: u64 },

    /// Mark an envelope as read. Forward-only; a READ never regresses.
    #[serde(rename = "READ", rename_all = "camelCase")]
    Read { chat_id: Uuid, envelope_id: u64 },
}
