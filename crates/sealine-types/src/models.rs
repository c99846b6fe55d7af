use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered user. The identity key is uploaded once after the first
/// OTP verification and is immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub phone_number: String,
    /// Base64 public identity key, opaque to the server.
    pub identity_key: Option<String>,
    pub registration_id: Option<u32>,
}

/// One unconsumed one-time prekey as uploaded by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKey {
    pub key_id: u32,
    pub public_key: String,
    pub signature: String,
}

/// Identity key plus exactly one claimed one-time prekey. Handing this out
/// consumes the prekey; it is never returned twice.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundle {
    pub user_id: Uuid,
    pub identity_key: String,
    pub registration_id: u32,
    pub prekey: PreKey,
}

/// One ciphertext message unit. `id` is assigned by the server sequencer and
/// is strictly increasing, gapless, within its chat. `created_at` is the
/// server clock and is authoritative for ordering; any client timestamp is
/// display-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: u64,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    #[serde(skip)]
    pub ciphertext: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Delivery receipt status. Transitions are forward-only:
/// Sent -> Delivered -> Read, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiptStatus {
    Sent,
    Delivered,
    Read,
}

impl ReceiptStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Sent => 0,
            Self::Delivered => 1,
            Self::Read => 2,
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Sent),
            1 => Some(Self::Delivered),
            2 => Some(Self::Read),
            _ => None,
        }
    }
}
