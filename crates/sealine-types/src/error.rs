use thiserror::Error;
use uuid::Uuid;

/// Relay failure taxonomy. Everything that could silently drop a message is
/// funneled into a retry path instead: `DeliveryTimeout` leaves the envelope
/// queued, `StorageWrite` refuses to acknowledge the send so the sender
/// retries.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No unconsumed one-time prekey remains for this user. The owner is
    /// asked to replenish on next connect.
    #[error("No unconsumed prekeys remain for {0}")]
    KeyExhausted(Uuid),

    /// No session exists for this pair yet; the sender must fetch a prekey
    /// bundle first.
    #[error("No session with {0}; fetch a prekey bundle first")]
    SessionMissing(Uuid),

    /// The pair is flagged out of sync; sends are rejected until the sender
    /// re-establishes via a fresh bundle fetch.
    #[error("Session with {0} is out of sync; re-establish via bundle fetch")]
    SessionDesync(Uuid),

    /// Prekey upload reused a key id; the whole batch is rejected and the
    /// client must resubmit with fresh ids.
    #[error("Duplicate prekey id {0}")]
    DuplicateKeyId(u32),

    /// Identity keys are immutable; re-registration with different material
    /// is refused.
    #[error("Identity key already registered for {0}")]
    IdentityConflict(Uuid),

    /// A live push was not acked within the timeout. Internal only: the
    /// envelope is durably queued and redelivered on the next drain, so this
    /// is never surfaced to the sender as a failure.
    #[error("Push of envelope {envelope_id} to {recipient_id} timed out")]
    DeliveryTimeout { recipient_id: Uuid, envelope_id: u64 },

    /// Durable write failed; the send is not acknowledged.
    #[error("Storage write failed: {0}")]
    StorageWrite(String),

    #[error("Unknown user {0}")]
    UnknownUser(Uuid),

    #[error("Chat {0} not found")]
    ChatNotFound(Uuid),

    #[error("Not a participant of chat {0}")]
    NotChatMember(Uuid),

    #[error("Invalid or expired verification code")]
    InvalidCode,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Stable machine-readable code carried in error responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::KeyExhausted(_) => "KEY_EXHAUSTED",
            Self::SessionMissing(_) => "SESSION_REQUIRED",
            Self::SessionDesync(_) => "SESSION_DESYNC",
            Self::DuplicateKeyId(_) => "DUPLICATE_KEY_ID",
            Self::IdentityConflict(_) => "IDENTITY_CONFLICT",
            Self::DeliveryTimeout { .. } => "DELIVERY_TIMEOUT",
            Self::StorageWrite(_) => "STORAGE_WRITE",
            Self::UnknownUser(_) => "UNKNOWN_USER",
            Self::ChatNotFound(_) => "CHAT_NOT_FOUND",
            Self::NotChatMember(_) => "NOT_CHAT_MEMBER",
            Self::InvalidCode => "INVALID_CODE",
            Self::Internal(_) => "INTERNAL",
        }
    }
}
