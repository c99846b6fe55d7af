/// Database row types — these map directly to SQLite rows.
/// Distinct from sealine-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub phone_number: String,
    pub identity_key: Option<String>,
    pub registration_id: Option<i64>,
    pub created_at: String,
}

pub struct PreKeyRow {
    pub key_id: i64,
    pub public_key: String,
    pub signature: String,
}

pub struct ChatRow {
    pub id: String,
    pub kind: String,
    pub user_a: String,
    pub user_b: String,
    pub last_seq: i64,
}

pub struct EnvelopeRow {
    pub chat_id: String,
    pub id: i64,
    pub sender_id: String,
    pub recipient_id: String,
    pub ciphertext: Vec<u8>,
    pub created_at: String,
}

/// Outcome of an identity registration attempt. Identity keys are immutable;
/// re-registering the same material is a no-op, different material conflicts.
#[derive(Debug, PartialEq, Eq)]
pub enum IdentityOutcome {
    Installed,
    Unchanged,
    Conflict,
}
