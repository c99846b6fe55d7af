use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{PreKey, User};

// -- JWT Claims --

/// JWT claims shared between the REST middleware and the WebSocket upgrade
/// handler. Canonical definition lives here so the two never drift.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub phone: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RequestOtpRequest {
    pub phone_number: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct VerifyOtpRequest {
    pub phone_number: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOtpResponse {
    pub token: String,
    pub user: User,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SendMessageRequest {
    /// Omitted on the first message between a pair; the server resolves or
    /// creates the private chat and returns its id.
    pub chat_id: Option<Uuid>,
    pub recipient_id: Uuid,
    /// Base64 ciphertext.
    pub ciphertext: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub envelope_id: u64,
    pub chat_id: Uuid,
    pub server_timestamp: DateTime<Utc>,
}

// -- Keys --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RegisterIdentityRequest {
    pub identity_key: String,
    pub registration_id: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct UploadPreKeysRequest {
    pub keys: Vec<PreKey>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPreKeysResponse {
    pub accepted: u32,
    pub remaining: u32,
}
