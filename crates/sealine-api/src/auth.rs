use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use rand::Rng;
use tracing::{info, warn};
use uuid::Uuid;

use sealine_db::Database;
use sealine_relay::Relay;
use sealine_types::api::{Claims, RequestOtpRequest, VerifyOtpRequest, VerifyOtpResponse};
use sealine_types::error::RelayError;
use sealine_types::models::User;

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub relay: Relay,
    pub jwt_secret: String,
    pub otp: OtpStore,
    pub otp_ttl: Duration,
}

const MAX_OTP_ATTEMPTS: u8 = 5;

struct OtpEntry {
    code: String,
    expires_at: Instant,
    attempts: u8,
}

/// In-memory store of outstanding verification codes. Codes are single-use,
/// expire after the configured TTL and tolerate a bounded number of wrong
/// guesses before being invalidated.
#[derive(Default)]
pub struct OtpStore {
    entries: Mutex<HashMap<String, OtpEntry>>,
}

impl OtpStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh 6-digit code for a phone number, replacing any prior
    /// outstanding code. Expired entries for phones that never verified are
    /// swept here, so the map stays bounded by the request rate times TTL.
    pub fn issue(&self, phone_number: &str, ttl: Duration) -> String {
        let code = format!("{:06}", rand::rng().random_range(0..1_000_000));
        let mut entries = self.entries.lock().expect("otp lock poisoned");
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(
            phone_number.to_string(),
            OtpEntry {
                code: code.clone(),
                expires_at: Instant::now() + ttl,
                attempts: 0,
            },
        );
        code
    }

    /// Check a code. Consumes the entry on success; counts and eventually
    /// invalidates on failure.
    pub fn verify(&self, phone_number: &str, code: &str) -> Result<(), RelayError> {
        let mut entries = self.entries.lock().expect("otp lock poisoned");
        let Some(entry) = entries.get_mut(phone_number) else {
            return Err(RelayError::InvalidCode);
        };

        if entry.expires_at < Instant::now() {
            entries.remove(phone_number);
            return Err(RelayError::InvalidCode);
        }

        if entry.code != code {
            entry.attempts += 1;
            if entry.attempts >= MAX_OTP_ATTEMPTS {
                entries.remove(phone_number);
            }
            return Err(RelayError::InvalidCode);
        }

        entries.remove(phone_number);
        Ok(())
    }
}

pub async fn request_otp(
    State(state): State<AppState>,
    Json(req): Json<RequestOtpRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let phone = normalize_phone(&req.phone_number)
        .ok_or(ApiError::BadRequest("invalid phone number"))?;

    let code = state.otp.issue(&phone, state.otp_ttl);
    // SMS delivery is an external collaborator; the code goes to the
    // operator log so small deployments can run without an SMS gateway.
    info!("OTP for {}: {}", phone, code);

    Ok(StatusCode::NO_CONTENT)
}

pub async fn verify_otp(
    State(state): State<AppState>,
    Json(req): Json<VerifyOtpRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let phone = normalize_phone(&req.phone_number)
        .ok_or(ApiError::BadRequest("invalid phone number"))?;

    if let Err(e) = state.otp.verify(&phone, &req.code) {
        warn!("OTP verification failed for {}", phone);
        return Err(e.into());
    }

    // First verification creates the account.
    let db = state.db.clone();
    let new_id = Uuid::new_v4().to_string();
    let phone_for_db = phone.clone();
    let row = tokio::task::spawn_blocking(move || db.create_user_if_absent(&new_id, &phone_for_db))
        .await
        .map_err(|e| RelayError::Internal(e.to_string()))?
        .map_err(|e| RelayError::StorageWrite(e.to_string()))?;

    let user_id: Uuid = row
        .id
        .parse()
        .map_err(|_| RelayError::Internal(format!("corrupt user id '{}'", row.id)))?;

    let token = create_token(&state.jwt_secret, user_id, &phone)
        .map_err(|e| RelayError::Internal(e.to_string()))?;

    info!("{} verified as {}", phone, user_id);

    Ok(Json(VerifyOtpResponse {
        token,
        user: User {
            id: user_id,
            phone_number: row.phone_number,
            identity_key: row.identity_key,
            registration_id: row.registration_id.map(|r| r as u32),
        },
    }))
}

fn create_token(secret: &str, user_id: Uuid, phone: &str) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        phone: phone.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

/// E.164-ish normalization: keep a leading '+' and digits, reject anything
/// else or implausible lengths.
fn normalize_phone(raw: &str) -> Option<String> {
    let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let rest = cleaned.strip_prefix('+')?;
    if rest.len() < 7 || rest.len() > 15 || !rest.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("+{}", rest))
}
