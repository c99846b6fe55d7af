use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;

use sealine_types::api::{Claims, SendMessageRequest, SendMessageResponse};

use crate::auth::AppState;
use crate::error::ApiError;

/// POST /messages — accept one ciphertext for relay. Returns 201 once the
/// envelope is durably queued; live delivery continues in the background.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.recipient_id == claims.sub {
        return Err(ApiError::BadRequest("cannot message yourself"));
    }

    let ciphertext = B64
        .decode(&req.ciphertext)
        .map_err(|_| ApiError::BadRequest("ciphertext is not valid base64"))?;
    if ciphertext.is_empty() {
        return Err(ApiError::BadRequest("ciphertext must not be empty"));
    }

    let envelope = state
        .relay
        .ingest(claims.sub, req.recipient_id, req.chat_id, ciphertext)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SendMessageResponse {
            envelope_id: envelope.id,
            chat_id: envelope.chat_id,
            server_timestamp: envelope.created_at,
        }),
    ))
}
