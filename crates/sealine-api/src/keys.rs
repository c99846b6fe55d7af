use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use sealine_types::api::{Claims, RegisterIdentityRequest, UploadPreKeysRequest, UploadPreKeysResponse};

use crate::auth::AppState;
use crate::error::ApiError;

/// GET /keys/{user_id}/bundle — claim one prekey from the target's pool.
/// The claim consumes the key and establishes the caller's session.
pub async fn get_bundle(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let bundle = state.relay.keys.fetch_bundle(claims.sub, user_id).await?;
    Ok(Json(bundle))
}

/// POST /keys/identity — publish the caller's long-term identity key.
/// Immutable once set; a different key for the same user is a conflict.
pub async fn register_identity(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<RegisterIdentityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.identity_key.is_empty() {
        return Err(ApiError::BadRequest("identityKey must not be empty"));
    }
    state
        .relay
        .keys
        .register_identity(claims.sub, req.identity_key, req.registration_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /keys/{user_id}/prekeys — upload a batch of one-time prekeys.
/// Only the key owner may upload; duplicate ids reject the whole batch.
pub async fn upload_prekeys(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<UploadPreKeysRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if user_id != claims.sub {
        return Err(ApiError::Forbidden("cannot upload keys for another user"));
    }
    if req.keys.is_empty() {
        return Err(ApiError::BadRequest("key batch must not be empty"));
    }

    let accepted = req.keys.len() as u32;
    let remaining = state.relay.keys.upload_prekeys(claims.sub, req.keys).await?;

    Ok(Json(UploadPreKeysResponse {
        accepted,
        remaining,
    }))
}
