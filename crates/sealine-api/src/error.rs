use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use sealine_types::error::RelayError;

/// HTTP surface for relay failures. Internal details (storage errors) are
/// not leaked to clients; machine-readable codes let clients branch on the
/// recovery path (refetch bundle, replenish keys, retry send).
#[derive(Debug)]
pub enum ApiError {
    Relay(RelayError),
    BadRequest(&'static str),
    Forbidden(&'static str),
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self::Relay(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Relay(e) => {
                let status = match e {
                    RelayError::KeyExhausted(_) => StatusCode::GONE,
                    RelayError::SessionMissing(_)
                    | RelayError::SessionDesync(_)
                    | RelayError::DuplicateKeyId(_)
                    | RelayError::IdentityConflict(_) => StatusCode::CONFLICT,
                    RelayError::UnknownUser(_) | RelayError::ChatNotFound(_) => {
                        StatusCode::NOT_FOUND
                    }
                    RelayError::NotChatMember(_) => StatusCode::FORBIDDEN,
                    RelayError::InvalidCode => StatusCode::UNAUTHORIZED,
                    RelayError::DeliveryTimeout { .. }
                    | RelayError::StorageWrite(_)
                    | RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
                    "Internal server error".to_string()
                } else {
                    e.to_string()
                };
                (status, e.code(), message)
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.to_string()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.to_string()),
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {:?}", self);
        }

        let body = serde_json::json!({
            "error": message,
            "code": code,
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn storage_details_are_not_leaked() {
        let resp = ApiError::from(RelayError::StorageWrite("disk on fire at /var/db".into()))
            .into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn exhaustion_maps_to_gone() {
        let resp = ApiError::from(RelayError::KeyExhausted(Uuid::new_v4())).into_response();
        assert_eq!(resp.status(), StatusCode::GONE);
    }
}
