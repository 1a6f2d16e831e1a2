use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use classlink_shared::SignalError;

/// Errors surfaced by the HTTP surface (REST history + WebSocket
/// handshake).
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication required: {0}")]
    Unauthorized(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upstream dependency failed: {0}")]
    Dependency(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<SignalError> for ApiError {
    fn from(err: SignalError) -> Self {
        match err {
            SignalError::Authentication(m) => ApiError::Unauthorized(m),
            SignalError::Validation(m) => ApiError::BadRequest(m),
            SignalError::NotFound(m) => ApiError::NotFound(m),
            SignalError::StateConflict(m) => ApiError::Conflict(m),
            SignalError::Dependency(m) => ApiError::Dependency(m),
        }
    }
}

impl From<classlink_store::StoreError> for ApiError {
    fn from(err: classlink_store::StoreError) -> Self {
        match err {
            classlink_store::StoreError::NotFound => ApiError::NotFound("record".to_string()),
            other => ApiError::Dependency(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            ApiError::Dependency(_) => {
                (StatusCode::BAD_GATEWAY, "Upstream dependency failed".to_string())
            }
            ApiError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
