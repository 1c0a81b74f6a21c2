use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use idempotency::IdempotencyError;
use thiserror::Error;

use crate::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, error_type) = match &self {
            ApiError::Idempotency(err) => match err {
                IdempotencyError::InvalidKey => (StatusCode::BAD_REQUEST, "InvalidIdempotencyKey"),
                IdempotencyError::Conflict { .. } => (StatusCode::CONFLICT, "IdempotencyConflict"),
                IdempotencyError::InProgress { .. } => {
                    (StatusCode::CONFLICT, "IdempotencyInProgress")
                }
                // Fail closed: a broken store must not let a guarded request
                // run unguarded.
                IdempotencyError::Store(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "IdempotencyStoreError")
                }
                IdempotencyError::MissingResponse { .. } | IdempotencyError::Serialization(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "IdempotencyError")
                }
            },
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BadRequest"),
            ApiError::PayloadTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, "PayloadTooLarge"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        };

        let error_message = match &self {
            ApiError::Idempotency(err) => err.to_string(),
            ApiError::BadRequest(msg)
            | ApiError::PayloadTooLarge(msg)
            | ApiError::NotFound(msg)
            | ApiError::Internal(msg) => msg.clone(),
        };

        if status_code.is_server_error() {
            tracing::error!(
                status = %status_code,
                error_type,
                error = %self,
                "API request failed"
            );
        }
        let response = ApiResponse::<()>::error(&error_message);
        (status_code, Json(response)).into_response()
    }
}
