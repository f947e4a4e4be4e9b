//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use keel_core::domain::rollback::RollbackRecord;

use crate::error::EngineError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    /// Rollback ran but at least one server failed; the record is returned
    RollbackFailed(Box<RollbackRecord>),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::RollbackFailed(record) => {
                let message = format!(
                    "Rollback failed on {} of {} server(s)",
                    record.failed_servers().len(),
                    record.server_outcomes.len()
                );
                return (
                    StatusCode::BAD_GATEWAY,
                    Json(serde_json::json!({ "error": message, "record": record })),
                )
                    .into_response();
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(_) => ApiError::BadRequest(err.to_string()),
            EngineError::NotFound(_) => ApiError::NotFound(err.to_string()),
            EngineError::Concurrency(_) | EngineError::InvalidState(_) => {
                ApiError::Conflict(err.to_string())
            }
            EngineError::RollbackPartialFailure { record } => ApiError::RollbackFailed(record),
            EngineError::Repository(e) => {
                tracing::error!("Repository error: {:?}", e);
                ApiError::InternalError("Internal server error".to_string())
            }
            EngineError::Connection(_) | EngineError::Timeout(_) | EngineError::Execution(_) => {
                ApiError::InternalError(err.to_string())
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
