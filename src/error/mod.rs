use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::cache::CacheError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum QueueServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Receipt handle invalid: {0}")]
    ReceiptHandleInvalid(String),

    #[error("Invalid batch entry id: {0}")]
    InvalidBatchEntryId(String),

    #[error("Batch entry ids not distinct: {0}")]
    BatchEntryIdsNotDistinct(String),

    #[error("Too many entries in batch request: {0}")]
    TooManyEntriesInBatchRequest(String),

    #[error("Batch request payload too long: {0}")]
    BatchRequestTooLong(String),
}

impl From<StoreError> for QueueServiceError {
    fn from(e: StoreError) -> Self {
        QueueServiceError::Internal(e.to_string())
    }
}

impl From<CacheError> for QueueServiceError {
    fn from(e: CacheError) -> Self {
        QueueServiceError::Internal(e.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

impl QueueServiceError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            QueueServiceError::Config(_) => "InternalError",
            QueueServiceError::Validation(_) => "ValidationError",
            QueueServiceError::NotFound(_) => "NotFound",
            QueueServiceError::AccessDenied(_) => "AccessDenied",
            QueueServiceError::Internal(_) => "InternalError",
            QueueServiceError::ReceiptHandleInvalid(_) => "ReceiptHandleInvalid",
            QueueServiceError::InvalidBatchEntryId(_) => "InvalidBatchEntryId",
            QueueServiceError::BatchEntryIdsNotDistinct(_) => "BatchEntryIdsNotDistinct",
            QueueServiceError::TooManyEntriesInBatchRequest(_) => "TooManyEntriesInBatchRequest",
            QueueServiceError::BatchRequestTooLong(_) => "BatchRequestTooLong",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            QueueServiceError::Config(_) | QueueServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            QueueServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            QueueServiceError::AccessDenied(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for QueueServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let log_message = self.to_string();

        // Internal detail is redacted from clients in production
        let client_message = match &self {
            QueueServiceError::Config(_) | QueueServiceError::Internal(_) if is_production() => {
                "Internal server error".to_string()
            }
            _ => log_message.clone(),
        };

        tracing::error!(
            code = %code,
            status = %status.as_u16(),
            message = %log_message,
            "API error"
        );

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: client_message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, QueueServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(QueueServiceError::Validation("x".into()).code(), "ValidationError");
        assert_eq!(QueueServiceError::NotFound("q".into()).code(), "NotFound");
        assert_eq!(
            QueueServiceError::ReceiptHandleInvalid("h".into()).code(),
            "ReceiptHandleInvalid"
        );
        assert_eq!(
            QueueServiceError::TooManyEntriesInBatchRequest("11".into()).code(),
            "TooManyEntriesInBatchRequest"
        );
    }

    #[test]
    fn test_store_error_maps_to_internal() {
        let err: QueueServiceError = StoreError::Unavailable("down".into()).into();
        assert_eq!(err.code(), "InternalError");
    }
}
