//! Error types for the data-access layer
//!
//! Provides unified error handling using thiserror.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;

// == Data Error Enum ==
/// Unified error type for the data-access layer.
///
/// Cloneable so a single settled request can be shared with every caller that
/// joined it while it was in flight.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    /// Transport failure talking to the backend
    #[error("Network error: {0}")]
    Network(String),

    /// Caller-initiated abort
    #[error("Request cancelled")]
    Cancelled,

    /// One chunk of a multi-chunk sequence failed
    #[error("Chunk at offset {offset} for {entity} failed: {message}")]
    PartialChunk {
        entity: String,
        offset: u64,
        message: String,
    },

    /// Persistent layer read/write failure
    #[error("Cache layer error: {0}")]
    CacheLayer(String),

    /// Request exceeded its time box
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DataError {
    /// Transport failures are worth another attempt; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DataError::Network(_) | DataError::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DataError::Cancelled)
    }
}

impl From<serde_json::Error> for DataError {
    fn from(err: serde_json::Error) -> Self {
        DataError::CacheLayer(err.to_string())
    }
}

impl From<std::io::Error> for DataError {
    fn from(err: std::io::Error) -> Self {
        DataError::CacheLayer(err.to_string())
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for DataError {
    fn into_response(self) -> Response {
        let status = match &self {
            DataError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DataError::Network(_) | DataError::PartialChunk { .. } => StatusCode::BAD_GATEWAY,
            DataError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            DataError::Cancelled => StatusCode::CONFLICT,
            DataError::CacheLayer(_) | DataError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(ErrorResponse::new(self.to_string(), self.is_retryable()));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the data-access layer.
pub type Result<T> = std::result::Result<T, DataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DataError::Network("reset".into()).is_retryable());
        assert!(DataError::Timeout(10).is_retryable());
        assert!(!DataError::Cancelled.is_retryable());
        assert!(!DataError::InvalidRequest("x".into()).is_retryable());
    }

    #[test]
    fn test_invalid_request_status() {
        let response = DataError::InvalidRequest("no sites".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
