//! Response DTOs for the diagnostics API
//!
//! Defines the structure of HTTP request and response bodies.

use serde::{Deserialize, Serialize};

use crate::loader::{LoadFailure, LoadOutcome};
use crate::models::LoadMetadata;

/// Response body for POST /load
#[derive(Debug, Clone, Serialize)]
pub struct LoadResponse {
    /// `loaded`, `failed` or `cancelled`
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Whether the result became the visible state
    pub committed: bool,
    pub row_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<LoadMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<LoadFailure>,
}

impl From<LoadOutcome> for LoadResponse {
    fn from(outcome: LoadOutcome) -> Self {
        match outcome {
            LoadOutcome::Loaded { data, committed } => Self {
                status: "loaded".to_string(),
                key: Some(data.key.clone()),
                committed,
                row_count: data.row_count(),
                metadata: Some(data.metadata.clone()),
                error: None,
            },
            LoadOutcome::Failed(failure) => Self {
                status: "failed".to_string(),
                key: None,
                committed: false,
                row_count: 0,
                metadata: None,
                error: Some(failure),
            },
            LoadOutcome::Cancelled => Self {
                status: "cancelled".to_string(),
                key: None,
                committed: false,
                row_count: 0,
                metadata: None,
                error: None,
            },
        }
    }
}

/// Response body for POST /cancel
#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    pub message: String,
}

impl CancelResponse {
    pub fn new() -> Self {
        Self {
            message: "Outstanding loads cancelled".to_string(),
        }
    }
}

impl Default for CancelResponse {
    fn default() -> Self {
        Self::new()
    }
}

/// Request body for POST /maintenance/emergency-clear
#[derive(Debug, Clone, Deserialize)]
pub struct EmergencyClearRequest {
    pub target_reduction_percent: u8,
}

impl EmergencyClearRequest {
    /// Returns an error message if the percentage is out of range.
    pub fn validate(&self) -> Option<String> {
        if self.target_reduction_percent == 0 || self.target_reduction_percent > 100 {
            return Some("target_reduction_percent must be between 1 and 100".to_string());
        }
        None
    }
}

/// Response body for POST /maintenance/emergency-clear
#[derive(Debug, Clone, Serialize)]
pub struct EmergencyClearResponse {
    pub removed: usize,
    pub remaining: usize,
}

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Health status (e.g., "healthy")
    pub status: String,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Error response body for all error conditions
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error message describing what went wrong
    pub error: String,
    pub retryable: bool,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, retryable: bool) -> Self {
        Self {
            error: error.into(),
            retryable,
        }
    }
}
