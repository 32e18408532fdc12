//! Request, data and response models
//!
//! Logical load requests, wire and normalized data shapes, and the DTOs
//! serialized by the diagnostics API.

pub mod data;
pub mod requests;
pub mod responses;

// Re-export commonly used types
pub use data::{CacheOutcome, EntityData, LoadMetadata, LoadedData, RawBlock, Row};
pub use requests::{FidelityMode, LoadRequest, RangeCode, TimeRange, DEFAULT_SERVICE};
pub use responses::{
    CancelResponse, EmergencyClearRequest, EmergencyClearResponse, ErrorResponse,
    HealthResponse, LoadResponse,
};
