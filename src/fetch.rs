//! Network Contract
//!
//! The primitive the transport collaborator supplies, and the shapes it
//! exchanges with the loader.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::models::{FidelityMode, RangeCode, RawBlock, TimeRange};

// == Fetch Params ==
/// Parameters of one network call: one entity, optionally one chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchParams {
    pub site_id: String,
    pub range: RangeCode,
    pub custom_range: Option<TimeRange>,
    pub range_start: Option<DateTime<Utc>>,
    pub range_end: Option<DateTime<Utc>>,
    pub filters: BTreeMap<String, String>,
    pub resolution_hint: Option<u32>,
    pub depth_limit: Option<u32>,
    pub fidelity: FidelityMode,
    /// Set for chunked requests
    pub offset: Option<u64>,
    pub chunk_size: Option<u64>,
}

// == Response ==
/// Cursor information for chunked responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Offset of the chunk this response carries
    pub offset: u64,
    pub chunk_size: u64,
    pub has_more: bool,
}

impl ChunkInfo {
    /// Where the next chunk starts.
    pub fn next_offset(&self) -> u64 {
        self.offset + self.chunk_size
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub total_records: Option<u64>,
    /// Absent for a single, complete response
    pub chunk_info: Option<ChunkInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResponse {
    pub block: RawBlock,
    #[serde(default)]
    pub metadata: ResponseMetadata,
}

// == Fetcher ==
/// `fetch(endpoint, params, cancellationToken)` supplied by the transport.
///
/// Implementations should return `DataError::Network` for transport failures
/// so they are retried; they may ignore the token, the loader stops waiting
/// on its own once it is cancelled.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        endpoint: &str,
        params: &FetchParams,
        token: &CancellationToken,
    ) -> Result<RawResponse>;
}
