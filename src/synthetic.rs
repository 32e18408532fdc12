//! Synthetic Backend
//!
//! Deterministic in-process stand-in for the remote readings API. Honours
//! offset/chunk parameters, reports cursor metadata, and can inject latency,
//! failures and mislabelled rows. The binary serves it as its demo backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{DataError, Result};
use crate::fetch::{ChunkInfo, FetchParams, Fetcher, RawResponse, ResponseMetadata};
use crate::models::RawBlock;

/// First synthetic timestamp: 2023-11-14T22:13:20Z.
const BASE_TIMESTAMP_MS: i64 = 1_700_000_000_000;
const SAMPLE_INTERVAL_MS: i64 = 60_000;

// == Block Shape ==
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockShape {
    Rows,
    Columnar,
    /// Rows for even chunks, columnar for odd ones
    Alternating,
}

#[derive(Debug, Clone)]
struct FailureRule {
    site: String,
    offset: Option<u64>,
    remaining: Option<u32>,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// == Synthetic Fetcher ==
pub struct SyntheticFetcher {
    default_records: u64,
    site_records: HashMap<String, u64>,
    latency: Duration,
    shape: BlockShape,
    mislabel: bool,
    failures: Mutex<Vec<FailureRule>>,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    log: Mutex<Vec<(String, FetchParams)>>,
}

impl SyntheticFetcher {
    /// Every site holds `records_per_site` readings.
    pub fn new(records_per_site: u64) -> Self {
        Self {
            default_records: records_per_site,
            site_records: HashMap::new(),
            latency: Duration::ZERO,
            shape: BlockShape::Alternating,
            mislabel: false,
            failures: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_site_records(mut self, site: &str, records: u64) -> Self {
        self.site_records.insert(site.to_ascii_uppercase(), records);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_shape(mut self, shape: BlockShape) -> Self {
        self.shape = shape;
        self
    }

    /// Label every row with a foreign site id.
    pub fn mislabel_rows(mut self) -> Self {
        self.mislabel = true;
        self
    }

    /// Fail the next `times` requests for `site` (at `offset`, if given).
    pub fn fail_at(self, site: &str, offset: Option<u64>, times: u32) -> Self {
        self.failures.lock().push(FailureRule {
            site: site.to_ascii_uppercase(),
            offset,
            remaining: Some(times),
        });
        self
    }

    /// Fail every request for `site`.
    pub fn fail_always(self, site: &str) -> Self {
        self.failures.lock().push(FailureRule {
            site: site.to_ascii_uppercase(),
            offset: None,
            remaining: None,
        });
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of requests that were outstanding at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Every request received, in arrival order.
    pub fn requests(&self) -> Vec<(String, FetchParams)> {
        self.log.lock().clone()
    }

    pub fn requests_for(&self, site: &str) -> Vec<FetchParams> {
        self.log
            .lock()
            .iter()
            .filter(|(_, p)| p.site_id == site)
            .map(|(_, p)| p.clone())
            .collect()
    }

    fn records_for(&self, site: &str) -> u64 {
        self.site_records
            .get(site)
            .copied()
            .unwrap_or(self.default_records)
    }

    fn should_fail(&self, params: &FetchParams) -> bool {
        let mut failures = self.failures.lock();
        for rule in failures.iter_mut() {
            let offset_matches = rule.offset.is_none() || rule.offset == params.offset.or(Some(0));
            if rule.site != params.site_id || !offset_matches {
                continue;
            }
            match rule.remaining.as_mut() {
                None => return true,
                Some(0) => continue,
                Some(n) => {
                    *n -= 1;
                    return true;
                }
            }
        }
        false
    }

    fn block(&self, site: &str, start: u64, end: u64, columnar: bool) -> RawBlock {
        let label = if self.mislabel { "MISLABELED" } else { site };
        let timestamp = |i: u64| BASE_TIMESTAMP_MS + i as i64 * SAMPLE_INTERVAL_MS;
        let reading = |i: u64| (i % 1_000) as f64 / 10.0;

        if columnar {
            let mut columns = BTreeMap::new();
            columns.insert(
                "timestamp".to_string(),
                (start..end).map(|i| json!(timestamp(i))).collect(),
            );
            columns.insert(
                "value".to_string(),
                (start..end).map(|i| json!(reading(i))).collect(),
            );
            RawBlock::Columnar(columns)
        } else {
            let rows = (start..end)
                .map(|i| {
                    let mut row = Map::new();
                    row.insert("site_id".into(), Value::from(label));
                    row.insert("timestamp".into(), json!(timestamp(i)));
                    row.insert("value".into(), json!(reading(i)));
                    row
                })
                .collect();
            RawBlock::Rows(rows)
        }
    }
}

#[async_trait]
impl Fetcher for SyntheticFetcher {
    async fn fetch(
        &self,
        endpoint: &str,
        params: &FetchParams,
        _token: &CancellationToken,
    ) -> Result<RawResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push((endpoint.to_string(), params.clone()));
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.should_fail(params) {
            return Err(DataError::Network(format!(
                "synthetic failure for {} at offset {}",
                params.site_id,
                params.offset.unwrap_or(0)
            )));
        }

        let total = self.records_for(&params.site_id);
        let (start, end, chunk_info) = match (params.offset, params.chunk_size) {
            (Some(offset), Some(size)) if size > 0 => {
                let end = (offset + size).min(total);
                let info = ChunkInfo {
                    offset,
                    chunk_size: size,
                    has_more: end < total,
                };
                (offset.min(total), end, Some(info))
            }
            _ => (0, total, None),
        };

        let chunk_index = params
            .chunk_size
            .filter(|s| *s > 0)
            .map(|s| params.offset.unwrap_or(0) / s)
            .unwrap_or(0);
        let columnar = match self.shape {
            BlockShape::Rows => false,
            BlockShape::Columnar => true,
            BlockShape::Alternating => chunk_index % 2 == 1,
        };

        debug!(endpoint, site = %params.site_id, start, end, "Synthetic fetch");
        Ok(RawResponse {
            block: self.block(&params.site_id, start, end, columnar),
            metadata: ResponseMetadata {
                total_records: Some(total),
                chunk_info,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FidelityMode, RangeCode};

    fn params(site: &str, offset: Option<u64>, chunk_size: Option<u64>) -> FetchParams {
        FetchParams {
            site_id: site.to_string(),
            range: RangeCode::Last90Days,
            custom_range: None,
            range_start: None,
            range_end: None,
            filters: BTreeMap::new(),
            resolution_hint: None,
            depth_limit: None,
            fidelity: FidelityMode::Standard,
            offset,
            chunk_size,
        }
    }

    #[tokio::test]
    async fn test_single_response_without_chunk_info() {
        let fetcher = SyntheticFetcher::new(5);
        let token = CancellationToken::new();

        let response = fetcher.fetch("readings", &params("S1", None, None), &token).await.unwrap();
        assert_eq!(response.block.len(), 5);
        assert!(response.metadata.chunk_info.is_none());
        assert_eq!(response.metadata.total_records, Some(5));
    }

    #[tokio::test]
    async fn test_last_chunk_reports_no_more() {
        let fetcher = SyntheticFetcher::new(25).with_shape(BlockShape::Columnar);
        let token = CancellationToken::new();

        let response = fetcher
            .fetch("readings", &params("S1", Some(20), Some(10)), &token)
            .await
            .unwrap();
        assert_eq!(response.block.len(), 5);
        let info = response.metadata.chunk_info.unwrap();
        assert!(!info.has_more);
        assert_eq!(info.next_offset(), 30);
    }

    #[tokio::test]
    async fn test_fail_at_is_consumed() {
        let fetcher = SyntheticFetcher::new(5).fail_at("S1", None, 1);
        let token = CancellationToken::new();

        assert!(fetcher.fetch("r", &params("S1", None, None), &token).await.is_err());
        assert!(fetcher.fetch("r", &params("S1", None, None), &token).await.is_ok());
        assert_eq!(fetcher.call_count(), 2);
        assert_eq!(fetcher.requests_for("S1").len(), 2);
    }
}
