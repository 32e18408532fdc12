//! Chunk Executor
//!
//! Drives the network collaborator for a set of entities. Each entity walks
//! its offset cursor sequentially; entities run concurrently, at most
//! `max_concurrent_chunks` at a time, so no more than that many chunk
//! requests are ever outstanding.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::LoaderConfig;
use crate::error::{DataError, Result};
use crate::fetch::{FetchParams, Fetcher};
use crate::loader::chunk::{clipped_size, ChunkDescriptor};
use crate::loader::progress::ProgressSink;
use crate::models::{LoadRequest, RawBlock};
use crate::retry::{retry_with_policy, RetryPolicy};

type Window = (Option<DateTime<Utc>>, Option<DateTime<Utc>>);

/// Raw blocks gathered for one entity, in cursor order.
#[derive(Debug, Clone)]
pub struct EntityPayload {
    pub entity: String,
    pub blocks: Vec<RawBlock>,
    pub total_records: Option<u64>,
    /// Empty for a single, non-chunked response
    pub chunks: Vec<ChunkDescriptor>,
}

impl EntityPayload {
    fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            blocks: Vec::new(),
            total_records: None,
            chunks: Vec::new(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.blocks.iter().map(RawBlock::len).sum()
    }
}

pub struct ChunkExecutor {
    fetcher: Arc<dyn Fetcher>,
    config: LoaderConfig,
    retry: RetryPolicy,
}

impl ChunkExecutor {
    pub fn new(fetcher: Arc<dyn Fetcher>, config: LoaderConfig) -> Self {
        let retry = config.retry_policy();
        Self {
            fetcher,
            config,
            retry,
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Fetches every entity in `entities`, returning one result per entity
    /// in completion order.
    pub async fn fetch_entities(
        &self,
        request: &LoadRequest,
        entities: &[String],
        window: Window,
        token: &CancellationToken,
        progress: Option<&dyn ProgressSink>,
    ) -> Vec<(String, Result<EntityPayload>)> {
        if let Some(progress) = progress {
            progress.begin_sources(entities);
        }

        let limit = self.config.max_concurrent_chunks.max(1);
        stream::iter(entities.iter().cloned())
            .map(|entity| async move {
                let result = self
                    .fetch_entity(request, &entity, window, token, progress)
                    .await;
                (entity, result)
            })
            .buffer_unordered(limit)
            .collect()
            .await
    }

    async fn fetch_entity(
        &self,
        request: &LoadRequest,
        entity: &str,
        window: Window,
        token: &CancellationToken,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<EntityPayload> {
        let chunked = self.config.is_large(request.range);
        let mut payload = EntityPayload::new(entity);
        let mut offset = 0u64;

        loop {
            if token.is_cancelled() {
                return Err(DataError::Cancelled);
            }

            let params = self.params(request, entity, window, chunked.then_some(offset));
            debug!(entity, offset, chunked, "Dispatching chunk");

            let response = retry_with_policy(&self.retry, token, || {
                self.fetcher.fetch(&request.service, &params, token)
            })
            .await
            .map_err(|err| match err {
                DataError::Cancelled => DataError::Cancelled,
                err if chunked => DataError::PartialChunk {
                    entity: entity.to_string(),
                    offset,
                    message: err.to_string(),
                },
                err => err,
            })?;

            let rows = response.block.len() as u64;
            if response.metadata.total_records.is_some() {
                payload.total_records = response.metadata.total_records;
            }
            if chunked {
                // The backend may serve a different size than asked for; its
                // report is what the cursor advances by.
                let served = response
                    .metadata
                    .chunk_info
                    .map_or(self.config.chunk_size, |info| info.chunk_size);
                payload.chunks.push(ChunkDescriptor {
                    site_id: entity.to_string(),
                    offset,
                    chunk_size: clipped_size(offset, served, payload.total_records),
                    range_start: window.0,
                    range_end: window.1,
                });
            }
            if let Some(progress) = progress {
                progress.record(entity, rows, payload.total_records);
            }
            payload.blocks.push(response.block);

            let info = match response.metadata.chunk_info {
                Some(info) if chunked && info.has_more => info,
                _ => break,
            };
            let next = info.next_offset();
            if next <= offset {
                return Err(DataError::PartialChunk {
                    entity: entity.to_string(),
                    offset,
                    message: "cursor did not advance".to_string(),
                });
            }
            offset = next;

            let pacing = self.config.chunk_pacing();
            if !pacing.is_zero() {
                tokio::select! {
                    _ = token.cancelled() => return Err(DataError::Cancelled),
                    _ = tokio::time::sleep(pacing) => {}
                }
            }
        }

        debug!(entity, rows = payload.row_count(), chunks = payload.chunks.len(), "Entity fetched");
        Ok(payload)
    }

    fn params(
        &self,
        request: &LoadRequest,
        entity: &str,
        window: Window,
        offset: Option<u64>,
    ) -> FetchParams {
        FetchParams {
            site_id: entity.to_string(),
            range: request.range,
            custom_range: request.custom_range,
            range_start: window.0,
            range_end: window.1,
            filters: request.filters.clone(),
            resolution_hint: request.resolution_hint,
            depth_limit: request.depth_limit,
            fidelity: request.fidelity,
            offset,
            chunk_size: offset.map(|_| self.config.chunk_size),
        }
    }
}
