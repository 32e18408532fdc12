//! Data Pipeline
//!
//! The shared network/cache path behind both foreground loads and
//! prefetches: canonicalize, join or start the single-flight request, split
//! the entity set against the cache, fetch what is missing, normalize, write
//! back and merge.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::DateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{CachedDataset, MultiLayerCache, WriteOrigin};
use crate::canonical::{canonicalize, range_key, RequestKey};
use crate::clock::SharedClock;
use crate::dedupe::InFlight;
use crate::error::{DataError, Result};
use crate::loader::{ChunkExecutor, LoadPhase, ProgressFanout, ProgressReporter};
use crate::models::{CacheOutcome, EntityData, LoadRequest, LoadedData};

type LoadResult = Result<Arc<LoadedData>>;

pub struct DataPipeline {
    cache: Arc<MultiLayerCache>,
    executor: Arc<ChunkExecutor>,
    /// Each outstanding job carries the fan-out its progress goes through.
    in_flight: InFlight<LoadResult, Arc<ProgressFanout>>,
    clock: SharedClock,
    prefetch_hits: Arc<AtomicU64>,
}

impl DataPipeline {
    pub fn new(cache: Arc<MultiLayerCache>, executor: Arc<ChunkExecutor>, clock: SharedClock) -> Self {
        Self {
            cache,
            executor,
            in_flight: InFlight::new(),
            clock,
            prefetch_hits: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn cache(&self) -> &Arc<MultiLayerCache> {
        &self.cache
    }

    pub fn is_in_flight(&self, key: &RequestKey) -> bool {
        self.in_flight.contains(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Foreground reads served by a value a prefetch wrote.
    pub fn prefetch_hits(&self) -> u64 {
        self.prefetch_hits.load(Ordering::Relaxed)
    }

    // == Fetch ==
    /// Loads `request`, sharing the work with any identical request already
    /// in flight.
    ///
    /// Every caller waiting on the job, leader or joiner, has its reporter
    /// attached to the job's progress. A caller that joined someone else's
    /// request and sees it cancelled starts over with its own token.
    pub async fn fetch(
        &self,
        request: &LoadRequest,
        token: &CancellationToken,
        progress: Option<Arc<ProgressReporter>>,
        origin: WriteOrigin,
    ) -> LoadResult {
        request.validate()?;
        let key = canonicalize(&request.service, request);

        loop {
            if token.is_cancelled() {
                return Err(DataError::Cancelled);
            }

            let fanout = Arc::new(ProgressFanout::new());
            let job = LoadJob {
                cache: Arc::clone(&self.cache),
                executor: Arc::clone(&self.executor),
                clock: Arc::clone(&self.clock),
                prefetch_hits: Arc::clone(&self.prefetch_hits),
                request: request.clone(),
                key: key.clone(),
                token: token.clone(),
                progress: Arc::clone(&fanout),
                origin,
            };

            let (pending, fanout, joined) = self.in_flight.begin(&key, fanout, move || job.run());
            if let Some(reporter) = &progress {
                fanout.attach(Arc::clone(reporter));
            }

            let result = tokio::select! {
                _ = token.cancelled() => {
                    if let Some(reporter) = &progress {
                        fanout.detach(reporter);
                    }
                    return Err(DataError::Cancelled);
                }
                result = pending => result,
            };

            match result {
                Err(DataError::Cancelled) if joined && !token.is_cancelled() => {
                    debug!(key = %key, "Joined request was cancelled, starting over");
                    if let Some(reporter) = &progress {
                        fanout.detach(reporter);
                        reporter.clear_sources();
                    }
                }
                result => return result,
            }
        }
    }
}

/// Everything one single-flight execution owns.
struct LoadJob {
    cache: Arc<MultiLayerCache>,
    executor: Arc<ChunkExecutor>,
    clock: SharedClock,
    prefetch_hits: Arc<AtomicU64>,
    request: LoadRequest,
    key: RequestKey,
    token: CancellationToken,
    progress: Arc<ProgressFanout>,
    origin: WriteOrigin,
}

impl LoadJob {
    async fn run(self) -> LoadResult {
        let entities = self.request.normalized_entities();
        let range = range_key(&self.request.service, &self.request);

        let lookup = self.cache.lookup(&entities, &range, self.origin).await;
        let used = lookup.hits.values().filter(|hit| hit.prefetched).count() as u64;
        if used > 0 {
            self.prefetch_hits.fetch_add(used, Ordering::Relaxed);
        }

        if lookup.is_complete() {
            debug!(key = %self.key, "Complete cache hit");
            let parts = lookup.hits.into_values().map(|hit| hit.data).collect();
            return Ok(Arc::new(LoadedData::merge(
                self.key.to_string(),
                parts,
                CacheOutcome::Complete,
            )));
        }

        debug!(
            key = %self.key,
            cached = lookup.hits.len(),
            missing = lookup.missing.len(),
            "Fetching missing entities"
        );

        let now = DateTime::from_timestamp_millis(self.clock.now_ms() as i64).unwrap_or_default();
        let window = self.request.resolve_window(now);
        let results = self
            .executor
            .fetch_entities(
                &self.request,
                &lookup.missing,
                window,
                &self.token,
                Some(&*self.progress),
            )
            .await;

        self.progress.flush();
        if self.token.is_cancelled() {
            return Err(DataError::Cancelled);
        }

        self.set_phase(LoadPhase::Parsing);
        let mut fetched: Vec<CachedDataset> = Vec::with_capacity(results.len());
        let mut failure: Option<(String, DataError)> = None;
        for (entity, result) in results {
            match result {
                Ok(payload) => {
                    let rows = payload
                        .blocks
                        .into_iter()
                        .flat_map(|block| block.into_rows(&entity))
                        .collect();
                    fetched.push(Arc::new(EntityData {
                        entity,
                        rows,
                        total_records: payload.total_records,
                    }));
                }
                Err(err) => {
                    // Report the failure of the lowest entity, whatever the completion order.
                    if failure.as_ref().map_or(true, |(first, _)| entity < *first) {
                        failure = Some((entity, err));
                    }
                }
            }
        }

        for data in &fetched {
            self.cache
                .write(&data.entity, &range, Arc::clone(data), self.origin)
                .await;
        }

        if let Some((entity, err)) = failure {
            info!(key = %self.key, entity = %entity, error = %err, "Load failed");
            return Err(err);
        }

        self.set_phase(LoadPhase::Processing);
        let cached: Vec<String> = lookup.hits.keys().cloned().collect();
        let outcome = if cached.is_empty() {
            CacheOutcome::Miss
        } else {
            CacheOutcome::Partial {
                cached,
                fetched: lookup.missing.clone(),
            }
        };

        let mut parts: Vec<CachedDataset> = lookup.hits.into_values().map(|hit| hit.data).collect();
        parts.extend(fetched);
        let merged = LoadedData::merge(self.key.to_string(), parts, outcome);
        debug!(key = %self.key, rows = merged.row_count(), "Load merged");
        Ok(Arc::new(merged))
    }

    fn set_phase(&self, phase: LoadPhase) {
        self.progress.set_phase(phase);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheRegistry, HitPolicy, MemoryStorage, PersistentLayer, ENTITY_CACHE};
    use crate::clock::ManualClock;
    use crate::config::LoaderConfig;
    use crate::loader::LoadProgress;
    use crate::models::RangeCode;
    use crate::synthetic::SyntheticFetcher;
    use std::time::Duration;

    fn pipeline(fetcher: Arc<SyntheticFetcher>) -> DataPipeline {
        let clock = Arc::new(ManualClock::new(1_000));
        let mut registry = CacheRegistry::new(clock.clone());
        registry.register(ENTITY_CACHE, 60_000, 100);
        let registry = Arc::new(tokio::sync::RwLock::new(registry));
        let persistent =
            PersistentLayer::open(Box::new(MemoryStorage::new()), "t:", 1 << 22, clock.clone());
        let cache = Arc::new(MultiLayerCache::new(
            registry,
            ENTITY_CACHE,
            Some(persistent),
            HitPolicy::BestEffort,
            clock.clone(),
        ));
        let config = LoaderConfig {
            chunk_size: 10,
            retry_delays_ms: vec![1],
            ..LoaderConfig::default()
        };
        let executor = Arc::new(ChunkExecutor::new(fetcher, config));
        DataPipeline::new(cache, executor, clock)
    }

    fn reporter() -> (Arc<ProgressReporter>, tokio::sync::watch::Receiver<LoadProgress>) {
        let (tx, rx) = tokio::sync::watch::channel(LoadProgress::default());
        (Arc::new(ProgressReporter::new(Arc::new(tx), Duration::ZERO)), rx)
    }

    #[tokio::test]
    async fn test_partial_hit_fetches_only_missing() {
        let fetcher = Arc::new(SyntheticFetcher::new(5));
        let pipeline = pipeline(fetcher.clone());
        let token = CancellationToken::new();

        let first = LoadRequest::new(["S1"], RangeCode::Last30Days);
        pipeline.fetch(&first, &token, None, WriteOrigin::Foreground).await.unwrap();
        assert_eq!(fetcher.call_count(), 1);

        let both = LoadRequest::new(["S2", "S1"], RangeCode::Last30Days);
        let data = pipeline.fetch(&both, &token, None, WriteOrigin::Foreground).await.unwrap();

        assert_eq!(fetcher.call_count(), 2);
        assert_eq!(fetcher.requests_for("S2").len(), 1);
        assert_eq!(data.row_count(), 10);
        assert_eq!(
            data.metadata.cache,
            CacheOutcome::Partial {
                cached: vec!["S1".into()],
                fetched: vec!["S2".into()],
            }
        );

        let again = pipeline.fetch(&both, &token, None, WriteOrigin::Foreground).await.unwrap();
        assert_eq!(again.metadata.cache, CacheOutcome::Complete);
        assert_eq!(fetcher.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mislabelled_rows_are_retagged() {
        let fetcher = Arc::new(SyntheticFetcher::new(3).mislabel_rows());
        let pipeline = pipeline(fetcher);
        let request = LoadRequest::new(["S1", "S2"], RangeCode::Last7Days);

        let data = pipeline
            .fetch(&request, &CancellationToken::new(), None, WriteOrigin::Foreground)
            .await
            .unwrap();

        assert_eq!(data.metadata.per_entity["S1"], 3);
        assert_eq!(data.metadata.per_entity["S2"], 3);
        assert!(data.rows.iter().all(|r| r.site_id == "S1" || r.site_id == "S2"));
    }

    #[tokio::test]
    async fn test_failed_entity_still_caches_the_others() {
        let fetcher = Arc::new(SyntheticFetcher::new(30).fail_always("S2"));
        let pipeline = pipeline(fetcher.clone());
        let request = LoadRequest::new(["S1", "S2"], RangeCode::LastYear);

        let result = pipeline
            .fetch(&request, &CancellationToken::new(), None, WriteOrigin::Foreground)
            .await;
        assert!(matches!(result, Err(DataError::PartialChunk { ref entity, .. }) if entity == "S2"));

        let range = range_key("readings", &request);
        assert!(pipeline.cache().read("S1", &range).await.is_some());
        assert!(pipeline.cache().read("S2", &range).await.is_none());
        assert!(!pipeline.is_in_flight(&canonicalize("readings", &request)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_joiner_restarts_after_foreign_cancel() {
        let fetcher = Arc::new(SyntheticFetcher::new(5).with_latency(Duration::from_millis(50)));
        let pipeline = Arc::new(pipeline(fetcher.clone()));
        let request = LoadRequest::new(["S1"], RangeCode::Last30Days);

        let leader_token = CancellationToken::new();
        let leader = {
            let pipeline = Arc::clone(&pipeline);
            let request = request.clone();
            let token = leader_token.clone();
            tokio::spawn(async move {
                pipeline.fetch(&request, &token, None, WriteOrigin::Foreground).await
            })
        };
        tokio::task::yield_now().await;

        let joiner = {
            let pipeline = Arc::clone(&pipeline);
            let request = request.clone();
            tokio::spawn(async move {
                pipeline
                    .fetch(&request, &CancellationToken::new(), None, WriteOrigin::Foreground)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader_token.cancel();

        assert_eq!(leader.await.unwrap(), Err(DataError::Cancelled));
        let data = joiner.await.unwrap().unwrap();
        assert_eq!(data.row_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_joiner_reports_shared_job_progress() {
        let fetcher = Arc::new(SyntheticFetcher::new(30).with_latency(Duration::from_millis(50)));
        let pipeline = pipeline(fetcher.clone());
        let request = LoadRequest::new(["S1"], RangeCode::LastYear);
        let token = CancellationToken::new();
        let (leader, leader_rx) = reporter();
        let (joiner, joiner_rx) = reporter();

        let (a, b) = tokio::join!(
            pipeline.fetch(&request, &token, Some(leader), WriteOrigin::Foreground),
            pipeline.fetch(&request, &token, Some(joiner), WriteOrigin::Foreground),
        );
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(fetcher.requests_for("S1").len(), 3);

        for rx in [&leader_rx, &joiner_rx] {
            let progress = rx.borrow().clone();
            assert_eq!(progress.loaded_count, 30);
            assert_eq!(progress.expected_count, Some(30));
            assert_eq!(progress.phase, LoadPhase::Processing);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_leader_releases_key() {
        let fetcher = Arc::new(SyntheticFetcher::new(5).with_latency(Duration::from_millis(50)));
        let pipeline = Arc::new(pipeline(fetcher.clone()));
        let request = LoadRequest::new(["S1"], RangeCode::Last30Days);
        let key = canonicalize("readings", &request);

        let token = CancellationToken::new();
        let leader = {
            let pipeline = Arc::clone(&pipeline);
            let request = request.clone();
            let token = token.clone();
            tokio::spawn(async move {
                pipeline.fetch(&request, &token, None, WriteOrigin::Foreground).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(pipeline.is_in_flight(&key));

        token.cancel();
        assert_eq!(leader.await.unwrap(), Err(DataError::Cancelled));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pipeline.is_in_flight(&key));

        let before = fetcher.call_count();
        let data = pipeline
            .fetch(&request, &CancellationToken::new(), None, WriteOrigin::Foreground)
            .await
            .unwrap();
        assert_eq!(data.row_count(), 5);
        assert_eq!(data.metadata.cache, CacheOutcome::Miss);
        assert_eq!(fetcher.call_count(), before + 1);
        assert!(pipeline.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected() {
        let fetcher = Arc::new(SyntheticFetcher::new(5));
        let pipeline = pipeline(fetcher.clone());
        let request = LoadRequest::new(Vec::<String>::new(), RangeCode::Last30Days);

        let result = pipeline
            .fetch(&request, &CancellationToken::new(), None, WriteOrigin::Foreground)
            .await;
        assert!(matches!(result, Err(DataError::InvalidRequest(_))));
        assert_eq!(fetcher.call_count(), 0);
    }
}
