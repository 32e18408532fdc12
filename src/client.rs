//! Data Client
//!
//! Assembles the cache context, pipeline, loader and prefetcher from a
//! `Config`, a network collaborator and a storage backend. One client is one
//! independent instance of the whole data-access layer.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::{
    CacheRegistry, CachedDataset, CleanupStats, MultiLayerCache, PersistentLayer,
    PersistentStats, RegistrationStats, SharedRegistry, StorageBackend, ENTITY_CACHE,
    PERSISTENT_PREFIX,
};
use crate::clock::{SharedClock, SystemClock};
use crate::config::Config;
use crate::fetch::Fetcher;
use crate::loader::{ChunkExecutor, LoadOutcome, LoadProgress, ProgressiveLoader, ViewState};
use crate::models::LoadRequest;
use crate::pipeline::DataPipeline;
use crate::prefetch::{default_patterns, PrefetchPattern, PrefetchStats, Prefetcher};
use crate::tasks::spawn_cleanup_task;

// == Cache Context ==
/// Process state shared by every component of one client.
#[derive(Clone)]
pub struct CacheContext {
    pub registry: SharedRegistry<CachedDataset>,
    pub clock: SharedClock,
}

impl CacheContext {
    /// Context with the entity registration in place.
    pub fn new(clock: SharedClock, ttl_ms: u64, max_entries: usize) -> Self {
        let mut registry = CacheRegistry::new(Arc::clone(&clock));
        registry.register(ENTITY_CACHE, ttl_ms, max_entries);
        Self {
            registry: Arc::new(tokio::sync::RwLock::new(registry)),
            clock,
        }
    }
}

// == Diagnostics Snapshot ==
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    pub registrations: Vec<RegistrationStats>,
    pub persistent: Option<PersistentStats>,
    pub in_flight: usize,
    pub prefetch: Option<PrefetchStats>,
}

// == Data Client ==
pub struct DataClient {
    config: Config,
    context: CacheContext,
    pipeline: Arc<DataPipeline>,
    loader: ProgressiveLoader,
    prefetcher: Option<Arc<Prefetcher>>,
}

impl DataClient {
    /// Client on the system clock with the default prefetch patterns.
    pub fn new(config: Config, fetcher: Arc<dyn Fetcher>, storage: Box<dyn StorageBackend>) -> Self {
        Self::with_parts(config, fetcher, storage, Arc::new(SystemClock), default_patterns())
    }

    pub fn with_parts(
        config: Config,
        fetcher: Arc<dyn Fetcher>,
        storage: Box<dyn StorageBackend>,
        clock: SharedClock,
        patterns: Vec<PrefetchPattern>,
    ) -> Self {
        let context = CacheContext::new(
            Arc::clone(&clock),
            config.cache.ttl_ms(),
            config.cache.max_entries,
        );
        let persistent = PersistentLayer::open(
            storage,
            PERSISTENT_PREFIX,
            config.cache.persist_budget_bytes,
            Arc::clone(&clock),
        );
        let cache = Arc::new(MultiLayerCache::new(
            Arc::clone(&context.registry),
            ENTITY_CACHE,
            Some(persistent),
            config.cache.hit_policy,
            Arc::clone(&clock),
        ));
        let executor = Arc::new(ChunkExecutor::new(fetcher, config.loader.clone()));
        let pipeline = Arc::new(DataPipeline::new(cache, executor, Arc::clone(&clock)));

        let prefetcher = config.prefetch.enabled.then(|| {
            Arc::new(Prefetcher::new(
                Arc::clone(&pipeline),
                patterns,
                config.prefetch.clone(),
                Arc::clone(&clock),
            ))
        });
        let loader = ProgressiveLoader::new(
            Arc::clone(&pipeline),
            prefetcher.clone(),
            config.loader.progress_interval(),
        );

        info!(
            ttl_secs = config.cache.ttl_secs,
            max_entries = config.cache.max_entries,
            chunk_size = config.loader.chunk_size,
            prefetch = config.prefetch.enabled,
            "Data client ready"
        );

        Self {
            config,
            context,
            pipeline,
            loader,
            prefetcher,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn context(&self) -> &CacheContext {
        &self.context
    }

    pub fn pipeline(&self) -> &Arc<DataPipeline> {
        &self.pipeline
    }

    pub fn prefetcher(&self) -> Option<&Arc<Prefetcher>> {
        self.prefetcher.as_ref()
    }

    // == Loading ==
    pub async fn load(&self, request: LoadRequest) -> LoadOutcome {
        self.loader.load(request).await
    }

    pub fn cancel(&self) {
        self.loader.cancel();
    }

    pub fn progress(&self) -> LoadProgress {
        self.loader.progress()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<LoadProgress> {
        self.loader.subscribe_progress()
    }

    pub fn view(&self) -> ViewState {
        self.loader.view()
    }

    pub fn reset(&self) {
        self.loader.reset();
    }

    // == Maintenance ==
    pub async fn stats(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            registrations: self.context.registry.read().await.stats(),
            persistent: self.pipeline.cache().persistent_stats(),
            in_flight: self.pipeline.in_flight_count(),
            prefetch: self.prefetcher.as_ref().map(|p| p.stats()),
        }
    }

    pub async fn global_cleanup(&self) -> CleanupStats {
        self.context.registry.write().await.global_cleanup()
    }

    /// Sheds `target_reduction_percent` of the in-memory entries.
    pub async fn emergency_clear(&self, target_reduction_percent: u8) -> usize {
        self.context
            .registry
            .write()
            .await
            .emergency_clear(target_reduction_percent)
    }

    pub fn spawn_cleanup(&self) -> JoinHandle<()> {
        spawn_cleanup_task(
            Arc::clone(&self.context.registry),
            self.config.cache.cleanup_interval,
        )
    }
}
