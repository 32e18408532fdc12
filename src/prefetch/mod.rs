//! Predictive Prefetcher
//!
//! Watches foreground loads, matches them against declared patterns and
//! schedules speculative follow-up loads through the same pipeline. Pending
//! work sits in a bounded queue; failures are logged and otherwise ignored.

mod patterns;

pub use patterns::{
    default_patterns, overlaps_history, range_in, range_widening, recent_sites_union,
    service_is, BehaviorEvent, PrefetchPattern,
};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::WriteOrigin;
use crate::canonical::{canonicalize, RequestKey};
use crate::clock::SharedClock;
use crate::config::PrefetchConfig;
use crate::error::DataError;
use crate::models::LoadRequest;
use crate::pipeline::DataPipeline;

// == Stats ==
#[derive(Debug, Default)]
struct Counters {
    triggered: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot for tuning trigger probabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrefetchStats {
    pub triggered: u64,
    pub completed: u64,
    pub failed: u64,
    /// Prefetched values later served to a foreground load
    pub used: u64,
    /// Derived requests already in flight or queued
    pub skipped: u64,
    /// Queued requests pushed out by newer ones
    pub dropped: u64,
    pub queued: usize,
    pub history_len: usize,
}

#[derive(Debug, Clone)]
struct QueuedPrefetch {
    id: u64,
    key: RequestKey,
    pattern: String,
    request: LoadRequest,
}

// == Prefetcher ==
pub struct Prefetcher {
    pipeline: Arc<DataPipeline>,
    patterns: Vec<PrefetchPattern>,
    config: PrefetchConfig,
    clock: SharedClock,
    history: Mutex<VecDeque<BehaviorEvent>>,
    queue: Arc<Mutex<VecDeque<QueuedPrefetch>>>,
    counters: Arc<Counters>,
    rng: Mutex<StdRng>,
    token: Mutex<CancellationToken>,
    next_id: AtomicU64,
}

impl Prefetcher {
    pub fn new(
        pipeline: Arc<DataPipeline>,
        patterns: Vec<PrefetchPattern>,
        config: PrefetchConfig,
        clock: SharedClock,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            pipeline,
            patterns,
            config,
            clock,
            history: Mutex::new(VecDeque::new()),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            counters: Arc::new(Counters::default()),
            rng: Mutex::new(rng),
            token: Mutex::new(CancellationToken::new()),
            next_id: AtomicU64::new(0),
        }
    }

    // == Observe ==
    /// Records a foreground action and schedules whatever it triggers.
    /// Must be called from within a tokio runtime.
    pub fn observe(&self, request: &LoadRequest) {
        if !self.config.enabled {
            return;
        }

        let history: Vec<BehaviorEvent> = self.history.lock().iter().cloned().collect();
        let mut derived = Vec::new();
        for pattern in &self.patterns {
            if !pattern.matches(request, &history) {
                continue;
            }
            if !self.rng.lock().gen_bool(pattern.probability.clamp(0.0, 1.0)) {
                debug!(pattern = %pattern.name, "Pattern matched but not sampled");
                continue;
            }
            if let Some(next) = pattern.derive(request, &history) {
                derived.push((pattern.name.clone(), next, pattern.delay));
            }
        }

        self.remember(request);
        for (pattern, next, delay) in derived {
            Counters::bump(&self.counters.triggered);
            self.schedule(pattern, next, delay);
        }
    }

    fn remember(&self, request: &LoadRequest) {
        let event = BehaviorEvent {
            request: request.clone(),
            key: canonicalize(&request.service, request),
            observed_at: self.clock.now_ms(),
        };
        let mut history = self.history.lock();
        history.push_front(event);
        history.truncate(self.config.history_size);
    }

    fn schedule(&self, pattern: String, request: LoadRequest, delay: Duration) {
        let key = canonicalize(&request.service, &request);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut queue = self.queue.lock();
            if self.pipeline.is_in_flight(&key) || queue.iter().any(|item| item.key == key) {
                Counters::bump(&self.counters.skipped);
                debug!(key = %key, "Prefetch already pending, skipped");
                return;
            }
            if self.config.queue_size == 0 {
                Counters::bump(&self.counters.dropped);
                return;
            }
            while queue.len() >= self.config.queue_size {
                if let Some(dropped) = queue.pop_front() {
                    Counters::bump(&self.counters.dropped);
                    debug!(key = %dropped.key, "Prefetch queue full, dropped oldest");
                }
            }
            queue.push_back(QueuedPrefetch {
                id,
                key: key.clone(),
                pattern,
                request,
            });
        }

        let token = self.token.lock().child_token();
        let queue = Arc::clone(&self.queue);
        let counters = Arc::clone(&self.counters);
        let pipeline = Arc::clone(&self.pipeline);
        let timeout = self.config.timeout();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let item = {
                let mut queue = queue.lock();
                let Some(position) = queue.iter().position(|item| item.id == id) else {
                    return;
                };
                queue.remove(position)
            };
            let Some(item) = item else {
                return;
            };

            debug!(key = %item.key, pattern = %item.pattern, "Running prefetch");
            let fetch = pipeline.fetch(&item.request, &token, None, WriteOrigin::Prefetch);
            match tokio::time::timeout(timeout, fetch).await {
                Ok(Ok(_)) => {
                    Counters::bump(&counters.completed);
                    debug!(key = %item.key, "Prefetch completed");
                }
                Ok(Err(DataError::Cancelled)) => {
                    debug!(key = %item.key, "Prefetch cancelled");
                }
                Ok(Err(err)) => {
                    Counters::bump(&counters.failed);
                    warn!(key = %item.key, error = %err, "Prefetch failed");
                }
                Err(_) => {
                    token.cancel();
                    Counters::bump(&counters.failed);
                    warn!(key = %item.key, timeout_ms = timeout.as_millis() as u64, "Prefetch timed out");
                }
            }
        });
    }

    pub fn stats(&self) -> PrefetchStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        PrefetchStats {
            triggered: load(&self.counters.triggered),
            completed: load(&self.counters.completed),
            failed: load(&self.counters.failed),
            used: self.pipeline.prefetch_hits(),
            skipped: load(&self.counters.skipped),
            dropped: load(&self.counters.dropped),
            queued: self.queue.lock().len(),
            history_len: self.history.lock().len(),
        }
    }

    /// Forgets history, drops queued work and cancels running prefetches.
    /// Counters are kept.
    pub fn clear(&self) {
        let mut token = self.token.lock();
        token.cancel();
        *token = CancellationToken::new();
        drop(token);

        let pending = {
            let mut queue = self.queue.lock();
            let pending = queue.len();
            queue.clear();
            pending
        };
        self.history.lock().clear();
        info!(pending, "Prefetcher cleared");
    }
}
