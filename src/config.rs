//! Configuration Module
//!
//! Handles loading and managing configuration from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::HitPolicy;
use crate::models::RangeCode;
use crate::retry::RetryPolicy;

/// Cache layer parameters.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied to every entity slot, in seconds
    pub ttl_secs: u64,
    /// Entity slots kept in memory before FIFO eviction
    pub max_entries: usize,
    /// Background cleanup interval in seconds
    pub cleanup_interval: u64,
    /// Total byte budget of the persistent layer
    pub persist_budget_bytes: usize,
    /// Directory for the persistent layer; in-memory storage when unset
    pub persist_dir: Option<PathBuf>,
    pub hit_policy: HitPolicy,
}

impl CacheConfig {
    pub fn ttl_ms(&self) -> u64 {
        self.ttl_secs * 1_000
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            max_entries: 200,
            cleanup_interval: 300,
            persist_budget_bytes: 5 * 1024 * 1024,
            persist_dir: None,
            hit_policy: HitPolicy::BestEffort,
        }
    }
}

/// Chunked loader parameters.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub chunk_size: u64,
    /// Upper bound on chunk requests outstanding at once
    pub max_concurrent_chunks: usize,
    /// Range codes fetched in chunks
    pub large_ranges: Vec<RangeCode>,
    pub progress_interval_ms: u64,
    /// Pause between consecutive chunks of one entity
    pub chunk_pacing_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_delays_ms: Vec<u64>,
}

impl LoaderConfig {
    pub fn is_large(&self, range: RangeCode) -> bool {
        self.large_ranges.contains(&range)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            self.retry_delays_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        )
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn chunk_pacing(&self) -> Duration {
        Duration::from_millis(self.chunk_pacing_ms)
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: 25_000,
            max_concurrent_chunks: 2,
            large_ranges: vec![RangeCode::Last90Days, RangeCode::LastYear, RangeCode::All],
            progress_interval_ms: 100,
            chunk_pacing_ms: 0,
            retry_max_attempts: 3,
            retry_delays_ms: vec![250, 1_000],
        }
    }
}

/// Predictive prefetch parameters.
#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    pub enabled: bool,
    /// Behaviour events remembered, most recent first
    pub history_size: usize,
    /// Pending prefetches kept before the oldest is dropped
    pub queue_size: usize,
    pub timeout_ms: u64,
    /// Fixed seed for trigger probabilities; entropy-seeded when unset
    pub seed: Option<u64>,
}

impl PrefetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            history_size: 20,
            queue_size: 10,
            timeout_ms: 30_000,
            seed: None,
        }
    }
}

/// Service configuration.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub cache: CacheConfig,
    pub loader: LoaderConfig,
    pub prefetch: PrefetchConfig,
    /// HTTP port of the diagnostics API
    pub server_port: u16,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_TTL_SECS` (600), `MAX_ENTRIES` (200), `CLEANUP_INTERVAL` (300)
    /// - `PERSIST_BUDGET_BYTES` (5 MiB), `PERSIST_DIR` (unset), `HIT_POLICY` (`best-effort`)
    /// - `CHUNK_SIZE` (25000), `MAX_CONCURRENT_CHUNKS` (2), `LARGE_RANGES` (`90d,1y,all`)
    /// - `PROGRESS_INTERVAL_MS` (100), `CHUNK_PACING_MS` (0)
    /// - `RETRY_MAX_ATTEMPTS` (3), `RETRY_DELAYS_MS` (`250,1000`)
    /// - `PREFETCH_ENABLED` (true), `PREFETCH_HISTORY` (20), `PREFETCH_QUEUE` (10)
    /// - `PREFETCH_TIMEOUT_MS` (30000), `PREFETCH_SEED` (unset)
    /// - `SERVER_PORT` (3000)
    pub fn from_env() -> Self {
        let cache_defaults = CacheConfig::default();
        let loader_defaults = LoaderConfig::default();
        let prefetch_defaults = PrefetchConfig::default();

        Self {
            cache: CacheConfig {
                ttl_secs: parse_var("CACHE_TTL_SECS").unwrap_or(cache_defaults.ttl_secs),
                max_entries: parse_var("MAX_ENTRIES").unwrap_or(cache_defaults.max_entries),
                cleanup_interval: parse_var("CLEANUP_INTERVAL")
                    .unwrap_or(cache_defaults.cleanup_interval),
                persist_budget_bytes: parse_var("PERSIST_BUDGET_BYTES")
                    .unwrap_or(cache_defaults.persist_budget_bytes),
                persist_dir: env::var("PERSIST_DIR")
                    .ok()
                    .filter(|v| !v.trim().is_empty())
                    .map(PathBuf::from),
                hit_policy: env::var("HIT_POLICY")
                    .ok()
                    .and_then(|v| HitPolicy::parse(&v))
                    .unwrap_or(cache_defaults.hit_policy),
            },
            loader: LoaderConfig {
                chunk_size: parse_var("CHUNK_SIZE")
                    .filter(|n| *n > 0)
                    .unwrap_or(loader_defaults.chunk_size),
                max_concurrent_chunks: parse_var("MAX_CONCURRENT_CHUNKS")
                    .filter(|n| *n > 0)
                    .unwrap_or(loader_defaults.max_concurrent_chunks),
                large_ranges: env::var("LARGE_RANGES")
                    .ok()
                    .map(|v| parse_ranges(&v))
                    .unwrap_or(loader_defaults.large_ranges),
                progress_interval_ms: parse_var("PROGRESS_INTERVAL_MS")
                    .unwrap_or(loader_defaults.progress_interval_ms),
                chunk_pacing_ms: parse_var("CHUNK_PACING_MS")
                    .unwrap_or(loader_defaults.chunk_pacing_ms),
                retry_max_attempts: parse_var("RETRY_MAX_ATTEMPTS")
                    .unwrap_or(loader_defaults.retry_max_attempts),
                retry_delays_ms: env::var("RETRY_DELAYS_MS")
                    .ok()
                    .and_then(|v| parse_list(&v))
                    .unwrap_or(loader_defaults.retry_delays_ms),
            },
            prefetch: PrefetchConfig {
                enabled: parse_var("PREFETCH_ENABLED").unwrap_or(prefetch_defaults.enabled),
                history_size: parse_var("PREFETCH_HISTORY")
                    .unwrap_or(prefetch_defaults.history_size),
                queue_size: parse_var("PREFETCH_QUEUE").unwrap_or(prefetch_defaults.queue_size),
                timeout_ms: parse_var("PREFETCH_TIMEOUT_MS")
                    .unwrap_or(prefetch_defaults.timeout_ms),
                seed: parse_var("PREFETCH_SEED"),
            },
            server_port: parse_var("SERVER_PORT").unwrap_or(3000),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            loader: LoaderConfig::default(),
            prefetch: PrefetchConfig::default(),
            server_port: 3000,
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Comma-separated numbers; None if any item is malformed.
fn parse_list(value: &str) -> Option<Vec<u64>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().ok())
        .collect()
}

/// Comma-separated range codes; unknown codes are skipped.
fn parse_ranges(value: &str) -> Vec<RangeCode> {
    value
        .split(',')
        .filter_map(RangeCode::from_phrase)
        .collect()
}
