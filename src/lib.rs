//! Sensor Cache - data-access layer for a sensor monitoring dashboard
//!
//! Multi-layer TTL cache, single-flight request de-duplication, chunked
//! progressive loading with cancellation, and predictive prefetching.

pub mod api;
pub mod cache;
pub mod canonical;
pub mod client;
pub mod clock;
pub mod config;
pub mod dedupe;
pub mod error;
pub mod fetch;
pub mod loader;
pub mod models;
pub mod pipeline;
pub mod prefetch;
pub mod retry;
pub mod synthetic;
pub mod tasks;

pub use api::AppState;
pub use client::{CacheContext, DataClient, DiagnosticsSnapshot};
pub use config::Config;
pub use error::{DataError, Result};
pub use fetch::Fetcher;
pub use loader::{LoadOutcome, LoadPhase, LoadProgress};
pub use models::{LoadRequest, LoadedData, RangeCode};
pub use tasks::spawn_cleanup_task;
