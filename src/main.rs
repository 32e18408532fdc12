//! Sensor Cache - diagnostics server
//!
//! Runs one data client over the synthetic readings backend and exposes it
//! through a small HTTP surface for manual exercising.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sensor_cache::api::{create_router, AppState};
use sensor_cache::cache::{DirectoryStorage, MemoryStorage, StorageBackend};
use sensor_cache::synthetic::SyntheticFetcher;
use sensor_cache::{Config, DataClient};

/// Readings per site served by the demo backend.
const DEMO_RECORDS_PER_SITE: u64 = 120_000;

/// Main entry point for the diagnostics server.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Open the persistent storage backend
/// 4. Build the data client and start the TTL cleanup task
/// 5. Serve the router until SIGINT/SIGTERM
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sensor_cache=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting sensor cache diagnostics server");

    let config = Config::from_env();
    info!(
        "Configuration loaded: ttl={}s, max_entries={}, chunk_size={}, port={}",
        config.cache.ttl_secs, config.cache.max_entries, config.loader.chunk_size, config.server_port
    );

    let storage: Box<dyn StorageBackend> = match &config.cache.persist_dir {
        Some(dir) => {
            let storage = DirectoryStorage::open(dir)
                .with_context(|| format!("opening persist dir {}", dir.display()))?;
            info!("Persistent layer at {}", dir.display());
            Box::new(storage)
        }
        None => Box::new(MemoryStorage::new()),
    };

    let fetcher = SyntheticFetcher::new(DEMO_RECORDS_PER_SITE)
        .with_latency(Duration::from_millis(25));
    let port = config.server_port;
    let client = DataClient::new(config, Arc::new(fetcher), storage);

    let cleanup_handle = client.spawn_cleanup();
    info!("Background cleanup task started");

    let app = create_router(AppState::new(client));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cleanup_handle))
        .await
        .context("server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Waits for Ctrl+C or SIGTERM, then aborts the cleanup task.
async fn shutdown_signal(cleanup_handle: tokio::task::JoinHandle<()>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    cleanup_handle.abort();
    warn!("Cleanup task aborted");
}
