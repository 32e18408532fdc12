//! TTL Cleanup Task
//!
//! Background task that periodically sweeps expired entries out of every
//! registration and re-applies the size bounds.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::SharedRegistry;

/// Spawns a background task that runs `global_cleanup` every
/// `cleanup_interval_secs` seconds.
///
/// Reads already treat expired entries as absent; the sweep only bounds the
/// memory they hold between reads.
///
/// Abort the returned handle on shutdown.
pub fn spawn_cleanup_task<T>(registry: SharedRegistry<T>, cleanup_interval_secs: u64) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
{
    let interval = Duration::from_secs(cleanup_interval_secs.max(1));

    tokio::spawn(async move {
        info!(
            "Starting TTL cleanup task with interval of {} seconds",
            interval.as_secs()
        );

        loop {
            tokio::time::sleep(interval).await;

            let stats = registry.write().await.global_cleanup();

            if stats.expired_removed > 0 || stats.evicted > 0 {
                info!(
                    expired = stats.expired_removed,
                    evicted = stats.evicted,
                    remaining = stats.remaining_entries,
                    "TTL cleanup sweep"
                );
            } else {
                debug!("TTL cleanup: no expired entries found");
            }
        }
    })
}
