//! Retry Policy
//!
//! Explicit attempt budget and delay schedule, consumed by a generic wrapper.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{DataError, Result};

// == Retry Policy ==
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; 0 behaves as 1
    pub max_attempts: u32,
    /// Delay before retry N is `delays[N-1]`; the last delay repeats
    pub delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_attempts,
            delays,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Vec::new())
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        if self.delays.is_empty() {
            return Duration::ZERO;
        }
        let idx = (retry.saturating_sub(1) as usize).min(self.delays.len() - 1);
        self.delays[idx]
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,
            vec![Duration::from_millis(250), Duration::from_millis(1_000)],
        )
    }
}

// == Retry Wrapper ==
/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. Cancellation ends the loop at once, including
/// during a back-off sleep.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        if token.is_cancelled() {
            return Err(DataError::Cancelled);
        }

        let result = tokio::select! {
            _ = token.cancelled() => return Err(DataError::Cancelled),
            result = op() => result,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(attempt, max_attempts, delay_ms = delay.as_millis() as u64, error = %err, "Retrying");
                tokio::select! {
                    _ = token.cancelled() => return Err(DataError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
