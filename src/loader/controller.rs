//! Progressive Loader
//!
//! Foreground entry point. Each `load` gets a monotonically increasing
//! invocation id; only the latest invocation may commit its result to the
//! observable state. `cancel` aborts every outstanding load through a shared
//! parent token.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::WriteOrigin;
use crate::error::DataError;
use crate::loader::progress::{LoadPhase, LoadProgress, ProgressReporter};
use crate::models::{LoadRequest, LoadedData};
use crate::pipeline::DataPipeline;
use crate::prefetch::Prefetcher;

// == Load Outcome ==
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadFailure {
    pub message: String,
    /// Whether offering a retry makes sense
    pub retryable: bool,
}

impl From<&DataError> for LoadFailure {
    fn from(err: &DataError) -> Self {
        Self {
            message: err.to_string(),
            retryable: !matches!(err, DataError::InvalidRequest(_)),
        }
    }
}

/// Result of one `load`. Cancellation is a value, never an error.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded {
        data: Arc<LoadedData>,
        /// False when a newer load superseded this one
        committed: bool,
    },
    Failed(LoadFailure),
    Cancelled,
}

impl LoadOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LoadOutcome::Cancelled)
    }
}

// == View State ==
/// What the dashboard currently shows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewState {
    pub data: Option<Arc<LoadedData>>,
    pub last_error: Option<LoadFailure>,
    /// Invocation that produced the current state
    pub invocation: u64,
}

pub struct ProgressiveLoader {
    pipeline: Arc<DataPipeline>,
    prefetcher: Option<Arc<Prefetcher>>,
    progress_interval: Duration,
    /// Id of the most recently started invocation
    latest: Arc<AtomicU64>,
    cancel: Mutex<CancellationToken>,
    progress: Arc<watch::Sender<LoadProgress>>,
    view: watch::Sender<ViewState>,
}

impl ProgressiveLoader {
    pub fn new(
        pipeline: Arc<DataPipeline>,
        prefetcher: Option<Arc<Prefetcher>>,
        progress_interval: Duration,
    ) -> Self {
        let (progress, _) = watch::channel(LoadProgress::default());
        let (view, _) = watch::channel(ViewState::default());
        Self {
            pipeline,
            prefetcher,
            progress_interval,
            latest: Arc::new(AtomicU64::new(0)),
            cancel: Mutex::new(CancellationToken::new()),
            progress: Arc::new(progress),
            view,
        }
    }

    // == Load ==
    pub async fn load(&self, request: LoadRequest) -> LoadOutcome {
        // Allocating and publishing the id in one step keeps `latest` monotonic.
        let invocation = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        let token = self.cancel.lock().child_token();

        let reporter = Arc::new(
            ProgressReporter::new(Arc::clone(&self.progress), self.progress_interval)
                .for_invocation(Arc::clone(&self.latest), invocation),
        );
        reporter.set_phase(LoadPhase::Fetching);
        debug!(invocation, "Load started");

        let result = self
            .pipeline
            .fetch(&request, &token, Some(Arc::clone(&reporter)), WriteOrigin::Foreground)
            .await;

        if token.is_cancelled() || matches!(result, Err(DataError::Cancelled)) {
            reporter.set_phase(LoadPhase::Cancelled);
            info!(invocation, "Load cancelled");
            return LoadOutcome::Cancelled;
        }

        // Checked under the view lock so a superseded load cannot slip its
        // write in after a newer one.
        let is_latest = || self.latest.load(Ordering::SeqCst) == invocation;
        match result {
            Ok(data) => {
                reporter.set_phase(LoadPhase::Rendering);
                let committed = self.view.send_if_modified(|view| {
                    if !is_latest() {
                        return false;
                    }
                    *view = ViewState {
                        data: Some(Arc::clone(&data)),
                        last_error: None,
                        invocation,
                    };
                    true
                });
                if !committed {
                    debug!(invocation, "Superseded result discarded");
                }
                reporter.set_phase(LoadPhase::Idle);

                if let Some(prefetcher) = &self.prefetcher {
                    prefetcher.observe(&request);
                }
                LoadOutcome::Loaded { data, committed }
            }
            Err(err) => {
                let failure = LoadFailure::from(&err);
                warn!(invocation, error = %err, "Load failed");
                // Keep whatever was shown before.
                self.view.send_if_modified(|view| {
                    if !is_latest() {
                        return false;
                    }
                    view.last_error = Some(failure.clone());
                    view.invocation = invocation;
                    true
                });
                reporter.set_phase(LoadPhase::Error);
                LoadOutcome::Failed(failure)
            }
        }
    }

    /// Cancels every outstanding load. Later loads are unaffected.
    pub fn cancel(&self) {
        let mut token = self.cancel.lock();
        token.cancel();
        *token = CancellationToken::new();
        info!("Outstanding loads cancelled");
    }

    /// Current progress. Error and Cancelled are reported once, then the
    /// phase falls back to Idle.
    pub fn progress(&self) -> LoadProgress {
        let current = self.progress.borrow().clone();
        if current.phase.is_terminal() {
            self.progress.send_modify(|p| p.phase = LoadPhase::Idle);
        }
        current
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<LoadProgress> {
        self.progress.subscribe()
    }

    pub fn view(&self) -> ViewState {
        self.view.borrow().clone()
    }

    pub fn subscribe_view(&self) -> watch::Receiver<ViewState> {
        self.view.subscribe()
    }

    /// Clears the shown data and error.
    pub fn reset(&self) {
        self.view.send_replace(ViewState::default());
        self.progress.send_replace(LoadProgress::default());
    }
}
