//! Load Progress
//!
//! Phase state machine and per-source progress, published over a watch
//! channel. Chunk updates are throttled to a minimum interval; phase changes
//! and the final emission always go out. A fan-out lets every load waiting
//! on the same shared job report that job's progress.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

// == Load Phase ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadPhase {
    #[default]
    Idle,
    Fetching,
    Parsing,
    Processing,
    Rendering,
    Error,
    Cancelled,
}

impl LoadPhase {
    /// Error and Cancelled fall back to Idle once observed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoadPhase::Error | LoadPhase::Cancelled)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceProgress {
    pub loaded: u64,
    pub expected: Option<u64>,
}

// == Load Progress ==
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadProgress {
    pub phase: LoadPhase,
    pub loaded_count: u64,
    /// Known only once every source has declared its total
    pub expected_count: Option<u64>,
    pub per_source: BTreeMap<String, SourceProgress>,
}

impl LoadProgress {
    fn recompute(&mut self) {
        self.loaded_count = self.per_source.values().map(|s| s.loaded).sum();
        self.expected_count = if self.per_source.is_empty() {
            None
        } else {
            self.per_source.values().map(|s| s.expected).sum()
        };
    }
}

struct ReporterState {
    progress: LoadProgress,
    last_emit: Option<Instant>,
    dirty: bool,
}

// == Progress Reporter ==
/// Progress sink for one load invocation.
pub struct ProgressReporter {
    sender: Arc<watch::Sender<LoadProgress>>,
    min_interval: Duration,
    /// Emissions stop once a newer invocation takes over
    latest: Option<(Arc<AtomicU64>, u64)>,
    state: Mutex<ReporterState>,
}

impl ProgressReporter {
    pub fn new(sender: Arc<watch::Sender<LoadProgress>>, min_interval: Duration) -> Self {
        Self {
            sender,
            min_interval,
            latest: None,
            state: Mutex::new(ReporterState {
                progress: LoadProgress::default(),
                last_emit: None,
                dirty: false,
            }),
        }
    }

    /// Only publish while `latest` still holds `invocation`.
    pub fn for_invocation(mut self, latest: Arc<AtomicU64>, invocation: u64) -> Self {
        self.latest = Some((latest, invocation));
        self
    }

    fn is_current(&self) -> bool {
        match &self.latest {
            Some((latest, id)) => latest.load(Ordering::SeqCst) == *id,
            None => true,
        }
    }

    fn emit(&self, state: &mut ReporterState) {
        state.dirty = false;
        state.last_emit = Some(Instant::now());
        if self.is_current() {
            self.sender.send_replace(state.progress.clone());
        }
    }

    pub fn set_phase(&self, phase: LoadPhase) {
        let mut state = self.state.lock();
        state.progress.phase = phase;
        self.emit(&mut state);
    }

    /// Registers the sources this load will report on.
    pub fn begin_sources(&self, sources: &[String]) {
        let mut state = self.state.lock();
        for source in sources {
            state.progress.per_source.entry(source.clone()).or_default();
        }
        state.progress.recompute();
        self.emit(&mut state);
    }

    /// Adds `rows` loaded for `source`; throttled.
    pub fn record(&self, source: &str, rows: u64, expected: Option<u64>) {
        let mut state = self.state.lock();
        let entry = state.progress.per_source.entry(source.to_string()).or_default();
        entry.loaded += rows;
        if expected.is_some() {
            entry.expected = expected;
        }
        state.progress.recompute();
        state.dirty = true;

        let due = state
            .last_emit
            .map_or(true, |at| at.elapsed() >= self.min_interval);
        if due {
            self.emit(&mut state);
        }
    }

    /// Drops per-source counts, as when a load starts its work over.
    pub fn clear_sources(&self) {
        let mut state = self.state.lock();
        state.progress.per_source.clear();
        state.progress.recompute();
        self.emit(&mut state);
    }

    /// Flushes any throttled update.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        if state.dirty {
            self.emit(&mut state);
        }
    }

    pub fn snapshot(&self) -> LoadProgress {
        self.state.lock().progress.clone()
    }
}

// == Progress Sink ==
/// Where the chunk executor reports per-source progress.
pub trait ProgressSink: Send + Sync {
    fn begin_sources(&self, sources: &[String]);
    fn record(&self, source: &str, rows: u64, expected: Option<u64>);
}

impl ProgressSink for ProgressReporter {
    fn begin_sources(&self, sources: &[String]) {
        ProgressReporter::begin_sources(self, sources);
    }

    fn record(&self, source: &str, rows: u64, expected: Option<u64>) {
        ProgressReporter::record(self, source, rows, expected);
    }
}

// == Progress Fan-out ==
#[derive(Default)]
struct FanoutState {
    sources: Vec<String>,
    totals: BTreeMap<String, SourceProgress>,
    phase: Option<LoadPhase>,
    reporters: Vec<Arc<ProgressReporter>>,
}

/// Progress of one shared job, forwarded to every attached reporter.
#[derive(Default)]
pub struct ProgressFanout {
    state: Mutex<FanoutState>,
}

impl ProgressFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `reporter`, first replaying what the job has reported so far.
    pub fn attach(&self, reporter: Arc<ProgressReporter>) {
        let mut state = self.state.lock();
        if state.reporters.iter().any(|r| Arc::ptr_eq(r, &reporter)) {
            return;
        }
        if !state.sources.is_empty() {
            reporter.begin_sources(&state.sources);
        }
        for (source, totals) in &state.totals {
            reporter.record(source, totals.loaded, totals.expected);
        }
        reporter.flush();
        if let Some(phase) = state.phase {
            reporter.set_phase(phase);
        }
        state.reporters.push(reporter);
    }

    pub fn detach(&self, reporter: &Arc<ProgressReporter>) {
        self.state.lock().reporters.retain(|r| !Arc::ptr_eq(r, reporter));
    }

    pub fn set_phase(&self, phase: LoadPhase) {
        let mut state = self.state.lock();
        state.phase = Some(phase);
        for reporter in &state.reporters {
            reporter.set_phase(phase);
        }
    }

    pub fn flush(&self) {
        for reporter in &self.state.lock().reporters {
            reporter.flush();
        }
    }

    pub fn reporter_count(&self) -> usize {
        self.state.lock().reporters.len()
    }
}

impl ProgressSink for ProgressFanout {
    fn begin_sources(&self, sources: &[String]) {
        let mut state = self.state.lock();
        for source in sources {
            if !state.sources.contains(source) {
                state.sources.push(source.clone());
            }
        }
        for reporter in &state.reporters {
            reporter.begin_sources(sources);
        }
    }

    fn record(&self, source: &str, rows: u64, expected: Option<u64>) {
        let mut state = self.state.lock();
        let totals = state.totals.entry(source.to_string()).or_default();
        totals.loaded += rows;
        if expected.is_some() {
            totals.expected = expected;
        }
        for reporter in &state.reporters {
            reporter.record(source, rows, expected);
        }
    }
}
