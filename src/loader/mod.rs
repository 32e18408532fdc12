//! Chunked Progressive Loader
//!
//! Chunk planning, progress reporting, the per-entity chunk executor and
//! the foreground controller with its staleness guard.

mod chunk;
mod controller;
mod executor;
mod progress;

pub use chunk::{clipped_size, plan_chunks, ChunkDescriptor};
pub use controller::{LoadFailure, LoadOutcome, ProgressiveLoader, ViewState};
pub use executor::{ChunkExecutor, EntityPayload};
pub use progress::{
    LoadPhase, LoadProgress, ProgressFanout, ProgressReporter, ProgressSink, SourceProgress,
};
