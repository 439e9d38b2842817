//! Catalog intake pipeline: duplicate gate, bounded uploads, chunked persistence, and the run state
//! machine tying them together.

mod chunked;
mod config;
mod duplicates;
mod orchestrator;
mod progress;
mod report;
mod runner;

pub use chunked::{write_chunked, CatalogChunkSink, ChunkSink};
pub use config::{
    load_policy, parse_policy, IntakeConfig, RunSettings, DEFAULT_CHUNK_SIZE, DEFAULT_UPLOAD_CONCURRENCY,
};
pub use duplicates::{exclude_duplicates, fold_shared_skus, matched_skus, DuplicateDetector};
pub use orchestrator::{CommitOutcome, DuplicateDecision, IngestRun, IntakeServices, PipelineError};
pub use progress::{
    ChannelProgress, Notifier, ProgressSink, SilentProgress, TracingNotifier, TracingProgress,
};
pub use report::{render_brief, write_run_report};
pub use runner::run_bounded;

pub const CRATE_NAME: &str = "intake-pipeline";
