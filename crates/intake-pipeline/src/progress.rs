//! Progress reporting and end-of-run notification seams.

use async_trait::async_trait;
use intake_core::{PipelinePhase, ProgressEvent, RunSummary};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Receives `(phase, completed, total)` updates while a run executes.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Logs events at debug level, and the last event of each phase at info.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn report(&self, event: ProgressEvent) {
        if event.completed == event.total {
            info!(phase = %event.phase, completed = event.completed, total = event.total, "phase progress");
        } else {
            debug!(phase = %event.phase, completed = event.completed, total = event.total, "phase progress");
        }
    }
}

/// Forwards events to an unbounded channel, for UIs that render progress elsewhere.
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgress {
    fn report(&self, event: ProgressEvent) {
        // Receiver gone means nobody is watching anymore.
        let _ = self.tx.send(event);
    }
}

pub(crate) fn emit(sink: &dyn ProgressSink, phase: PipelinePhase, completed: usize, total: usize) {
    sink.report(ProgressEvent {
        phase,
        completed,
        total,
    });
}

/// Told about every finished run. Failures here are logged and never change the outcome.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn run_finished(&self, summary: &RunSummary) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn run_finished(&self, summary: &RunSummary) -> anyhow::Result<()> {
        if summary.failed > 0 {
            warn!(
                run_id = %summary.run_id,
                owner_id = %summary.owner_id,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "intake run finished with failures"
            );
        } else {
            info!(
                run_id = %summary.run_id,
                owner_id = %summary.owner_id,
                succeeded = summary.succeeded,
                phase = %summary.phase,
                "intake run finished"
            );
        }
        Ok(())
    }
}
