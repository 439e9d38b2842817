//! The intake run state machine.
//!
//! `Idle -> Matching -> (AwaitingDuplicateConfirmation) -> Uploading -> Persisting -> Done | PartiallyFailed`,
//! with `Aborted` reachable from any non-terminal phase on a fatal precondition failure. Once
//! uploading starts the run always drains to a terminal phase.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use intake_core::{
    BatchResult, CatalogRecord, DuplicateRecord, FailureStage, FeedRecord, ImageAsset, ItemFailure,
    PipelinePhase, ProductMatch, RunSummary,
};
use intake_feed::{validate_feed, RawFeedRow, RowRejection};
use intake_match::{MatchingEngine, OverrideError, PolicyError};
use intake_storage::{
    content_type_for, read_asset, upload_path, CatalogRepository, ObjectStore, StorageError,
};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::chunked::{write_chunked, CatalogChunkSink};
use crate::config::RunSettings;
use crate::duplicates::{exclude_duplicates, fold_shared_skus, matched_skus, DuplicateDetector};
use crate::progress::{emit, Notifier, ProgressSink, SilentProgress, TracingNotifier};
use crate::report::write_run_report;
use crate::runner::run_bounded;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The run is aborted; nothing further was committed.
    #[error("intake run aborted: {0}")]
    Fatal(String),
    #[error("cannot {action} while the run is {phase}")]
    InvalidTransition {
        action: &'static str,
        phase: PipelinePhase,
    },
    #[error(transparent)]
    Override(#[from] OverrideError),
    #[error("invalid match policy: {0}")]
    Policy(#[from] PolicyError),
    #[error("sku {0} is not in the validated feed")]
    UnknownSku(String),
}

/// External collaborators of a run.
#[derive(Clone)]
pub struct IntakeServices {
    pub catalog: Arc<dyn CatalogRepository>,
    pub objects: Arc<dyn ObjectStore>,
    pub progress: Arc<dyn ProgressSink>,
    pub notifier: Arc<dyn Notifier>,
}

impl IntakeServices {
    pub fn new(catalog: Arc<dyn CatalogRepository>, objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            catalog,
            objects,
            progress: Arc::new(SilentProgress),
            notifier: Arc::new(TracingNotifier),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateDecision {
    /// Commit everything except the duplicate SKUs.
    Continue,
    /// Drop the run without touching any store.
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Duplicates were found; call [`IngestRun::resolve_duplicates`].
    NeedsConfirmation(Vec<DuplicateRecord>),
    Finished(RunSummary),
    Cancelled,
}

/// One product ready for upload: the feed row plus its primary and secondary images.
#[derive(Debug, Clone)]
struct UploadJob {
    position: usize,
    record: FeedRecord,
    images: Vec<ImageAsset>,
}

impl UploadJob {
    fn from_match(position: usize, m: ProductMatch) -> Option<Self> {
        let record = m.feed_record?;
        let mut images = Vec::with_capacity(1 + m.secondary_images.len());
        images.push(m.image);
        images.extend(m.secondary_images);
        Some(Self {
            position,
            record,
            images,
        })
    }
}

pub struct IngestRun {
    run_id: Uuid,
    owner_id: String,
    settings: RunSettings,
    services: IntakeServices,
    phase: PipelinePhase,
    started_at: DateTime<Utc>,
    matches: Arc<Vec<ProductMatch>>,
    feed: Vec<FeedRecord>,
    rejections: Vec<RowRejection>,
    duplicates: Vec<DuplicateRecord>,
}

impl IngestRun {
    pub fn new(owner_id: impl Into<String>, settings: RunSettings, services: IntakeServices) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            settings,
            services,
            phase: PipelinePhase::Idle,
            started_at: Utc::now(),
            matches: Arc::new(Vec::new()),
            feed: Vec::new(),
            rejections: Vec::new(),
            duplicates: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn phase(&self) -> PipelinePhase {
        self.phase
    }

    /// Current match snapshot. Overrides replace the snapshot; earlier handles keep their view.
    pub fn matches(&self) -> Arc<Vec<ProductMatch>> {
        Arc::clone(&self.matches)
    }

    pub fn rejections(&self) -> &[RowRejection] {
        &self.rejections
    }

    pub fn duplicates(&self) -> &[DuplicateRecord] {
        &self.duplicates
    }

    fn expect_phase(&self, action: &'static str, allowed: &[PipelinePhase]) -> Result<(), PipelineError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(PipelineError::InvalidTransition {
                action,
                phase: self.phase,
            })
        }
    }

    fn abort(&mut self, reason: impl Into<String>) -> PipelineError {
        let reason = reason.into();
        error!(run_id = %self.run_id, owner_id = %self.owner_id, from = %self.phase, %reason, "intake run aborted");
        self.phase = PipelinePhase::Aborted;
        self.clear_state();
        PipelineError::Fatal(reason)
    }

    fn clear_state(&mut self) {
        self.matches = Arc::new(Vec::new());
        self.feed.clear();
        self.duplicates.clear();
    }

    /// Validates the feed and matches `images` against the surviving rows.
    ///
    /// Can be called again while still matching to start over with new inputs. An invalid
    /// match policy is refused before anything is matched and leaves the phase unchanged.
    pub fn start_matching(
        &mut self,
        images: Vec<ImageAsset>,
        rows: Vec<RawFeedRow>,
    ) -> Result<Arc<Vec<ProductMatch>>, PipelineError> {
        self.expect_phase("start matching", &[PipelinePhase::Idle, PipelinePhase::Matching])?;
        if self.owner_id.trim().is_empty() {
            return Err(self.abort("missing owner identity"));
        }
        let engine = MatchingEngine::new(self.settings.policy)?;

        let span = info_span!("matching", run_id = %self.run_id, owner_id = %self.owner_id);
        let _guard = span.enter();

        let validated = validate_feed(rows);
        let matches = engine.match_images(&images, &validated.records);
        info!(
            images = images.len(),
            feed_rows = validated.records.len(),
            rejected_rows = validated.rejections.len(),
            primaries = matches.len(),
            matched = matches.iter().filter(|m| m.is_matched()).count(),
            "matching complete"
        );

        self.feed = validated.records;
        self.rejections = validated.rejections;
        self.matches = Arc::new(matches);
        self.phase = PipelinePhase::Matching;
        Ok(self.matches())
    }

    /// Pins entry `index` to `record` with full confidence.
    pub fn apply_manual_match(
        &mut self,
        index: usize,
        record: FeedRecord,
    ) -> Result<Arc<Vec<ProductMatch>>, PipelineError> {
        self.expect_phase("override a match", &[PipelinePhase::Matching])?;
        let updated = intake_match::apply_manual_match(&self.matches, index, record)?;
        info!(run_id = %self.run_id, index, "manual match applied");
        self.matches = Arc::new(updated);
        Ok(self.matches())
    }

    /// Same as [`IngestRun::apply_manual_match`], picking the row by SKU from the validated feed.
    pub fn apply_manual_sku(&mut self, index: usize, sku: &str) -> Result<Arc<Vec<ProductMatch>>, PipelineError> {
        let record = self
            .feed
            .iter()
            .find(|r| r.sku == sku)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownSku(sku.to_string()))?;
        self.apply_manual_match(index, record)
    }

    /// Drops the run before any external effect. Not available once uploads started.
    pub fn cancel(&mut self) -> Result<(), PipelineError> {
        self.expect_phase(
            "cancel",
            &[
                PipelinePhase::Idle,
                PipelinePhase::Matching,
                PipelinePhase::AwaitingDuplicateConfirmation,
            ],
        )?;
        info!(run_id = %self.run_id, from = %self.phase, "intake run cancelled");
        self.clear_state();
        self.rejections.clear();
        self.phase = PipelinePhase::Idle;
        Ok(())
    }

    /// Freezes the match set and runs the duplicate gate.
    ///
    /// Without duplicates the run executes straight to a terminal phase. With duplicates it
    /// stops in `AwaitingDuplicateConfirmation` and reports them.
    pub async fn commit(&mut self) -> Result<CommitOutcome, PipelineError> {
        self.expect_phase("commit", &[PipelinePhase::Matching])?;
        if self.owner_id.trim().is_empty() {
            return Err(self.abort("missing owner identity"));
        }

        let candidates = matched_skus(&self.matches);
        let detector = DuplicateDetector::new(Arc::clone(&self.services.catalog));
        let span = info_span!("duplicate_gate", run_id = %self.run_id, owner_id = %self.owner_id);
        let found = detector
            .detect(&self.owner_id, &candidates)
            .instrument(span)
            .await;

        match found {
            Err(err) => Err(self.abort(format!("duplicate check failed: {err}"))),
            Ok(duplicates) if duplicates.is_empty() => {
                let matches = self.matches.as_ref().clone();
                self.execute(matches, 0).await.map(CommitOutcome::Finished)
            }
            Ok(duplicates) => {
                info!(run_id = %self.run_id, duplicates = duplicates.len(), "awaiting duplicate confirmation");
                self.duplicates = duplicates.clone();
                self.phase = PipelinePhase::AwaitingDuplicateConfirmation;
                Ok(CommitOutcome::NeedsConfirmation(duplicates))
            }
        }
    }

    pub async fn resolve_duplicates(&mut self, decision: DuplicateDecision) -> Result<CommitOutcome, PipelineError> {
        self.expect_phase(
            "resolve duplicates",
            &[PipelinePhase::AwaitingDuplicateConfirmation],
        )?;
        match decision {
            DuplicateDecision::Cancel => {
                self.cancel()?;
                Ok(CommitOutcome::Cancelled)
            }
            DuplicateDecision::Continue => {
                let duplicates = std::mem::take(&mut self.duplicates);
                let commit_set = exclude_duplicates(self.matches.as_ref().clone(), &duplicates);
                self.execute(commit_set, duplicates.len()).await.map(CommitOutcome::Finished)
            }
        }
    }

    async fn execute(&mut self, commit_set: Vec<ProductMatch>, skipped_duplicates: usize) -> Result<RunSummary, PipelineError> {
        let unmatched = commit_set.iter().filter(|m| !m.is_matched()).count();
        let jobs: Vec<UploadJob> = fold_shared_skus(commit_set)
            .into_iter()
            .enumerate()
            .filter_map(|(position, m)| UploadJob::from_match(position, m))
            .collect();
        let progress = Arc::clone(&self.services.progress);

        self.phase = PipelinePhase::Uploading;
        let upload_span = info_span!("uploading", run_id = %self.run_id, owner_id = %self.owner_id, products = jobs.len());
        let ready = self
            .services
            .objects
            .ensure_ready()
            .instrument(upload_span.clone())
            .await;
        if let Err(err) = ready {
            return Err(self.abort(format!("object store unreachable: {err}")));
        }

        let total = jobs.len();
        emit(progress.as_ref(), PipelinePhase::Uploading, 0, total);
        let objects = Arc::clone(&self.services.objects);
        let owner_id = self.owner_id.clone();
        let uploaded: BatchResult<(usize, CatalogRecord), UploadJob> = run_bounded(
            jobs,
            self.settings.upload_concurrency,
            |job| upload_job(Arc::clone(&objects), owner_id.clone(), job),
            |done| emit(progress.as_ref(), PipelinePhase::Uploading, done, total),
        )
        .instrument(upload_span)
        .await;

        let mut failures: Vec<ItemFailure> = Vec::new();
        for failure in uploaded.failed {
            warn!(run_id = %self.run_id, sku = %failure.item.record.sku, error = %failure.error, "upload failed");
            failures.push(ItemFailure {
                sku: failure.item.record.sku,
                stage: FailureStage::Upload,
                error: failure.error,
            });
        }

        // Uploads settle in any order; persist in match order.
        let mut uploaded_records = uploaded.successful;
        uploaded_records.sort_by_key(|(position, _)| *position);
        let records: Vec<CatalogRecord> = uploaded_records.into_iter().map(|(_, record)| record).collect();

        self.phase = PipelinePhase::Persisting;
        let persist_span = info_span!("persisting", run_id = %self.run_id, owner_id = %self.owner_id, records = records.len());
        let total = records.len();
        emit(progress.as_ref(), PipelinePhase::Persisting, 0, total);
        let sink = CatalogChunkSink::new(Arc::clone(&self.services.catalog), self.owner_id.clone());
        let persisted = write_chunked(records, self.settings.chunk_size, &sink, |done| {
            emit(progress.as_ref(), PipelinePhase::Persisting, done, total)
        })
        .instrument(persist_span)
        .await;

        failures.extend(persisted.failed.into_iter().map(|failure| ItemFailure {
            sku: failure.item.sku,
            stage: FailureStage::Persist,
            error: failure.error,
        }));

        self.phase = if failures.is_empty() {
            PipelinePhase::Done
        } else {
            PipelinePhase::PartiallyFailed
        };
        let summary = RunSummary {
            run_id: self.run_id,
            owner_id: self.owner_id.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            phase: self.phase,
            succeeded: persisted.successful.len(),
            failed: failures.len(),
            skipped_duplicates,
            unmatched,
            rejected_rows: self.rejections.len(),
            failures,
        };
        self.clear_state();
        self.finish(&summary).await;
        Ok(summary)
    }

    async fn finish(&self, summary: &RunSummary) {
        if let Err(err) = self.services.notifier.run_finished(summary).await {
            warn!(run_id = %summary.run_id, error = %format!("{err:#}"), "run notification failed");
        }
        if let Some(dir) = &self.settings.reports_dir {
            match write_run_report(dir, summary).await {
                Ok(path) => info!(run_id = %summary.run_id, report = %path.display(), "run report written"),
                Err(err) => warn!(run_id = %summary.run_id, error = %format!("{err:#}"), "run report not written"),
            }
        }
    }
}

/// Uploads the primary image and then each secondary image; the first failure fails the product.
async fn upload_job(
    objects: Arc<dyn ObjectStore>,
    owner_id: String,
    job: UploadJob,
) -> Result<(usize, CatalogRecord), StorageError> {
    let mut urls = Vec::with_capacity(job.images.len());
    for image in &job.images {
        let bytes = read_asset(&image.source).await?;
        let path = upload_path(Utc::now(), &owner_id, &image.file_name, &bytes);
        let url = objects
            .put(&path, &bytes, content_type_for(&image.file_name))
            .await?;
        urls.push(url);
    }

    let mut urls = urls.into_iter();
    let image_url = urls.next().unwrap_or_default();
    Ok((job.position, CatalogRecord::from_feed(job.record, image_url, urls.collect())))
}
