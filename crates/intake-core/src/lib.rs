//! Core domain model for catalog intake runs.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "intake-core";

pub const MAX_MATCH_SCORE: u8 = 100;

/// Where the bytes of an uploaded image live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetSource {
    File(PathBuf),
    Inline(Arc<[u8]>),
}

/// An image handed over by the file collector. `clean_name` is derived once, at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageAsset {
    pub file_name: String,
    pub clean_name: String,
    #[serde(skip)]
    pub source: AssetSource,
    pub preview_ref: String,
}

/// A validated product row from the merchant feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRecord {
    pub sku: String,
    pub name: String,
    pub price_cents: i64,
    #[serde(default)]
    pub wholesale_price_cents: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Contains,
    Fuzzy,
    None,
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MatchType::Exact => "exact",
            MatchType::Contains => "contains",
            MatchType::Fuzzy => "fuzzy",
            MatchType::None => "none",
        };
        f.pad(label)
    }
}

/// Pairing of one primary image with at most one feed row.
///
/// `match_type == None` exactly when `feed_record` is absent, and an exact match always scores 100.
/// Use [`ProductMatch::matched`] / [`ProductMatch::unmatched`] to keep both invariants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductMatch {
    pub image: ImageAsset,
    pub feed_record: Option<FeedRecord>,
    pub match_type: MatchType,
    pub match_score: u8,
    pub secondary_images: Vec<ImageAsset>,
}

impl ProductMatch {
    pub fn unmatched(image: ImageAsset) -> Self {
        Self {
            image,
            feed_record: None,
            match_type: MatchType::None,
            match_score: 0,
            secondary_images: Vec::new(),
        }
    }

    pub fn matched(image: ImageAsset, record: FeedRecord, match_type: MatchType, score: u8) -> Self {
        let match_score = match match_type {
            MatchType::None => return Self::unmatched(image),
            MatchType::Exact => MAX_MATCH_SCORE,
            _ => score.min(MAX_MATCH_SCORE),
        };
        Self {
            image,
            feed_record: Some(record),
            match_type,
            match_score,
            secondary_images: Vec::new(),
        }
    }

    pub fn with_secondary_images(mut self, secondary_images: Vec<ImageAsset>) -> Self {
        self.secondary_images = secondary_images;
        self
    }

    pub fn sku(&self) -> Option<&str> {
        self.feed_record.as_ref().map(|r| r.sku.as_str())
    }

    pub fn is_matched(&self) -> bool {
        self.feed_record.is_some()
    }

    /// Primary image first, then secondaries in collection order.
    pub fn images(&self) -> impl Iterator<Item = &ImageAsset> {
        std::iter::once(&self.image).chain(self.secondary_images.iter())
    }
}

/// A feed SKU that already exists in the owner's persisted catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateRecord {
    pub sku: String,
    pub existing_product_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure<F> {
    pub item: F,
    pub error: String,
}

/// Partitioned outcome of a batch operation; every input lands in exactly one side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchResult<T, F = T> {
    pub successful: Vec<T>,
    pub failed: Vec<BatchFailure<F>>,
}

impl<T, F> Default for BatchResult<T, F> {
    fn default() -> Self {
        Self {
            successful: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T, F> BatchResult<T, F> {
    pub fn total(&self) -> usize {
        self.successful.len() + self.failed.len()
    }

    pub fn record_failure(&mut self, item: F, error: impl fmt::Display) {
        self.failed.push(BatchFailure {
            item,
            error: error.to_string(),
        });
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelinePhase {
    Idle,
    Matching,
    AwaitingDuplicateConfirmation,
    Uploading,
    Persisting,
    Done,
    PartiallyFailed,
    Aborted,
}

impl PipelinePhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelinePhase::Done | PipelinePhase::PartiallyFailed | PipelinePhase::Aborted
        )
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: PipelinePhase,
    pub completed: usize,
    pub total: usize,
}

/// Row shape written to the catalog store once assets are uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub sku: String,
    pub name: String,
    pub price_cents: i64,
    pub wholesale_price_cents: Option<i64>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub image_url: String,
    pub gallery_urls: Vec<String>,
}

impl CatalogRecord {
    pub fn from_feed(record: FeedRecord, image_url: String, gallery_urls: Vec<String>) -> Self {
        Self {
            sku: record.sku,
            name: record.name,
            price_cents: record.price_cents,
            wholesale_price_cents: record.wholesale_price_cents,
            description: record.description,
            category: record.category,
            image_url,
            gallery_urls,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Upload,
    Persist,
}

/// One product that needs a retry, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub sku: String,
    pub stage: FailureStage,
    pub error: String,
}

/// Terminal report of an intake run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub owner_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phase: PipelinePhase,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped_duplicates: usize,
    pub unmatched: usize,
    pub rejected_rows: usize,
    pub failures: Vec<ItemFailure>,
}
