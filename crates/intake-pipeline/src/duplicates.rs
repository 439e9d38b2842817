//! Duplicate gate helpers: catalog lookup of candidate SKUs and commit-set filtering.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use intake_core::{DuplicateRecord, ProductMatch};
use intake_storage::{CatalogRepository, StorageError};
use tracing::debug;

/// Looks up which candidate SKUs an owner already has in the catalog.
#[derive(Clone)]
pub struct DuplicateDetector {
    repository: Arc<dyn CatalogRepository>,
}

impl DuplicateDetector {
    pub fn new(repository: Arc<dyn CatalogRepository>) -> Self {
        Self { repository }
    }

    /// Returns the SKUs from `candidate_skus` that already exist for `owner_id`.
    ///
    /// Candidates are deduplicated before the lookup. The result follows first-seen candidate
    /// order and never contains a SKU outside the candidate set. Lookup errors are returned as is;
    /// the caller decides whether that is fatal.
    pub async fn detect(
        &self,
        owner_id: &str,
        candidate_skus: &[String],
    ) -> Result<Vec<DuplicateRecord>, StorageError> {
        let mut seen = HashSet::new();
        let unique: Vec<String> = candidate_skus
            .iter()
            .filter(|sku| seen.insert(sku.as_str()))
            .cloned()
            .collect();
        if unique.is_empty() {
            return Ok(Vec::new());
        }

        let existing: HashMap<String, String> = self
            .repository
            .find_skus_by_owner(owner_id, &unique)
            .await?
            .into_iter()
            .map(|row| (row.sku, row.product_id))
            .collect();

        let duplicates: Vec<DuplicateRecord> = unique
            .into_iter()
            .filter_map(|sku| {
                let existing_product_id = existing.get(&sku)?.clone();
                Some(DuplicateRecord {
                    sku,
                    existing_product_id,
                })
            })
            .collect();
        debug!(owner_id, candidates = candidate_skus.len(), duplicates = duplicates.len(), "duplicate check");
        Ok(duplicates)
    }
}

/// Matched SKUs of a run, in match order, without repeats.
pub fn matched_skus(matches: &[ProductMatch]) -> Vec<String> {
    let mut seen = HashSet::new();
    matches
        .iter()
        .filter_map(ProductMatch::sku)
        .filter(|sku| seen.insert(*sku))
        .map(str::to_string)
        .collect()
}

/// Merges matches that landed on the same SKU into one product.
///
/// The first match for a SKU keeps its primary image; every later match contributes its primary
/// and secondary images as secondaries of the first. Unmatched entries pass through in place.
pub fn fold_shared_skus(matches: Vec<ProductMatch>) -> Vec<ProductMatch> {
    let mut folded: Vec<ProductMatch> = Vec::with_capacity(matches.len());
    let mut by_sku: HashMap<String, usize> = HashMap::new();

    for m in matches {
        let Some(sku) = m.sku().map(str::to_string) else {
            folded.push(m);
            continue;
        };
        match by_sku.get(&sku) {
            Some(&idx) => {
                debug!(sku = %sku, file = %m.image.file_name, "folding repeated sku into earlier match");
                let lead = &mut folded[idx];
                lead.secondary_images.push(m.image);
                lead.secondary_images.extend(m.secondary_images);
            }
            None => {
                by_sku.insert(sku, folded.len());
                folded.push(m);
            }
        }
    }
    folded
}

/// Drops matches whose SKU is in `duplicates`. Unmatched entries are kept.
pub fn exclude_duplicates(matches: Vec<ProductMatch>, duplicates: &[DuplicateRecord]) -> Vec<ProductMatch> {
    let skip: HashSet<&str> = duplicates.iter().map(|d| d.sku.as_str()).collect();
    matches
        .into_iter()
        .filter(|m| m.sku().map_or(true, |sku| !skip.contains(sku)))
        .collect()
}
