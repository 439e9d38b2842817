//! Filename normalization, string similarity, and image-to-feed matching.

use std::collections::HashMap;

use intake_core::{AssetSource, FeedRecord, ImageAsset, MatchType, ProductMatch, MAX_MATCH_SCORE};
use serde::{Deserialize, Serialize};
use strsim::{normalized_levenshtein, sorensen_dice};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "intake-match";

const SEPARATORS: [char; 3] = ['_', '-', '.'];

/// Drops a trailing extension (`.jpg`, `.webp`, ...) and any directory prefix.
///
/// Only alphanumeric suffixes of at most five chars containing a letter count as extensions,
/// so `v1.5` keeps its numeric tail.
pub fn strip_extension(file_name: &str) -> &str {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    match base.rfind('.') {
        Some(idx) if idx > 0 && is_extension(&base[idx + 1..]) => &base[..idx],
        _ => base,
    }
}

fn is_extension(ext: &str) -> bool {
    (1..=5).contains(&ext.len())
        && ext.chars().all(|c| c.is_ascii_alphanumeric())
        && ext.chars().any(|c| c.is_ascii_alphabetic())
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| SEPARATORS.contains(&c) || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn is_numeric(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_ascii_digit())
}

/// Clean, comparable name for a raw image filename.
///
/// `"PlatoAzul-2.JPG"` becomes `"platoazul"`. A lone numeric token is kept so that files named
/// after a bare SKU still carry it.
pub fn normalize(file_name: &str) -> String {
    let mut tokens = tokens(strip_extension(file_name));
    while tokens.len() > 1 && tokens.last().is_some_and(|t| is_numeric(t)) {
        tokens.pop();
    }
    tokens.join(" ")
}

/// Lower-cased, separator-free rendition of free text (product names, SKUs).
pub fn normalize_text(text: &str) -> String {
    tokens(text).join(" ")
}

pub fn compact(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Numeric index suffix (`-2`, `_3`) marking a secondary shot of a product, if any.
pub fn index_suffix(file_name: &str) -> Option<u32> {
    let tokens = tokens(strip_extension(file_name));
    if tokens.len() < 2 {
        return None;
    }
    tokens.last().filter(|t| is_numeric(t))?.parse().ok()
}

/// Builds an [`ImageAsset`] with its clean name derived once.
pub fn prepare_asset(
    file_name: impl Into<String>,
    source: AssetSource,
    preview_ref: impl Into<String>,
) -> ImageAsset {
    let file_name = file_name.into();
    ImageAsset {
        clean_name: normalize(&file_name),
        file_name,
        source,
        preview_ref: preview_ref.into(),
    }
}

/// Share of adjacent-character pairs the two strings have in common, in `[0, 1]`.
pub fn bigram_overlap(a: &str, b: &str) -> f64 {
    sorensen_dice(a, b)
}

/// `1 - distance / max_len`, in `[0, 1]`.
pub fn edit_similarity(a: &str, b: &str) -> f64 {
    normalized_levenshtein(a, b)
}

/// Similarity in `0..=100`: the better of bigram overlap and edit similarity.
///
/// Symmetric; blank input on either side scores 0.
pub fn score(a: &str, b: &str) -> u8 {
    if a.trim().is_empty() || b.trim().is_empty() {
        return 0;
    }
    let best = bigram_overlap(a, b).max(edit_similarity(a, b));
    (best * f64::from(MAX_MATCH_SCORE))
        .round()
        .clamp(0.0, f64::from(MAX_MATCH_SCORE)) as u8
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("fuzzy_floor must be within 1..=100, got {0}")]
    FuzzyFloor(u8),
    #[error("contains range {floor}..={ceiling} must sit inside 0..=99")]
    ContainsRange { floor: u8, ceiling: u8 },
    #[error("min_contains_len must be at least 1")]
    MinContainsLen,
}

/// Thresholds steering the matcher. Defaults mirror the values merchants have been using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchPolicy {
    pub fuzzy_floor: u8,
    pub contains_floor: u8,
    pub contains_ceiling: u8,
    /// Shortest name (whitespace removed) allowed to count as contained in the other side.
    pub min_contains_len: usize,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            fuzzy_floor: 50,
            contains_floor: 80,
            contains_ceiling: 99,
            min_contains_len: 3,
        }
    }
}

impl MatchPolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.fuzzy_floor == 0 || self.fuzzy_floor > MAX_MATCH_SCORE {
            return Err(PolicyError::FuzzyFloor(self.fuzzy_floor));
        }
        if self.contains_floor > self.contains_ceiling || self.contains_ceiling >= MAX_MATCH_SCORE {
            return Err(PolicyError::ContainsRange {
                floor: self.contains_floor,
                ceiling: self.contains_ceiling,
            });
        }
        if self.min_contains_len == 0 {
            return Err(PolicyError::MinContainsLen);
        }
        Ok(())
    }

    fn contains_score(&self, ratio: f64) -> u8 {
        let span = f64::from(self.contains_ceiling.saturating_sub(self.contains_floor));
        let bump = (span * ratio.clamp(0.0, 1.0)).round() as u8;
        self.contains_floor.saturating_add(bump).min(MAX_MATCH_SCORE - 1)
    }
}

/// Feed row with its comparison keys computed once per run.
struct PreparedRow<'a> {
    record: &'a FeedRecord,
    sku_lower: String,
    sku_text: String,
    name_text: String,
    name_compact: String,
}

impl<'a> PreparedRow<'a> {
    fn new(record: &'a FeedRecord) -> Self {
        let name_text = normalize_text(&record.name);
        Self {
            record,
            sku_lower: record.sku.trim().to_lowercase(),
            sku_text: normalize_text(&record.sku),
            name_compact: compact(&name_text),
            name_text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    row: usize,
    match_type: MatchType,
    score: u8,
}

#[derive(Debug, Clone, Default)]
pub struct MatchingEngine {
    policy: MatchPolicy,
}

impl MatchingEngine {
    /// Rejects policies that [`MatchPolicy::validate`] refuses.
    pub fn new(policy: MatchPolicy) -> Result<Self, PolicyError> {
        policy.validate()?;
        Ok(Self { policy })
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }

    /// Assigns each primary image its best feed row and folds index-suffixed siblings
    /// (`foo-2.jpg`, `foo-3.jpg`) in as secondary images.
    ///
    /// Output has one entry per image group, ordered by the group's first image.
    pub fn match_images(&self, images: &[ImageAsset], feed: &[FeedRecord]) -> Vec<ProductMatch> {
        let rows: Vec<PreparedRow<'_>> = feed.iter().map(PreparedRow::new).collect();

        group_images(images)
            .into_iter()
            .map(|group| {
                let primary = &images[group.primary];
                let secondaries = group
                    .secondaries
                    .iter()
                    .map(|&idx| images[idx].clone())
                    .collect::<Vec<_>>();
                let product_match = match self.best_candidate(primary, &rows) {
                    Some(c) => ProductMatch::matched(
                        primary.clone(),
                        rows[c.row].record.clone(),
                        c.match_type,
                        c.score,
                    ),
                    None => ProductMatch::unmatched(primary.clone()),
                };
                debug!(
                    file = %primary.file_name,
                    clean_name = %primary.clean_name,
                    match_type = %product_match.match_type,
                    score = product_match.match_score,
                    sku = product_match.sku().unwrap_or("-"),
                    secondaries = secondaries.len(),
                    "image matched"
                );
                product_match.with_secondary_images(secondaries)
            })
            .collect()
    }

    fn best_candidate(&self, image: &ImageAsset, rows: &[PreparedRow<'_>]) -> Option<Candidate> {
        self.exact_candidate(image, rows)
            .or_else(|| self.contains_candidate(image, rows))
            .or_else(|| self.fuzzy_candidate(image, rows))
    }

    /// SKU substring hit in the clean name. When several SKUs hit, the longest wins; ties go to
    /// the earliest row. Index suffixes are already gone from the clean name, so `-2` never hits SKU `2`.
    fn exact_candidate(&self, image: &ImageAsset, rows: &[PreparedRow<'_>]) -> Option<Candidate> {
        let hay = image.clean_name.as_str();
        if hay.is_empty() {
            return None;
        }

        let mut best: Option<(usize, usize)> = None;
        for (idx, row) in rows.iter().enumerate() {
            if row.sku_lower.is_empty() {
                continue;
            }
            let hit = hay.contains(&row.sku_lower)
                || (!row.sku_text.is_empty() && hay.contains(&row.sku_text));
            if hit && best.map_or(true, |(_, len)| row.sku_lower.len() > len) {
                best = Some((idx, row.sku_lower.len()));
            }
        }

        best.map(|(row, _)| Candidate {
            row,
            match_type: MatchType::Exact,
            score: MAX_MATCH_SCORE,
        })
    }

    /// Product name contained in the clean name or the other way round, scored by length ratio.
    fn contains_candidate(&self, image: &ImageAsset, rows: &[PreparedRow<'_>]) -> Option<Candidate> {
        let clean = image.clean_name.as_str();
        let clean_compact = compact(clean);
        if clean_compact.is_empty() {
            return None;
        }

        let mut best: Option<Candidate> = None;
        for (idx, row) in rows.iter().enumerate() {
            if row.name_compact.is_empty() {
                continue;
            }
            let (shorter, longer) = if clean_compact.len() <= row.name_compact.len() {
                (clean_compact.chars().count(), row.name_compact.chars().count())
            } else {
                (row.name_compact.chars().count(), clean_compact.chars().count())
            };
            if shorter < self.policy.min_contains_len {
                continue;
            }

            let contained = clean.contains(&row.name_text)
                || row.name_text.contains(clean)
                || clean_compact.contains(&row.name_compact)
                || row.name_compact.contains(&clean_compact);
            if !contained {
                continue;
            }

            let score = self.policy.contains_score(shorter as f64 / longer as f64);
            if best.map_or(true, |b| score > b.score) {
                best = Some(Candidate {
                    row: idx,
                    match_type: MatchType::Contains,
                    score,
                });
            }
        }
        best
    }

    /// Highest similarity over every row; equal scores resolve to the earliest row.
    fn fuzzy_candidate(&self, image: &ImageAsset, rows: &[PreparedRow<'_>]) -> Option<Candidate> {
        let mut best: Option<Candidate> = None;
        for (idx, row) in rows.iter().enumerate() {
            let s = score(&image.clean_name, &row.name_text);
            if best.map_or(true, |b| s > b.score) {
                best = Some(Candidate {
                    row: idx,
                    match_type: MatchType::Fuzzy,
                    score: s,
                });
            }
        }
        best.filter(|c| c.score >= self.policy.fuzzy_floor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ImageGroup {
    primary: usize,
    secondaries: Vec<usize>,
}

/// Groups images sharing a clean name. The first member without an index suffix leads the
/// group; failing that, the first member does.
fn group_images(images: &[ImageAsset]) -> Vec<ImageGroup> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut by_name: HashMap<&str, usize> = HashMap::new();

    for (idx, image) in images.iter().enumerate() {
        if image.clean_name.is_empty() {
            groups.push(vec![idx]);
            continue;
        }
        match by_name.get(image.clean_name.as_str()) {
            Some(&g) => groups[g].push(idx),
            None => {
                by_name.insert(image.clean_name.as_str(), groups.len());
                groups.push(vec![idx]);
            }
        }
    }

    groups
        .into_iter()
        .map(|members| {
            let lead = members
                .iter()
                .position(|&i| index_suffix(&images[i].file_name).is_none())
                .unwrap_or(0);
            let primary = members[lead];
            let secondaries = members.into_iter().filter(|&i| i != primary).collect();
            ImageGroup {
                primary,
                secondaries,
            }
        })
        .collect()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OverrideError {
    #[error("no match at index {index}; the run has {len} matches")]
    IndexOutOfRange { index: usize, len: usize },
}

/// Returns a new match list where entry `index` is pinned to `record` as a full-confidence exact
/// match. Other entries are carried over untouched; secondary images stay with the entry.
pub fn apply_manual_match(
    matches: &[ProductMatch],
    index: usize,
    record: FeedRecord,
) -> Result<Vec<ProductMatch>, OverrideError> {
    let Some(target) = matches.get(index) else {
        return Err(OverrideError::IndexOutOfRange {
            index,
            len: matches.len(),
        });
    };

    let replaced = ProductMatch::matched(target.image.clone(), record, MatchType::Exact, MAX_MATCH_SCORE)
        .with_secondary_images(target.secondary_images.clone());

    Ok(matches
        .iter()
        .enumerate()
        .map(|(i, m)| if i == index { replaced.clone() } else { m.clone() })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn img(name: &str) -> ImageAsset {
        prepare_asset(name, AssetSource::Inline(Arc::from(&b"x"[..])), name)
    }

    fn row(sku: &str, name: &str, price_cents: i64) -> FeedRecord {
        FeedRecord {
            sku: sku.to_string(),
            name: name.to_string(),
            price_cents,
            wholesale_price_cents: None,
            description: None,
            category: None,
        }
    }

    #[test]
    fn normalize_strips_extension_separators_and_index_suffix() {
        assert_eq!(normalize("Taza_Roja-2.JPG"), "taza roja");
        assert_eq!(normalize("platoazul-3.jpg"), "platoazul");
        assert_eq!(normalize("A1_foto.jpg"), "a1 foto");
        assert_eq!(normalize("  spaced name .png"), "spaced name");
        assert_eq!(normalize("shots/vaso.v2.webp"), "vaso v2");
    }

    #[test]
    fn normalize_keeps_a_lone_numeric_token() {
        assert_eq!(normalize("12345.jpg"), "12345");
        assert_eq!(normalize("12345-2.jpg"), "12345");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn index_suffix_only_reports_trailing_numbers() {
        assert_eq!(index_suffix("platoazul-2.jpg"), Some(2));
        assert_eq!(index_suffix("platoazul.jpg"), None);
        assert_eq!(index_suffix("2.jpg"), None);
    }

    #[test]
    fn score_degenerate_and_identical_inputs() {
        assert_eq!(score("", "taza"), 0);
        assert_eq!(score("taza", "   "), 0);
        assert_eq!(score("taza roja", "taza roja"), 100);
    }

    #[test]
    fn scenario_exact_sku_in_filename() {
        let engine = MatchingEngine::default();
        let feed = vec![row("A1", "Taza Roja", 100)];
        let matches = engine.match_images(&[img("A1_foto.jpg")], &feed);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].match_type, MatchType::Exact);
        assert_eq!(matches[0].match_score, 100);
        assert_eq!(matches[0].sku(), Some("A1"));
    }

    #[test]
    fn scenario_compact_name_with_secondary_image() {
        let engine = MatchingEngine::default();
        let feed = vec![row("B2", "Plato Azul", 50)];
        let images = [img("platoazul-2.jpg"), img("platoazul-3.jpg")];
        let matches = engine.match_images(&images, &feed);

        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert!(matches!(m.match_type, MatchType::Contains | MatchType::Fuzzy));
        assert!(m.match_score >= 70);
        assert_eq!(m.sku(), Some("B2"));
        assert_eq!(m.image.file_name, "platoazul-2.jpg");
        assert_eq!(m.secondary_images.len(), 1);
        assert_eq!(m.secondary_images[0].file_name, "platoazul-3.jpg");
    }

    #[test]
    fn scenario_unrelated_image_is_unmatched() {
        let engine = MatchingEngine::default();
        let feed = vec![row("A1", "Taza Roja", 100), row("B2", "Plato Azul", 50)];
        let matches = engine.match_images(&[img("random_unrelated.png")], &feed);
        assert_eq!(matches[0].match_type, MatchType::None);
        assert!(matches[0].feed_record.is_none());
        assert_eq!(matches[0].match_score, 0);
    }

    #[test]
    fn unsuffixed_image_leads_its_group() {
        let engine = MatchingEngine::default();
        let feed = vec![row("C3", "Vaso Verde", 80)];
        let images = [img("vaso_verde-2.jpg"), img("vaso_verde.jpg")];
        let matches = engine.match_images(&images, &feed);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].image.file_name, "vaso_verde.jpg");
        assert_eq!(matches[0].secondary_images[0].file_name, "vaso_verde-2.jpg");
    }

    #[test]
    fn longest_sku_wins_among_exact_hits() {
        let engine = MatchingEngine::default();
        let feed = vec![row("A1", "Taza", 100), row("A12", "Taza Grande", 150)];
        let matches = engine.match_images(&[img("a12_frente.jpg")], &feed);
        assert_eq!(matches[0].sku(), Some("A12"));
    }

    #[test]
    fn index_suffix_never_counts_as_a_sku_hit() {
        let engine = MatchingEngine::default();
        let feed = vec![row("2", "Otro Producto", 10), row("B2", "Plato Azul", 50)];
        let images = [img("platoazul-2.jpg"), img("platoazul-3.jpg")];
        let matches = engine.match_images(&images, &feed);

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].image.clean_name, "platoazul");
        assert_eq!(matches[0].sku(), Some("B2"));
        assert_ne!(matches[0].match_type, MatchType::Exact);
        assert!(matches[0].match_score >= 70);
        assert_eq!(matches[0].secondary_images[0].file_name, "platoazul-3.jpg");
    }

    #[test]
    fn bare_numeric_sku_with_index_suffix_still_matches() {
        let engine = MatchingEngine::default();
        let feed = vec![row("12345", "Silla", 10)];
        let matches = engine.match_images(&[img("12345-2.jpg")], &feed);
        assert_eq!(matches[0].match_type, MatchType::Exact);
        assert_eq!(matches[0].sku(), Some("12345"));
    }

    #[test]
    fn contains_score_scales_with_length_ratio() {
        let engine = MatchingEngine::default();
        let feed = vec![row("X9", "Taza", 100)];
        let matches = engine.match_images(&[img("taza_ceramica_artesanal.jpg")], &feed);
        assert_eq!(matches[0].match_type, MatchType::Contains);
        assert!((80..99).contains(&matches[0].match_score));
    }

    #[test]
    fn fuzzy_ties_resolve_to_earliest_row() {
        let engine = MatchingEngine::default();
        let feed = vec![row("T1", "mesa rojo", 10), row("T2", "mesa rojo", 20)];
        let matches = engine.match_images(&[img("mesa_roja.jpg")], &feed);
        assert_eq!(matches[0].match_type, MatchType::Fuzzy);
        assert_eq!(matches[0].sku(), Some("T1"));
    }

    #[test]
    fn fuzzy_floor_is_configurable() {
        let strict = MatchingEngine::new(MatchPolicy {
            fuzzy_floor: 95,
            ..MatchPolicy::default()
        })
        .expect("valid policy");
        let feed = vec![row("T1", "mesa rojo", 10)];
        let matches = strict.match_images(&[img("mesa_roja.jpg")], &feed);
        assert_eq!(matches[0].match_type, MatchType::None);
    }

    #[test]
    fn manual_override_pins_exact_and_leaves_siblings() {
        let engine = MatchingEngine::default();
        let feed = vec![row("A1", "Taza Roja", 100), row("B2", "Plato Azul", 50)];
        let images = [img("A1_foto.jpg"), img("random_unrelated.png")];
        let matches = engine.match_images(&images, &feed);

        let updated = apply_manual_match(&matches, 1, feed[1].clone()).expect("override");
        assert_eq!(updated[1].match_type, MatchType::Exact);
        assert_eq!(updated[1].match_score, 100);
        assert_eq!(updated[1].sku(), Some("B2"));
        assert_eq!(updated[0], matches[0]);
        assert_eq!(matches[1].match_type, MatchType::None);
    }

    #[test]
    fn manual_override_rejects_bad_index() {
        let err = apply_manual_match(&[], 0, row("A1", "Taza", 1)).unwrap_err();
        assert_eq!(err, OverrideError::IndexOutOfRange { index: 0, len: 0 });
    }

    #[test]
    fn policy_validation() {
        assert!(MatchPolicy::default().validate().is_ok());
        let bad = MatchPolicy {
            contains_floor: 90,
            contains_ceiling: 85,
            ..MatchPolicy::default()
        };
        assert!(matches!(bad.validate(), Err(PolicyError::ContainsRange { .. })));
        let bad = MatchPolicy {
            fuzzy_floor: 0,
            ..MatchPolicy::default()
        };
        assert_eq!(bad.validate(), Err(PolicyError::FuzzyFloor(0)));
    }

    #[test]
    fn engine_refuses_an_inverted_contains_range() {
        let inverted = MatchPolicy {
            contains_floor: 95,
            contains_ceiling: 90,
            ..MatchPolicy::default()
        };
        assert!(matches!(
            MatchingEngine::new(inverted),
            Err(PolicyError::ContainsRange { floor: 95, ceiling: 90 })
        ));
    }

    #[test]
    fn contains_score_saturates_on_an_unchecked_policy() {
        let inverted = MatchPolicy {
            contains_floor: 95,
            contains_ceiling: 90,
            ..MatchPolicy::default()
        };
        assert_eq!(inverted.contains_score(1.0), 95);
        let wide = MatchPolicy {
            contains_floor: 250,
            contains_ceiling: 255,
            ..MatchPolicy::default()
        };
        assert_eq!(wide.contains_score(1.0), 99);
    }

    proptest! {
        #[test]
        fn score_is_bounded_and_symmetric(a in "[a-z ]{0,12}", b in "[a-z ]{0,12}") {
            let ab = score(&a, &b);
            prop_assert!(ab <= 100);
            prop_assert_eq!(ab, score(&b, &a));
        }

        #[test]
        fn normalize_output_is_trimmed_lowercase(name in "[A-Za-z0-9_. -]{0,24}") {
            let clean = normalize(&name);
            prop_assert_eq!(clean.trim(), clean.as_str());
            prop_assert_eq!(clean.to_lowercase(), clean.clone());
        }

        #[test]
        fn sku_in_clean_name_always_matches_exact(
            sku in "[A-Z]{1,3}[0-9]{1,3}",
            other in "[A-Z][a-z]{2,8}",
        ) {
            let feed = vec![row("ZZ99", "Cosa Distinta", 1), row(&sku, &other, 100)];
            let matches = MatchingEngine::default()
                .match_images(&[img(&format!("{sku}_foto.jpg"))], &feed);
            prop_assert_eq!(matches[0].match_type, MatchType::Exact);
            prop_assert_eq!(matches[0].match_score, 100);
        }

        #[test]
        fn none_iff_no_record(names in proptest::collection::vec("[a-z_]{1,10}\\.jpg", 1..6)) {
            let feed = vec![row("Q1", "mesa", 1), row("Q2", "silla plegable", 2)];
            let images: Vec<_> = names.iter().map(|n| img(n)).collect();
            for m in MatchingEngine::default().match_images(&images, &feed) {
                prop_assert!(m.match_score <= 100);
                prop_assert_eq!(m.match_type == MatchType::None, m.feed_record.is_none());
            }
        }
    }
}
