//! Feed-row validation, feed file loading, and image collection for intake runs.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use intake_core::{AssetSource, FeedRecord, ImageAsset};
use intake_match::prepare_asset;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const CRATE_NAME: &str = "intake-feed";

pub const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "webp", "gif", "avif"];

/// A price cell as the feed parser hands it over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeedValue {
    Number(f64),
    Text(String),
}

/// One unvalidated feed row. Everything is optional until [`validate_feed`] has looked at it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFeedRow {
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub price: Option<FeedValue>,
    #[serde(default)]
    pub wholesale_price: Option<FeedValue>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum ValidationError {
    #[error("missing sku")]
    MissingSku,
    #[error("missing product name")]
    MissingName,
    #[error("missing price")]
    MissingPrice,
    #[error("invalid price {0:?}")]
    InvalidPrice(String),
    #[error("invalid wholesale price {0:?}")]
    InvalidWholesalePrice(String),
    #[error("sku already used by row {first_row}")]
    DuplicateSku { first_row: usize },
}

/// A feed row kept out of the match set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowRejection {
    pub row: usize,
    pub sku: Option<String>,
    pub reason: ValidationError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatedFeed {
    pub records: Vec<FeedRecord>,
    pub rejections: Vec<RowRejection>,
}

impl From<FeedRecord> for RawFeedRow {
    fn from(record: FeedRecord) -> Self {
        let cents = |c: i64| FeedValue::Number(c as f64 / 100.0);
        Self {
            sku: Some(record.sku),
            name: Some(record.name),
            price: Some(cents(record.price_cents)),
            wholesale_price: record.wholesale_price_cents.map(cents),
            description: record.description,
            category: record.category,
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Converts a price cell to integer cents.
///
/// Accepts numbers and decimal strings with either `.` or `,` as decimal separator
/// (`"1.234,50"`, `"1,234.50"`, `"$ 12.5"`). Negative and non-finite values are rejected.
pub fn parse_price_cents(value: &FeedValue) -> Option<i64> {
    let amount = match value {
        FeedValue::Number(n) => *n,
        FeedValue::Text(text) => parse_decimal_text(text)?,
    };
    if !amount.is_finite() || amount < 0.0 {
        return None;
    }
    Some((amount * 100.0).round() as i64)
}

fn parse_decimal_text(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let last_dot = cleaned.rfind('.');
    let last_comma = cleaned.rfind(',');
    let normalized = match (last_dot, last_comma) {
        (Some(dot), Some(comma)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (None, Some(comma)) => {
            let decimals = cleaned.len() - comma - 1;
            if cleaned.matches(',').count() == 1 && decimals <= 2 {
                cleaned.replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        _ => cleaned,
    };
    normalized.parse().ok()
}

fn describe(value: &FeedValue) -> String {
    match value {
        FeedValue::Number(n) => n.to_string(),
        FeedValue::Text(t) => t.clone(),
    }
}

/// Splits parsed rows into committable records and rejections.
///
/// SKUs must be unique within the feed; later repeats of a SKU are rejected and the first
/// occurrence is kept. Row indices are 0-based positions in `rows`.
pub fn validate_feed(rows: Vec<RawFeedRow>) -> ValidatedFeed {
    let mut out = ValidatedFeed::default();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for (row, raw) in rows.into_iter().enumerate() {
        let sku = non_blank(raw.sku);
        match validate_row(row, sku.clone(), raw.name, raw.price, raw.wholesale_price, &seen) {
            Ok(mut record) => {
                seen.insert(record.sku.clone(), row);
                record.description = non_blank(raw.description);
                record.category = non_blank(raw.category);
                out.records.push(record);
            }
            Err(reason) => {
                debug!(row, sku = sku.as_deref().unwrap_or("-"), %reason, "feed row rejected");
                out.rejections.push(RowRejection { row, sku, reason });
            }
        }
    }

    if !out.rejections.is_empty() {
        warn!(
            accepted = out.records.len(),
            rejected = out.rejections.len(),
            "feed rows rejected before matching"
        );
    }
    out
}

fn validate_row(
    row: usize,
    sku: Option<String>,
    name: Option<String>,
    price: Option<FeedValue>,
    wholesale_price: Option<FeedValue>,
    seen: &HashMap<String, usize>,
) -> Result<FeedRecord, ValidationError> {
    let sku = sku.ok_or(ValidationError::MissingSku)?;
    if let Some(&first_row) = seen.get(&sku) {
        debug_assert!(first_row < row);
        return Err(ValidationError::DuplicateSku { first_row });
    }
    let name = non_blank(name).ok_or(ValidationError::MissingName)?;
    let price = price.ok_or(ValidationError::MissingPrice)?;
    let price_cents =
        parse_price_cents(&price).ok_or_else(|| ValidationError::InvalidPrice(describe(&price)))?;
    let wholesale_price_cents = match wholesale_price {
        None => None,
        Some(FeedValue::Text(t)) if t.trim().is_empty() => None,
        Some(value) => Some(
            parse_price_cents(&value)
                .ok_or_else(|| ValidationError::InvalidWholesalePrice(describe(&value)))?,
        ),
    };

    Ok(FeedRecord {
        sku,
        name,
        price_cents,
        wholesale_price_cents,
        description: None,
        category: None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Column {
    Sku,
    Name,
    Price,
    WholesalePrice,
    Description,
    Category,
}

fn column_for_header(header: &str) -> Option<Column> {
    let key = header
        .trim()
        .to_lowercase()
        .replace([' ', '-'], "_");
    let column = match key.as_str() {
        "sku" | "code" | "codigo" | "código" | "ref" | "reference" => Column::Sku,
        "name" | "title" | "product" | "producto" | "nombre" | "titulo" | "título" => Column::Name,
        "price" | "precio" | "precio_venta" | "retail_price" => Column::Price,
        "wholesale_price" | "wholesale" | "precio_mayorista" | "mayorista" => Column::WholesalePrice,
        "description" | "descripcion" | "descripción" => Column::Description,
        "category" | "categoria" | "categoría" => Column::Category,
        _ => return None,
    };
    Some(column)
}

fn row_from_cells(mut cells: HashMap<Column, FeedValue>) -> RawFeedRow {
    let mut text = |column| cells.remove(&column).map(|v| describe(&v));
    let sku = text(Column::Sku);
    let name = text(Column::Name);
    let description = text(Column::Description);
    let category = text(Column::Category);
    RawFeedRow {
        sku,
        name,
        description,
        category,
        price: cells.remove(&Column::Price),
        wholesale_price: cells.remove(&Column::WholesalePrice),
    }
}

fn json_cell(value: &JsonValue) -> Option<FeedValue> {
    match value {
        JsonValue::Null => None,
        JsonValue::Number(n) => n.as_f64().map(FeedValue::Number),
        JsonValue::String(s) => Some(FeedValue::Text(s.clone())),
        other => Some(FeedValue::Text(other.to_string())),
    }
}

pub fn parse_json_feed(data: &str) -> Result<Vec<RawFeedRow>> {
    let rows: Vec<serde_json::Map<String, JsonValue>> =
        serde_json::from_str(data).context("feed JSON must be an array of objects")?;
    Ok(rows
        .iter()
        .map(|obj| {
            let cells = obj
                .iter()
                .filter_map(|(key, value)| Some((column_for_header(key)?, json_cell(value)?)))
                .collect();
            row_from_cells(cells)
        })
        .collect())
}

pub fn parse_csv_feed(data: &str) -> Result<Vec<RawFeedRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(data.as_bytes());
    let columns: Vec<Option<Column>> = reader
        .headers()
        .context("reading feed CSV header")?
        .iter()
        .map(column_for_header)
        .collect();
    if !columns.contains(&Some(Column::Sku)) {
        bail!("feed CSV header has no sku column");
    }

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("reading feed CSV row {}", idx + 1))?;
        let cells = columns
            .iter()
            .zip(record.iter())
            .filter(|(_, cell)| !cell.is_empty())
            .filter_map(|(column, cell)| Some(((*column)?, FeedValue::Text(cell.to_string()))))
            .collect();
        rows.push(row_from_cells(cells));
    }
    Ok(rows)
}

/// Loads a feed export: `.json` (array of objects) or `.csv` (header row required).
pub fn load_feed_file(path: impl AsRef<Path>) -> Result<Vec<RawFeedRow>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "json" => parse_json_feed(&data).with_context(|| format!("parsing {}", path.display())),
        "csv" => parse_csv_feed(&data).with_context(|| format!("parsing {}", path.display())),
        other => bail!("unsupported feed format {other:?} for {}", path.display()),
    }
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Walks `dir` for image files, ordered by relative path.
pub fn collect_images(dir: impl AsRef<Path>) -> Result<Vec<ImageAsset>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        bail!("image directory {} does not exist", dir.display());
    }

    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.with_context(|| format!("walking {}", dir.display()))?;
        if entry.file_type().is_file() && is_image_file(entry.path()) {
            paths.push(entry.into_path());
        }
    }
    paths.sort();

    Ok(paths
        .into_iter()
        .map(|path| {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let preview_ref = path.display().to_string();
            prepare_asset(file_name, AssetSource::File(path), preview_ref)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn raw(sku: Option<&str>, name: Option<&str>, price: Option<FeedValue>) -> RawFeedRow {
        RawFeedRow {
            sku: sku.map(String::from),
            name: name.map(String::from),
            price,
            ..RawFeedRow::default()
        }
    }

    #[test]
    fn price_parsing_handles_both_decimal_conventions() {
        let text = |s: &str| FeedValue::Text(s.to_string());
        assert_eq!(parse_price_cents(&FeedValue::Number(12.5)), Some(1250));
        assert_eq!(parse_price_cents(&text("12,50")), Some(1250));
        assert_eq!(parse_price_cents(&text("$ 1,234.50")), Some(123450));
        assert_eq!(parse_price_cents(&text("1.234,50")), Some(123450));
        assert_eq!(parse_price_cents(&text("1,234")), Some(123400));
        assert_eq!(parse_price_cents(&text("gratis")), None);
        assert_eq!(parse_price_cents(&text("-3")), None);
    }

    #[test]
    fn validation_rejects_incomplete_and_repeated_rows() {
        let rows = vec![
            raw(Some("A1"), Some("Taza Roja"), Some(FeedValue::Number(1.0))),
            raw(None, Some("Sin codigo"), Some(FeedValue::Number(1.0))),
            raw(Some("C3"), Some("  "), Some(FeedValue::Number(1.0))),
            raw(Some("D4"), Some("Sin precio"), None),
            raw(Some("A1"), Some("Repetida"), Some(FeedValue::Number(2.0))),
            raw(Some("E5"), Some("Precio raro"), Some(FeedValue::Text("n/a".into()))),
        ];
        let feed = validate_feed(rows);

        assert_eq!(feed.records.len(), 1);
        assert_eq!(feed.records[0].sku, "A1");
        assert_eq!(feed.records[0].price_cents, 100);
        let reasons: Vec<_> = feed.rejections.iter().map(|r| (r.row, r.reason.clone())).collect();
        assert_eq!(
            reasons,
            vec![
                (1, ValidationError::MissingSku),
                (2, ValidationError::MissingName),
                (3, ValidationError::MissingPrice),
                (4, ValidationError::DuplicateSku { first_row: 0 }),
                (5, ValidationError::InvalidPrice("n/a".into())),
            ]
        );
    }

    #[test]
    fn optional_fields_are_trimmed_or_dropped() {
        let mut row = raw(Some(" B2 "), Some("Plato Azul"), Some(FeedValue::Text("50".into())));
        row.wholesale_price = Some(FeedValue::Text(" ".into()));
        row.description = Some("  ".into());
        row.category = Some(" Cocina ".into());
        let feed = validate_feed(vec![row]);
        let record = &feed.records[0];
        assert_eq!(record.sku, "B2");
        assert_eq!(record.wholesale_price_cents, None);
        assert_eq!(record.description, None);
        assert_eq!(record.category.as_deref(), Some("Cocina"));
    }

    #[test]
    fn feed_records_survive_revalidation() {
        let record = FeedRecord {
            sku: "B2".into(),
            name: "Plato Azul".into(),
            price_cents: 1999,
            wholesale_price_cents: Some(1250),
            description: None,
            category: Some("vajilla".into()),
        };
        let feed = validate_feed(vec![RawFeedRow::from(record.clone())]);
        assert!(feed.rejections.is_empty());
        assert_eq!(feed.records, vec![record]);
    }

    #[test]
    fn csv_headers_are_case_insensitive_with_aliases() {
        let data = "SKU,Nombre,Precio,Precio Mayorista,Categoria\nA1,Taza Roja,\"12,50\",9,Cocina\nB2,Plato Azul,50,,\n";
        let rows = parse_csv_feed(data).expect("csv");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].sku.as_deref(), Some("A1"));
        assert_eq!(rows[0].price, Some(FeedValue::Text("12,50".into())));
        assert_eq!(rows[0].wholesale_price, Some(FeedValue::Text("9".into())));
        assert_eq!(rows[1].wholesale_price, None);

        let feed = validate_feed(rows);
        assert_eq!(feed.records[0].price_cents, 1250);
        assert_eq!(feed.records[0].wholesale_price_cents, Some(900));
    }

    #[test]
    fn csv_without_sku_column_is_refused() {
        assert!(parse_csv_feed("name,price\nTaza,1\n").is_err());
    }

    #[test]
    fn json_feed_rows_map_known_keys() {
        let data = r#"[{"sku":"A1","name":"Taza Roja","price":100,"extra":true},{"codigo":7,"title":"Vaso"}]"#;
        let rows = parse_json_feed(data).expect("json");
        assert_eq!(rows[0].price, Some(FeedValue::Number(100.0)));
        assert_eq!(rows[1].sku.as_deref(), Some("7"));
        assert_eq!(rows[1].name.as_deref(), Some("Vaso"));
        assert_eq!(rows[1].price, None);
    }

    #[test]
    fn load_feed_file_dispatches_on_extension() {
        let dir = tempdir().expect("tempdir");
        let json = dir.path().join("feed.json");
        std::fs::write(&json, r#"[{"sku":"A1","name":"Taza","price":"1"}]"#).expect("write");
        assert_eq!(load_feed_file(&json).expect("load").len(), 1);

        let txt = dir.path().join("feed.txt");
        std::fs::write(&txt, "x").expect("write");
        assert!(load_feed_file(&txt).is_err());
    }

    #[test]
    fn collect_images_filters_and_orders() {
        let dir = tempdir().expect("tempdir");
        for name in ["platoazul-3.jpg", "A1_foto.JPG", "notes.txt", "platoazul-2.jpg"] {
            std::fs::write(dir.path().join(name), b"img").expect("write");
        }
        std::fs::create_dir(dir.path().join("nested")).expect("mkdir");
        std::fs::write(dir.path().join("nested/vaso.webp"), b"img").expect("write");

        let images = collect_images(dir.path()).expect("collect");
        let names: Vec<_> = images.iter().map(|i| i.file_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["A1_foto.JPG", "vaso.webp", "platoazul-2.jpg", "platoazul-3.jpg"]
        );
        assert_eq!(images[0].clean_name, "a1 foto");
        assert!(matches!(images[0].source, AssetSource::File(_)));
    }

    #[test]
    fn collect_images_requires_a_directory() {
        assert!(collect_images("/definitely/not/here").is_err());
    }
}
