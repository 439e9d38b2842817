//! Object storage for product images and the catalog repository the intake run writes to.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use intake_core::{AssetSource, CatalogRecord};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "intake-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object already exists at {0}")]
    Collision(String),
    #[error("sku {sku} already exists for owner {owner_id}")]
    Conflict { owner_id: String, sku: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn path_safe(input: &str) -> String {
    let cleaned = input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect::<String>();
    let cleaned = cleaned.trim_matches('-');
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Storage key for one uploaded image.
///
/// `{owner}/{yyyymmddHHMMSSmmm}-{hash12}-{file}`: the timestamp prefix keeps a re-run from landing on
/// a path an earlier run already wrote, and the content hash separates same-millisecond uploads.
pub fn upload_path(now: DateTime<Utc>, owner_id: &str, file_name: &str, bytes: &[u8]) -> String {
    let stamp = now.format("%Y%m%d%H%M%S%3f");
    let hash = sha256_hex(bytes);
    format!(
        "{}/{stamp}-{}-{}",
        path_safe(owner_id),
        &hash[..12],
        path_safe(file_name)
    )
}

pub fn content_type_for(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "avif" => "image/avif",
        _ => "application/octet-stream",
    }
}

pub async fn read_asset(source: &AssetSource) -> Result<Vec<u8>, StorageError> {
    match source {
        AssetSource::Inline(bytes) => Ok(bytes.to_vec()),
        AssetSource::File(path) => Ok(fs::read(path)
            .await
            .with_context(|| format!("reading image {}", path.display()))?),
    }
}

/// Destination for uploaded image bytes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Cheap reachability check done once before the first upload of a run.
    async fn ensure_ready(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Writes `bytes` at `path` and returns the public URL. Never overwrites an existing object.
    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<String, StorageError>;
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
    public_base_url: String,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn ensure_ready(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating object root {}", self.root.display()))?;
        Ok(())
    }

    /// Temp file + hard link, so the object appears whole or not at all and an existing path is
    /// reported as a collision instead of being replaced.
    async fn put(&self, path: &str, bytes: &[u8], _content_type: &str) -> Result<String, StorageError> {
        let absolute_path = self.root.join(path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating object directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp object file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp object file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp object file {}", temp_path.display()))?;
        drop(file);

        let linked = fs::hard_link(&temp_path, &absolute_path).await;
        let _ = fs::remove_file(&temp_path).await;
        match linked {
            Ok(()) => Ok(join_url(&self.public_base_url, path)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StorageError::Collision(path.to_string()))
            }
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("publishing object {}", absolute_path.display()))
                .into()),
        }
    }
}

/// In-process object store for dry runs.
#[derive(Debug)]
pub struct MemoryObjectStore {
    public_base_url: String,
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new(public_base_url: impl Into<String>) -> Self {
        Self {
            public_base_url: public_base_url.into(),
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }

    pub async fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().await.get(path).cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, path: &str, bytes: &[u8], _content_type: &str) -> Result<String, StorageError> {
        let mut objects = self.objects.lock().await;
        if objects.contains_key(path) {
            return Err(StorageError::Collision(path.to_string()));
        }
        objects.insert(path.to_string(), bytes.to_vec());
        Ok(join_url(&self.public_base_url, path))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    /// Base URL objects are PUT under.
    pub endpoint: String,
    /// Base URL handed back to callers; defaults to `endpoint`.
    pub public_base_url: Option<String>,
    pub bearer_token: Option<String>,
    pub timeout: Duration,
    pub max_in_flight: usize,
    pub backoff: BackoffPolicy,
}

impl HttpStoreConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            public_base_url: None,
            bearer_token: None,
            timeout: Duration::from_secs(20),
            max_in_flight: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Object store reached over plain HTTP PUT (S3-style presigned buckets, storage gateways).
#[derive(Debug)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: String,
    public_base_url: String,
    bearer_token: Option<String>,
    in_flight: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpObjectStore {
    pub fn new(config: HttpStoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            public_base_url: config
                .public_base_url
                .unwrap_or_else(|| config.endpoint.clone()),
            endpoint: config.endpoint,
            bearer_token: config.bearer_token,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            backoff: config.backoff,
        })
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    /// Any HTTP answer counts as reachable; only transport failures are fatal here.
    async fn ensure_ready(&self) -> Result<(), StorageError> {
        self.request(reqwest::Method::HEAD, &self.endpoint)
            .send()
            .await?;
        Ok(())
    }

    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<String, StorageError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .context("upload semaphore closed")?;
        let url = join_url(&self.endpoint, path);
        let span = info_span!("object_put", path, bytes = bytes.len());

        async {
            let mut last_request_error: Option<reqwest::Error> = None;

            for attempt in 0..=self.backoff.max_retries {
                let resp = self
                    .request(reqwest::Method::PUT, &url)
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .header(reqwest::header::IF_NONE_MATCH, "*")
                    .body(bytes.to_vec())
                    .send()
                    .await;

                match resp {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            return Ok(join_url(&self.public_base_url, path));
                        }
                        if status == StatusCode::PRECONDITION_FAILED {
                            return Err(StorageError::Collision(path.to_string()));
                        }
                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(%status, attempt, "retrying object upload");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(StorageError::HttpStatus {
                            status: status.as_u16(),
                            url: url.clone(),
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(error = %err, attempt, "retrying object upload");
                            last_request_error = Some(err);
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(StorageError::Request(err));
                    }
                }
            }

            match last_request_error {
                Some(err) => Err(StorageError::Request(err)),
                None => Err(anyhow::anyhow!("upload retry loop exhausted for {url}").into()),
            }
        }
        .instrument(span)
        .await
    }
}

/// A SKU already present in an owner's catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingSku {
    pub sku: String,
    pub product_id: String,
}

/// Narrow persistence seam for catalog products.
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    /// Returns the subset of `skus` already stored for `owner_id`.
    async fn find_skus_by_owner(
        &self,
        owner_id: &str,
        skus: &[String],
    ) -> Result<Vec<ExistingSku>, StorageError>;

    /// Inserts all `records` or none of them.
    async fn insert_many(&self, owner_id: &str, records: &[CatalogRecord]) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
pub struct PgCatalogRepository {
    pool: PgPool,
}

impl PgCatalogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS catalog_products (
                id                    UUID PRIMARY KEY,
                owner_id              TEXT NOT NULL,
                sku                   TEXT NOT NULL,
                name                  TEXT NOT NULL,
                price_cents           BIGINT NOT NULL,
                wholesale_price_cents BIGINT,
                description           TEXT,
                category              TEXT,
                image_url             TEXT NOT NULL,
                gallery_urls          JSONB NOT NULL DEFAULT '[]'::jsonb,
                created_at            TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (owner_id, sku)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogRepository for PgCatalogRepository {
    async fn find_skus_by_owner(
        &self,
        owner_id: &str,
        skus: &[String],
    ) -> Result<Vec<ExistingSku>, StorageError> {
        if skus.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT sku, id::text AS product_id
              FROM catalog_products
             WHERE owner_id = $1
               AND sku = ANY($2)
             ORDER BY sku
            "#,
        )
        .bind(owner_id)
        .bind(skus)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ExistingSku {
                sku: row.try_get("sku")?,
                product_id: row.try_get("product_id")?,
            });
        }
        Ok(out)
    }

    async fn insert_many(&self, owner_id: &str, records: &[CatalogRecord]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO catalog_products \
             (id, owner_id, sku, name, price_cents, wholesale_price_cents, description, category, image_url, gallery_urls) ",
        );
        builder.push_values(records, |mut row, record| {
            row.push_bind(Uuid::new_v4())
                .push_bind(owner_id.to_string())
                .push_bind(record.sku.clone())
                .push_bind(record.name.clone())
                .push_bind(record.price_cents)
                .push_bind(record.wholesale_price_cents)
                .push_bind(record.description.clone())
                .push_bind(record.category.clone())
                .push_bind(record.image_url.clone())
                .push_bind(serde_json::json!(record.gallery_urls));
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredProduct {
    product_id: String,
    record: Option<CatalogRecord>,
}

/// In-process catalog used for dry runs; enforces the same `(owner, sku)` uniqueness as Postgres.
#[derive(Debug, Default)]
pub struct MemoryCatalogRepository {
    owners: Mutex<HashMap<String, BTreeMap<String, StoredProduct>>>,
}

impl MemoryCatalogRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds SKUs that already exist for `owner_id`.
    pub async fn seed(&self, owner_id: &str, existing: impl IntoIterator<Item = (String, String)>) {
        let mut owners = self.owners.lock().await;
        let catalog = owners.entry(owner_id.to_string()).or_default();
        for (sku, product_id) in existing {
            catalog.insert(
                sku,
                StoredProduct {
                    product_id,
                    record: None,
                },
            );
        }
    }

    pub async fn records_for(&self, owner_id: &str) -> Vec<CatalogRecord> {
        self.owners
            .lock()
            .await
            .get(owner_id)
            .map(|catalog| catalog.values().filter_map(|p| p.record.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CatalogRepository for MemoryCatalogRepository {
    async fn find_skus_by_owner(
        &self,
        owner_id: &str,
        skus: &[String],
    ) -> Result<Vec<ExistingSku>, StorageError> {
        let owners = self.owners.lock().await;
        let Some(catalog) = owners.get(owner_id) else {
            return Ok(Vec::new());
        };
        let wanted: HashSet<&str> = skus.iter().map(String::as_str).collect();
        Ok(catalog
            .iter()
            .filter(|(sku, _)| wanted.contains(sku.as_str()))
            .map(|(sku, product)| ExistingSku {
                sku: sku.clone(),
                product_id: product.product_id.clone(),
            })
            .collect())
    }

    async fn insert_many(&self, owner_id: &str, records: &[CatalogRecord]) -> Result<(), StorageError> {
        let mut owners = self.owners.lock().await;
        let catalog = owners.entry(owner_id.to_string()).or_default();

        let mut batch_skus = HashSet::new();
        for record in records {
            if catalog.contains_key(&record.sku) || !batch_skus.insert(record.sku.as_str()) {
                return Err(StorageError::Conflict {
                    owner_id: owner_id.to_string(),
                    sku: record.sku.clone(),
                });
            }
        }
        for record in records {
            catalog.insert(
                record.sku.clone(),
                StoredProduct {
                    product_id: Uuid::new_v4().to_string(),
                    record: Some(record.clone()),
                },
            );
        }
        Ok(())
    }
}
