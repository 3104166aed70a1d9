//! Durable checkpoint storage, paced HTTP fetching and the catalog database boundary.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use steamset_core::{CatalogEntry, CatalogId, FetchStatus, MaterializedField, SourceRow};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "steamset-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Audit fingerprint for a credential: enough to tell keys apart, useless to an attacker.
pub fn credential_fingerprint(secret: &str) -> String {
    let digest = sha256_hex(secret.as_bytes());
    format!("sha256:{}", &digest[..12])
}

#[derive(Debug, Clone)]
pub struct SavedCheckpoint {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
}

/// Single-document JSON store whose writes atomically replace the previous version.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> anyhow::Result<bool> {
        fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking checkpoint path {}", self.path.display()))
    }

    /// Serialize `document` and replace the stored copy via temp file + fsync + rename.
    /// Readers only ever observe the previous or the new complete document.
    pub async fn save<T: Serialize>(&self, document: &T) -> anyhow::Result<SavedCheckpoint> {
        let bytes = serde_json::to_vec_pretty(document).context("serializing checkpoint")?;
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating checkpoint directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await
                .with_context(|| format!("opening temp checkpoint file {}", temp_path.display()))?;
            file.write_all(&bytes)
                .await
                .with_context(|| format!("writing temp checkpoint file {}", temp_path.display()))?;
            file.flush()
                .await
                .with_context(|| format!("flushing temp checkpoint file {}", temp_path.display()))?;
            file.sync_all()
                .await
                .with_context(|| format!("syncing temp checkpoint file {}", temp_path.display()))?;
            anyhow::Ok(())
        }
        .await;
        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp checkpoint {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }

        let saved = SavedCheckpoint {
            content_hash: sha256_hex(&bytes),
            path: self.path.clone(),
            byte_size: bytes.len(),
        };
        debug!(
            path = %saved.path.display(),
            bytes = saved.byte_size,
            hash = %saved.content_hash,
            "checkpoint written"
        );
        Ok(saved)
    }

    pub async fn load<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", self.path.display()))
    }
}

/// Enforces a minimum delay between the *starts* of consecutive calls, whatever
/// their outcome. Holding the lock while sleeping serializes concurrent callers.
#[derive(Debug)]
pub struct Pacer {
    min_interval: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_start: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn wait_turn(&self) {
        let mut last = self.last_start.lock().await;
        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.min_interval).await;
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub min_interval: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            min_interval: Duration::from_millis(1500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Paced GET client covering the transport and HTTP-status validation layers.
/// It never retries; retry policy belongs to the caller.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacer: Pacer,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            pacer: Pacer::new(config.min_interval),
        })
    }

    pub fn min_interval(&self) -> Duration {
        self.pacer.min_interval()
    }

    pub async fn get(&self, url: &str) -> Result<FetchedResponse, TransportError> {
        self.pacer.wait_turn().await;

        let span = tracing::info_span!("http_fetch", url);
        async {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|source| TransportError::Network {
                    url: url.to_string(),
                    source,
                })?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(TransportError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(|source| TransportError::Network {
                    url: final_url.clone(),
                    source,
                })?
                .to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

/// Transactional store addressable by catalog identifier.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Upserts raw documents in one transaction. A stored success is never replaced.
    async fn upsert_entries(&self, entries: &[CatalogEntry]) -> anyhow::Result<usize>;

    async fn success_identifiers(&self) -> anyhow::Result<BTreeSet<CatalogId>>;

    /// Successful entries whose payload carries a non-null, non-empty `source_field`,
    /// with identifier strictly greater than `after`, ascending, at most `limit` rows.
    async fn source_page(
        &self,
        source_field: &str,
        after: Option<CatalogId>,
        limit: usize,
    ) -> anyhow::Result<Vec<SourceRow>>;

    /// Writes one batch of derived values in a single transaction.
    async fn write_materialized(&self, fields: &[MaterializedField]) -> anyhow::Result<usize>;

    async fn materialized_values(
        &self,
        identifiers: &[CatalogId],
    ) -> anyhow::Result<Vec<MaterializedField>>;
}

fn to_db_id(identifier: CatalogId) -> anyhow::Result<i64> {
    i64::try_from(identifier)
        .with_context(|| format!("identifier {identifier} exceeds BIGINT range"))
}

fn from_db_id(identifier: i64) -> anyhow::Result<CatalogId> {
    CatalogId::try_from(identifier)
        .with_context(|| format!("negative identifier {identifier} in store"))
}

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .context("connecting to catalog database")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running catalog migrations")?;
        info!("catalog migrations applied");
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn upsert_entries(&self, entries: &[CatalogEntry]) -> anyhow::Result<usize> {
        let mut tx = self.pool.begin().await.context("opening upsert transaction")?;
        let mut affected = 0usize;
        for entry in entries {
            let result = sqlx::query(
                r#"
                INSERT INTO catalog_entries (
                    identifier, display_name, raw_payload, entity_type,
                    fetch_status, fetched_at, error_kind, error_detail
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (identifier) DO UPDATE SET
                    display_name = EXCLUDED.display_name,
                    raw_payload = EXCLUDED.raw_payload,
                    entity_type = EXCLUDED.entity_type,
                    fetch_status = EXCLUDED.fetch_status,
                    fetched_at = EXCLUDED.fetched_at,
                    error_kind = EXCLUDED.error_kind,
                    error_detail = EXCLUDED.error_detail,
                    updated_at = NOW()
                WHERE catalog_entries.fetch_status <> 'success'
                "#,
            )
            .bind(to_db_id(entry.identifier)?)
            .bind(&entry.display_name)
            .bind(&entry.raw_payload)
            .bind(&entry.entity_type)
            .bind(entry.fetch_status.as_str())
            .bind(entry.fetched_at)
            .bind(entry.error.as_ref().map(|e| e.kind.to_string()))
            .bind(entry.error.as_ref().map(|e| e.detail.clone()))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("upserting catalog entry {}", entry.identifier))?;
            affected += result.rows_affected() as usize;
        }
        tx.commit().await.context("committing upsert transaction")?;
        Ok(affected)
    }

    async fn success_identifiers(&self) -> anyhow::Result<BTreeSet<CatalogId>> {
        let rows = sqlx::query(
            r#"
            SELECT identifier
              FROM catalog_entries
             WHERE fetch_status = 'success'
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("loading successful identifiers")?;

        rows.iter()
            .map(|row| from_db_id(row.try_get("identifier")?))
            .collect()
    }

    async fn source_page(
        &self,
        source_field: &str,
        after: Option<CatalogId>,
        limit: usize,
    ) -> anyhow::Result<Vec<SourceRow>> {
        let after = after.map(to_db_id).transpose()?.unwrap_or(-1);
        let rows = sqlx::query(
            r#"
            SELECT identifier, raw_payload -> $1::text AS source
              FROM catalog_entries
             WHERE fetch_status = 'success'
               AND identifier > $2
               AND raw_payload -> $1::text IS NOT NULL
               AND jsonb_typeof(raw_payload -> $1::text) <> 'null'
               AND raw_payload -> $1::text <> '{}'::jsonb
             ORDER BY identifier
             LIMIT $3
            "#,
        )
        .bind(source_field)
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("reading source page for {source_field}"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(SourceRow {
                identifier: from_db_id(row.try_get("identifier")?)?,
                source: row.try_get::<Option<JsonValue>, _>("source")?,
            });
        }
        Ok(out)
    }

    async fn write_materialized(&self, fields: &[MaterializedField]) -> anyhow::Result<usize> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("opening materialization transaction")?;
        for field in fields {
            sqlx::query(
                r#"
                INSERT INTO materialized_fields (
                    identifier, field_name, raw_source_path, value, parse_method, materialized_at
                )
                VALUES ($1, $2, $3, $4, $5, NOW())
                ON CONFLICT (identifier, field_name) DO UPDATE SET
                    raw_source_path = EXCLUDED.raw_source_path,
                    value = EXCLUDED.value,
                    parse_method = EXCLUDED.parse_method,
                    materialized_at = NOW()
                "#,
            )
            .bind(to_db_id(field.identifier)?)
            .bind(&field.field_name)
            .bind(&field.raw_source_path)
            .bind(&field.value)
            .bind(&field.parse_method)
            .execute(&mut *tx)
            .await
            .with_context(|| {
                format!(
                    "writing materialized field {} for {}",
                    field.field_name, field.identifier
                )
            })?;
        }
        tx.commit()
            .await
            .context("committing materialization transaction")?;
        Ok(fields.len())
    }

    async fn materialized_values(
        &self,
        identifiers: &[CatalogId],
    ) -> anyhow::Result<Vec<MaterializedField>> {
        let ids = identifiers
            .iter()
            .copied()
            .map(to_db_id)
            .collect::<anyhow::Result<Vec<_>>>()?;
        let rows = sqlx::query(
            r#"
            SELECT identifier, field_name, raw_source_path, value, parse_method
              FROM materialized_fields
             WHERE identifier = ANY($1)
             ORDER BY identifier, field_name
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .context("reading materialized fields")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(MaterializedField {
                identifier: from_db_id(row.try_get("identifier")?)?,
                field_name: row.try_get("field_name")?,
                raw_source_path: row.try_get("raw_source_path")?,
                value: row.try_get("value")?,
                parse_method: row.try_get("parse_method")?,
            });
        }
        Ok(out)
    }
}

/// Process-local store with the same semantics as the PostgreSQL backend.
#[derive(Debug, Default)]
pub struct InMemoryCatalogStore {
    entries: Mutex<BTreeMap<CatalogId, CatalogEntry>>,
    materialized: Mutex<BTreeMap<(CatalogId, String), MaterializedField>>,
    fail_writes: AtomicBool,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent materialized write fail, simulating a lost connection.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn entry(&self, identifier: CatalogId) -> Option<CatalogEntry> {
        self.entries.lock().await.get(&identifier).cloned()
    }

    /// Overwrites a stored value directly, bypassing the materializer.
    pub async fn tamper(&self, identifier: CatalogId, field_name: &str, value: Option<String>) {
        let mut materialized = self.materialized.lock().await;
        if let Some(field) = materialized.get_mut(&(identifier, field_name.to_string())) {
            field.value = value;
        }
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalogStore {
    async fn upsert_entries(&self, entries: &[CatalogEntry]) -> anyhow::Result<usize> {
        let mut stored = self.entries.lock().await;
        let mut affected = 0usize;
        for entry in entries {
            let keep_existing = stored
                .get(&entry.identifier)
                .map(|existing| existing.fetch_status == FetchStatus::Success)
                .unwrap_or(false);
            if !keep_existing {
                stored.insert(entry.identifier, entry.clone());
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn success_identifiers(&self) -> anyhow::Result<BTreeSet<CatalogId>> {
        Ok(self
            .entries
            .lock()
            .await
            .values()
            .filter(|e| e.is_success())
            .map(|e| e.identifier)
            .collect())
    }

    async fn source_page(
        &self,
        source_field: &str,
        after: Option<CatalogId>,
        limit: usize,
    ) -> anyhow::Result<Vec<SourceRow>> {
        let stored = self.entries.lock().await;
        let lower = match after {
            Some(id) => std::ops::Bound::Excluded(id),
            None => std::ops::Bound::Unbounded,
        };
        Ok(stored
            .range((lower, std::ops::Bound::Unbounded))
            .map(|(_, entry)| entry)
            .filter(|entry| entry.is_success())
            .filter_map(|entry| {
                let source = entry.raw_payload.as_ref()?.get(source_field)?;
                let empty_object = source.as_object().map(|o| o.is_empty()).unwrap_or(false);
                if source.is_null() || empty_object {
                    return None;
                }
                Some(SourceRow {
                    identifier: entry.identifier,
                    source: Some(source.clone()),
                })
            })
            .take(limit)
            .collect())
    }

    async fn write_materialized(&self, fields: &[MaterializedField]) -> anyhow::Result<usize> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("materialized write rejected: store unavailable"));
        }
        let mut materialized = self.materialized.lock().await;
        for field in fields {
            materialized.insert((field.identifier, field.field_name.clone()), field.clone());
        }
        Ok(fields.len())
    }

    async fn materialized_values(
        &self,
        identifiers: &[CatalogId],
    ) -> anyhow::Result<Vec<MaterializedField>> {
        let wanted = identifiers.iter().copied().collect::<BTreeSet<_>>();
        Ok(self
            .materialized
            .lock()
            .await
            .values()
            .filter(|f| wanted.contains(&f.identifier))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn credential_fingerprint_never_contains_the_secret() {
        let secret = "ABCDEF0123456789ABCDEF0123456789";
        let fp = credential_fingerprint(secret);
        assert!(fp.starts_with("sha256:"));
        assert_eq!(fp.len(), "sha256:".len() + 12);
        assert!(!fp.contains("ABCDEF01"));
        assert_eq!(fp, credential_fingerprint(secret));
    }

    #[tokio::test]
    async fn checkpoint_save_replaces_previous_document() {
        let dir = tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path().join("runs").join("sample.json"));
        assert!(!store.exists().await.unwrap());

        let first = store.save(&json!({"entries": [1]})).await.expect("first save");
        let second = store.save(&json!({"entries": [1, 2]})).await.expect("second save");
        assert_ne!(first.content_hash, second.content_hash);

        let loaded: JsonValue = store.load().await.expect("load");
        assert_eq!(loaded, json!({"entries": [1, 2]}));

        let leftovers = std::fs::read_dir(dir.path().join("runs"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn checkpoint_save_fails_when_parent_is_a_file() {
        let dir = tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let store = CheckpointStore::new(blocker.join("run.json"));
        assert!(store.save(&json!({"a": 1})).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_spaces_call_starts_by_the_minimum_interval() {
        let delay = Duration::from_millis(1500);
        let pacer = Pacer::new(delay);
        let started = Instant::now();
        let calls = 5u32;
        for _ in 0..calls {
            pacer.wait_turn().await;
        }
        assert!(started.elapsed() >= delay * (calls - 1));
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_does_not_sleep_when_the_caller_was_already_slow() {
        let pacer = Pacer::new(Duration::from_secs(1));
        pacer.wait_turn().await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        let before = Instant::now();
        pacer.wait_turn().await;
        assert!(before.elapsed() < Duration::from_millis(10));
    }

    fn entry(
        identifier: CatalogId,
        status: FetchStatus,
        payload: Option<JsonValue>,
    ) -> CatalogEntry {
        CatalogEntry {
            identifier,
            display_name: format!("App {identifier}"),
            raw_payload: payload,
            entity_type: Some("game".into()),
            fetch_status: status,
            fetched_at: DateTime::parse_from_rfc3339("2025-09-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            error: None,
        }
    }

    #[tokio::test]
    async fn in_memory_upsert_never_downgrades_a_success() {
        let store = InMemoryCatalogStore::new();
        store
            .upsert_entries(&[entry(1, FetchStatus::Success, Some(json!({"name": "a"})))])
            .await
            .unwrap();
        let affected = store
            .upsert_entries(&[
                entry(1, FetchStatus::Failed, None),
                entry(2, FetchStatus::Failed, None),
            ])
            .await
            .unwrap();
        assert_eq!(affected, 1);
        assert!(store.entry(1).await.unwrap().is_success());
        assert_eq!(store.success_identifiers().await.unwrap(), BTreeSet::from([1]));
    }

    #[tokio::test]
    async fn in_memory_source_page_is_keyset_paginated() {
        let store = InMemoryCatalogStore::new();
        let rows = (1..=5)
            .map(|id| {
                entry(
                    id,
                    FetchStatus::Success,
                    Some(json!({"pc_requirements": {"minimum": format!("<li>{id}</li>")}})),
                )
            })
            .chain([
                entry(6, FetchStatus::Success, Some(json!({"pc_requirements": {}}))),
                entry(7, FetchStatus::Success, Some(json!({"pc_requirements": null}))),
                entry(8, FetchStatus::Failed, None),
                entry(9, FetchStatus::Success, Some(json!({"pc_requirements": []}))),
            ])
            .collect::<Vec<_>>();
        store.upsert_entries(&rows).await.unwrap();

        let first = store.source_page("pc_requirements", None, 2).await.unwrap();
        assert_eq!(first.iter().map(|r| r.identifier).collect::<Vec<_>>(), vec![1, 2]);
        let rest = store.source_page("pc_requirements", Some(2), 10).await.unwrap();
        assert_eq!(rest.iter().map(|r| r.identifier).collect::<Vec<_>>(), vec![3, 4, 5, 9]);
    }
}
