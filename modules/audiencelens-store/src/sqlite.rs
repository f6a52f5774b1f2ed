// Embedded SQLite backend for local runs. Payloads are JSON text; timestamps
// are unix milliseconds.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use audiencelens_common::{Confidence, EntityId, PlatformId, SubjectKey};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::backend::CacheBackend;
use crate::entry::{tokens_from_db, tokens_to_db, CacheEntry, QueryCacheEntry};
use crate::error::{CacheError, Result};

/// How long a writer waits on another connection's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteCacheBackend {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct DemographicsRow {
    entity_id: i64,
    platform: String,
    payload: String,
    data_confidence: String,
    source_tag: String,
    fetched_at_ms: i64,
}

impl TryFrom<DemographicsRow> for CacheEntry {
    type Error = CacheError;

    fn try_from(row: DemographicsRow) -> Result<Self> {
        Ok(CacheEntry {
            key: SubjectKey::new(EntityId::new(row.entity_id)?, PlatformId::new(&row.platform)?),
            payload: serde_json::from_str(&row.payload)?,
            confidence: Confidence::parse(&row.data_confidence),
            source_tag: row.source_tag,
            fetched_at: from_millis(row.fetched_at_ms)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct QueryRow {
    entity_id: i64,
    platform: String,
    fingerprint: String,
    query_text: String,
    job_handle: String,
    raw_text: String,
    result_json: Option<String>,
    input_tokens: i64,
    output_tokens: i64,
    total_tokens: i64,
    completed_at_ms: i64,
}

impl TryFrom<QueryRow> for QueryCacheEntry {
    type Error = CacheError;

    fn try_from(row: QueryRow) -> Result<Self> {
        let result_json = row
            .result_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(QueryCacheEntry {
            key: SubjectKey::new(EntityId::new(row.entity_id)?, PlatformId::new(&row.platform)?),
            fingerprint: row.fingerprint,
            query_text: row.query_text,
            job_handle: row.job_handle,
            raw_text: row.raw_text,
            result_json,
            input_tokens: tokens_from_db(row.input_tokens),
            output_tokens: tokens_from_db(row.output_tokens),
            total_tokens: tokens_from_db(row.total_tokens),
            completed_at: from_millis(row.completed_at_ms)?,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| CacheError::Invalid(format!("timestamp out of range: {ms}")))
}

impl SqliteCacheBackend {
    /// Open (creating if needed) the database file at `path` and migrate it.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| CacheError::Invalid(format!("cannot create {}: {e}", dir.display())))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Private in-memory database. One connection, so every query sees the same data.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations/sqlite").run(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl CacheBackend for SqliteCacheBackend {
    async fn load_demographics(&self, key: &SubjectKey) -> Result<Option<CacheEntry>> {
        let row = sqlx::query_as::<_, DemographicsRow>(
            "SELECT entity_id, platform, payload, data_confidence, source_tag, fetched_at_ms
             FROM audience_demographics
             WHERE entity_id = ?1 AND platform = ?2",
        )
        .bind(key.entity.get())
        .bind(key.platform.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(CacheEntry::try_from).transpose()
    }

    async fn upsert_demographics(&self, entry: &CacheEntry) -> Result<()> {
        let payload = serde_json::to_string(&entry.payload)?;
        sqlx::query(
            "INSERT INTO audience_demographics
                (entity_id, platform, payload, data_confidence, source_tag, fetched_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (entity_id, platform)
             DO UPDATE SET payload = excluded.payload,
                           data_confidence = excluded.data_confidence,
                           source_tag = excluded.source_tag,
                           fetched_at_ms = excluded.fetched_at_ms",
        )
        .bind(entry.key.entity.get())
        .bind(entry.key.platform.as_str())
        .bind(payload)
        .bind(entry.confidence.as_str())
        .bind(&entry.source_tag)
        .bind(entry.fetched_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_query(
        &self,
        key: &SubjectKey,
        fingerprint: &str,
    ) -> Result<Option<QueryCacheEntry>> {
        let row = sqlx::query_as::<_, QueryRow>(
            "SELECT entity_id, platform, fingerprint, query_text, job_handle, raw_text,
                    result_json, input_tokens, output_tokens, total_tokens, completed_at_ms
             FROM research_query_cache
             WHERE entity_id = ?1 AND platform = ?2 AND fingerprint = ?3",
        )
        .bind(key.entity.get())
        .bind(key.platform.as_str())
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        row.map(QueryCacheEntry::try_from).transpose()
    }

    async fn upsert_query(&self, entry: &QueryCacheEntry) -> Result<()> {
        let result_json = entry
            .result_json
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO research_query_cache
                (entity_id, platform, fingerprint, query_text, job_handle, raw_text,
                 result_json, input_tokens, output_tokens, total_tokens, completed_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT (entity_id, platform, fingerprint)
             DO UPDATE SET query_text = excluded.query_text,
                           job_handle = excluded.job_handle,
                           raw_text = excluded.raw_text,
                           result_json = excluded.result_json,
                           input_tokens = excluded.input_tokens,
                           output_tokens = excluded.output_tokens,
                           total_tokens = excluded.total_tokens,
                           completed_at_ms = excluded.completed_at_ms",
        )
        .bind(entry.key.entity.get())
        .bind(entry.key.platform.as_str())
        .bind(&entry.fingerprint)
        .bind(&entry.query_text)
        .bind(&entry.job_handle)
        .bind(&entry.raw_text)
        .bind(result_json)
        .bind(tokens_to_db(entry.input_tokens))
        .bind(tokens_to_db(entry.output_tokens))
        .bind(tokens_to_db(entry.total_tokens))
        .bind(entry.completed_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff_ms = cutoff.timestamp_millis();
        let demographics =
            sqlx::query("DELETE FROM audience_demographics WHERE fetched_at_ms <= ?1")
                .bind(cutoff_ms)
                .execute(&self.pool)
                .await?;
        let queries = sqlx::query("DELETE FROM research_query_cache WHERE completed_at_ms <= ?1")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;
        Ok(demographics.rows_affected() + queries.rows_affected())
    }
}
