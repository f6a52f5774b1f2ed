// Postgres backend. Payloads are JSONB; the pool is borrowed from the
// resilient link on every query so a reopened pool is picked up immediately.

use std::sync::Arc;

use async_trait::async_trait;
use audiencelens_common::{Confidence, EntityId, PlatformId, SubjectKey};
use chrono::{DateTime, Utc};

use crate::backend::CacheBackend;
use crate::connection::{PgLink, ResilientConnection};
use crate::entry::{tokens_from_db, tokens_to_db, CacheEntry, QueryCacheEntry};
use crate::error::Result;

pub struct PgCacheBackend {
    conn: Arc<ResilientConnection<PgLink>>,
}

#[derive(sqlx::FromRow)]
struct DemographicsRow {
    entity_id: i64,
    platform: String,
    payload: serde_json::Value,
    data_confidence: String,
    source_tag: String,
    fetched_at: DateTime<Utc>,
}

impl TryFrom<DemographicsRow> for CacheEntry {
    type Error = crate::error::CacheError;

    fn try_from(row: DemographicsRow) -> Result<Self> {
        Ok(CacheEntry {
            key: SubjectKey::new(EntityId::new(row.entity_id)?, PlatformId::new(&row.platform)?),
            payload: row.payload,
            confidence: Confidence::parse(&row.data_confidence),
            source_tag: row.source_tag,
            fetched_at: row.fetched_at,
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
    result_json: Option<serde_json::Value>,
    input_tokens: i64,
    output_tokens: i64,
    total_tokens: i64,
    completed_at: DateTime<Utc>,
}

impl TryFrom<QueryRow> for QueryCacheEntry {
    type Error = crate::error::CacheError;

    fn try_from(row: QueryRow) -> Result<Self> {
        Ok(QueryCacheEntry {
            key: SubjectKey::new(EntityId::new(row.entity_id)?, PlatformId::new(&row.platform)?),
            fingerprint: row.fingerprint,
            query_text: row.query_text,
            job_handle: row.job_handle,
            raw_text: row.raw_text,
            result_json: row.result_json,
            input_tokens: tokens_from_db(row.input_tokens),
            output_tokens: tokens_from_db(row.output_tokens),
            total_tokens: tokens_from_db(row.total_tokens),
            completed_at: row.completed_at,
        })
    }
}

impl PgCacheBackend {
    pub fn new(conn: Arc<ResilientConnection<PgLink>>) -> Self {
        Self { conn }
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/postgres")
            .run(&self.conn.link().pool())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for PgCacheBackend {
    async fn load_demographics(&self, key: &SubjectKey) -> Result<Option<CacheEntry>> {
        let row = sqlx::query_as::<_, DemographicsRow>(
            "SELECT entity_id, platform, payload, data_confidence, source_tag, fetched_at
             FROM audience_demographics
             WHERE entity_id = $1 AND platform = $2",
        )
        .bind(key.entity.get())
        .bind(key.platform.as_str())
        .fetch_optional(&self.conn.link().pool())
        .await?;

        row.map(CacheEntry::try_from).transpose()
    }

    async fn upsert_demographics(&self, entry: &CacheEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO audience_demographics
                (entity_id, platform, payload, data_confidence, source_tag, fetched_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (entity_id, platform)
             DO UPDATE SET payload = EXCLUDED.payload,
                           data_confidence = EXCLUDED.data_confidence,
                           source_tag = EXCLUDED.source_tag,
                           fetched_at = EXCLUDED.fetched_at",
        )
        .bind(entry.key.entity.get())
        .bind(entry.key.platform.as_str())
        .bind(&entry.payload)
        .bind(entry.confidence.as_str())
        .bind(&entry.source_tag)
        .bind(entry.fetched_at)
        .execute(&self.conn.link().pool())
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
                    result_json, input_tokens, output_tokens, total_tokens, completed_at
             FROM research_query_cache
             WHERE entity_id = $1 AND platform = $2 AND fingerprint = $3",
        )
        .bind(key.entity.get())
        .bind(key.platform.as_str())
        .bind(fingerprint)
        .fetch_optional(&self.conn.link().pool())
        .await?;

        row.map(QueryCacheEntry::try_from).transpose()
    }

    async fn upsert_query(&self, entry: &QueryCacheEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO research_query_cache
                (entity_id, platform, fingerprint, query_text, job_handle, raw_text,
                 result_json, input_tokens, output_tokens, total_tokens, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (entity_id, platform, fingerprint)
             DO UPDATE SET query_text = EXCLUDED.query_text,
                           job_handle = EXCLUDED.job_handle,
                           raw_text = EXCLUDED.raw_text,
                           result_json = EXCLUDED.result_json,
                           input_tokens = EXCLUDED.input_tokens,
                           output_tokens = EXCLUDED.output_tokens,
                           total_tokens = EXCLUDED.total_tokens,
                           completed_at = EXCLUDED.completed_at",
        )
        .bind(entry.key.entity.get())
        .bind(entry.key.platform.as_str())
        .bind(&entry.fingerprint)
        .bind(&entry.query_text)
        .bind(&entry.job_handle)
        .bind(&entry.raw_text)
        .bind(&entry.result_json)
        .bind(tokens_to_db(entry.input_tokens))
        .bind(tokens_to_db(entry.output_tokens))
        .bind(tokens_to_db(entry.total_tokens))
        .bind(entry.completed_at)
        .execute(&self.conn.link().pool())
        .await?;
        Ok(())
    }

    async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let pool = self.conn.link().pool();
        let demographics = sqlx::query("DELETE FROM audience_demographics WHERE fetched_at <= $1")
            .bind(cutoff)
            .execute(&pool)
            .await?;
        let queries = sqlx::query("DELETE FROM research_query_cache WHERE completed_at <= $1")
            .bind(cutoff)
            .execute(&pool)
            .await?;
        Ok(demographics.rows_affected() + queries.rows_affected())
    }
}
