use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use audiencelens_common::SubjectKey;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::backend::CacheBackend;
use crate::connection::{
    ConnectionManager, LocalConnection, PgLink, ResilientConnection, DEFAULT_MAX_RETRIES,
};
use crate::entry::{CacheEntry, EntryMeta, QueryCacheEntry};
use crate::error::{CacheError, Result};
use crate::postgres::PgCacheBackend;
use crate::sqlite::SqliteCacheBackend;

/// Default freshness window for demographics and raw query results.
pub const DEFAULT_TTL: Duration = Duration::from_secs(90 * 24 * 60 * 60);

const PG_MAX_CONNECTIONS: u32 = 5;

/// Run `op`, healing the connection between attempts on connectivity-class errors.
///
/// Non-transient errors propagate immediately. After `max_retries` retries the
/// last transient error propagates. The only backoff is the one inside
/// `ensure_connection`.
pub async fn execute_with_retry<T, F, Fut>(
    conn: &dyn ConnectionManager,
    max_retries: u32,
    label: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && retries < max_retries => {
                retries += 1;
                warn!(op = label, retry = retries, max_retries, error = %e, "Transient store error, healing connection");
                conn.ensure_connection(max_retries).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Keyed demographics cache with TTL-based freshness.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    connection: Arc<dyn ConnectionManager>,
    ttl: Duration,
    max_retries: u32,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, connection: Arc<dyn ConnectionManager>) -> Self {
        Self {
            backend,
            connection,
            ttl: DEFAULT_TTL,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Hosted Postgres behind a resilient connection. Runs migrations.
    pub async fn postgres(url: &str) -> Result<Self> {
        let link = PgLink::connect(url, PG_MAX_CONNECTIONS).await?;
        let conn = Arc::new(ResilientConnection::new(link));
        let backend = PgCacheBackend::new(conn.clone());
        backend.migrate().await?;
        info!("Connected to Postgres demographics cache");
        Ok(Self::new(Arc::new(backend), conn))
    }

    /// Embedded SQLite file. Runs migrations.
    pub async fn sqlite(path: &Path) -> Result<Self> {
        let backend = SqliteCacheBackend::open(path).await?;
        info!(path = %path.display(), "Opened SQLite demographics cache");
        Ok(Self::new(Arc::new(backend), Arc::new(LocalConnection)))
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn connection(&self) -> &Arc<dyn ConnectionManager> {
        &self.connection
    }

    fn ttl_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.ttl).unwrap_or(TimeDelta::MAX)
    }

    /// Younger than the TTL. An entry exactly TTL old is stale.
    fn is_fresh(&self, stamped_at: DateTime<Utc>) -> bool {
        Utc::now().signed_duration_since(stamped_at) < self.ttl_delta()
    }

    /// Fresh, non-empty demographics for `key`, if any.
    pub async fn get_demographics(&self, key: &SubjectKey) -> Result<Option<CacheEntry>> {
        let backend = self.backend.as_ref();
        let entry = execute_with_retry(
            self.connection.as_ref(),
            self.max_retries,
            "get_demographics",
            move || backend.load_demographics(key),
        )
        .await?;

        Ok(entry.filter(|e| {
            if e.is_empty() {
                debug!(subject = %key, "Cached demographics are empty");
                return false;
            }
            if !self.is_fresh(e.fetched_at) {
                debug!(subject = %key, fetched_at = %e.fetched_at, "Cached demographics are stale");
                return false;
            }
            true
        }))
    }

    /// Insert or wholly replace the demographics for `key`.
    pub async fn put_demographics(
        &self,
        key: &SubjectKey,
        payload: serde_json::Value,
        meta: EntryMeta,
    ) -> Result<()> {
        if !payload.is_object() {
            return Err(CacheError::Invalid(format!(
                "demographics payload for {key} must be a JSON object"
            )));
        }
        let entry = CacheEntry::new(key.clone(), payload, meta);
        let backend = self.backend.as_ref();
        let entry = &entry;
        execute_with_retry(
            self.connection.as_ref(),
            self.max_retries,
            "put_demographics",
            move || backend.upsert_demographics(entry),
        )
        .await?;
        debug!(subject = %key, confidence = entry.confidence.as_str(), "Cached demographics");
        Ok(())
    }

    /// Fresh raw result of the query with `fingerprint`, if any.
    pub async fn get_query_cache(
        &self,
        key: &SubjectKey,
        fingerprint: &str,
    ) -> Result<Option<QueryCacheEntry>> {
        let backend = self.backend.as_ref();
        let entry = execute_with_retry(
            self.connection.as_ref(),
            self.max_retries,
            "get_query_cache",
            move || backend.load_query(key, fingerprint),
        )
        .await?;

        Ok(entry.filter(|e| self.is_fresh(e.completed_at)))
    }

    pub async fn put_query_cache(&self, entry: &QueryCacheEntry) -> Result<()> {
        let backend = self.backend.as_ref();
        execute_with_retry(
            self.connection.as_ref(),
            self.max_retries,
            "put_query_cache",
            move || backend.upsert_query(entry),
        )
        .await
    }

    /// Delete every row at or past the TTL. Returns rows removed.
    pub async fn evict_expired(&self) -> Result<u64> {
        let cutoff = Utc::now()
            .checked_sub_signed(self.ttl_delta())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let backend = self.backend.as_ref();
        let removed = execute_with_retry(
            self.connection.as_ref(),
            self.max_retries,
            "evict_expired",
            move || backend.evict_older_than(cutoff),
        )
        .await?;
        info!(removed, "Evicted expired cache entries");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryBackend, ScriptedLink};
    use audiencelens_common::Confidence;
    use serde_json::json;

    fn key(entity: i64, platform: &str) -> SubjectKey {
        SubjectKey::parse(entity, platform).unwrap()
    }

    fn payload() -> serde_json::Value {
        json!({ "gender": { "female": 55.0, "male": 45.0 } })
    }

    fn meta_aged(age: TimeDelta) -> EntryMeta {
        EntryMeta::research(Confidence::High, Utc::now() - age)
    }

    fn memory_store() -> (Arc<MemoryBackend>, CacheStore) {
        let backend = Arc::new(MemoryBackend::new());
        let store = CacheStore::new(backend.clone(), Arc::new(LocalConnection));
        (backend, store)
    }

    #[tokio::test]
    async fn ttl_boundary() {
        let (_, store) = memory_store();
        let ttl = TimeDelta::days(90);

        store
            .put_demographics(&key(1, "a"), payload(), meta_aged(ttl + TimeDelta::seconds(1)))
            .await
            .unwrap();
        store
            .put_demographics(&key(2, "a"), payload(), meta_aged(ttl - TimeDelta::seconds(1)))
            .await
            .unwrap();

        assert!(store.get_demographics(&key(1, "a")).await.unwrap().is_none());
        assert!(store.get_demographics(&key(2, "a")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn empty_payload_reads_as_absent() {
        let (_, store) = memory_store();
        store
            .put_demographics(&key(1, "a"), json!({}), meta_aged(TimeDelta::zero()))
            .await
            .unwrap();
        assert!(store.get_demographics(&key(1, "a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_object_payload_is_invalid() {
        let (backend, store) = memory_store();
        let err = store
            .put_demographics(&key(1, "a"), json!([1, 2]), meta_aged(TimeDelta::zero()))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Invalid(_)));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn refresh_overwrites_wholesale() {
        let (_, store) = memory_store();
        let k = key(7, "a");
        store
            .put_demographics(&k, payload(), meta_aged(TimeDelta::days(10)))
            .await
            .unwrap();
        store
            .put_demographics(
                &k,
                json!({ "geography": [{ "country": "US", "percentage": 60.0 }] }),
                EntryMeta::research(Confidence::Low, Utc::now()),
            )
            .await
            .unwrap();

        let entry = store.get_demographics(&k).await.unwrap().unwrap();
        assert_eq!(entry.confidence, Confidence::Low);
        assert!(entry.payload.get("gender").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_heal_then_retry() {
        let backend = Arc::new(MemoryBackend::new().fail_next(2));
        let conn = Arc::new(ResilientConnection::new(
            ScriptedLink::new().probes([false, true, false, true]),
        ));
        let store = CacheStore::new(backend.clone(), conn.clone());

        store
            .put_demographics(&key(1, "a"), payload(), meta_aged(TimeDelta::zero()))
            .await
            .unwrap();

        assert_eq!(backend.demographics_len(), 1);
        // One failed attempt plus one retry each heal once.
        assert_eq!(conn.link().reopen_times().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn write_survives_two_dead_probes() {
        let backend = Arc::new(MemoryBackend::new().fail_next(1));
        let conn = Arc::new(ResilientConnection::new(
            ScriptedLink::new().probes([false, false, true]),
        ));
        let store = CacheStore::new(backend.clone(), conn.clone());
        let started = tokio::time::Instant::now();

        store
            .put_demographics(&key(42, "video-hosting"), payload(), meta_aged(TimeDelta::zero()))
            .await
            .unwrap();

        let offsets: Vec<u64> = conn
            .link()
            .reopen_times()
            .iter()
            .map(|at| at.duration_since(started).as_secs())
            .collect();
        assert_eq!(offsets, vec![1, 3]);
        assert_eq!(backend.demographics_len(), 1);
        assert_eq!(conn.health().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let backend = Arc::new(MemoryBackend::new().fail_next(10));
        let store = CacheStore::new(backend.clone(), Arc::new(LocalConnection));

        let err = store.get_demographics(&key(1, "a")).await.unwrap_err();

        assert!(err.is_transient());
        // First attempt plus three retries.
        assert_eq!(backend.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_store_surfaces_exhaustion() {
        let backend = Arc::new(MemoryBackend::new().fail_next(1));
        let conn = Arc::new(ResilientConnection::new(ScriptedLink::new().always_dead()));
        let store = CacheStore::new(backend.clone(), conn);

        let err = store.get_demographics(&key(1, "a")).await.unwrap_err();

        assert!(matches!(
            err,
            CacheError::Connection(crate::ConnectionError::Exhausted { .. })
        ));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn invalid_errors_are_not_retried() {
        let backend = Arc::new(MemoryBackend::new().reject_writes());
        let store = CacheStore::new(backend.clone(), Arc::new(LocalConnection));

        let err = store
            .put_demographics(&key(1, "a"), payload(), meta_aged(TimeDelta::zero()))
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::Invalid(_)));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn query_cache_follows_the_same_ttl() {
        let (_, store) = memory_store();
        let mut entry = QueryCacheEntry {
            key: key(1, "a"),
            fingerprint: "abc".into(),
            query_text: "q".into(),
            job_handle: "job-1".into(),
            raw_text: "{}".into(),
            result_json: Some(json!({})),
            input_tokens: 10,
            output_tokens: 20,
            total_tokens: 30,
            completed_at: Utc::now(),
        };
        store.put_query_cache(&entry).await.unwrap();
        assert_eq!(
            store.get_query_cache(&entry.key, "abc").await.unwrap(),
            Some(entry.clone())
        );
        assert!(store.get_query_cache(&entry.key, "other").await.unwrap().is_none());

        entry.completed_at = Utc::now() - TimeDelta::days(91);
        store.put_query_cache(&entry).await.unwrap();
        assert!(store.get_query_cache(&entry.key, "abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn evict_removes_only_expired_rows() {
        let (backend, store) = memory_store();
        store
            .put_demographics(&key(1, "a"), payload(), meta_aged(TimeDelta::days(100)))
            .await
            .unwrap();
        store
            .put_demographics(&key(2, "a"), payload(), meta_aged(TimeDelta::days(1)))
            .await
            .unwrap();

        assert_eq!(store.evict_expired().await.unwrap(), 1);
        assert_eq!(backend.demographics_len(), 1);
    }
}
