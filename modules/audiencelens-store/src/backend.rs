use async_trait::async_trait;
use audiencelens_common::SubjectKey;
use chrono::{DateTime, Utc};

use crate::entry::{CacheEntry, QueryCacheEntry};
use crate::error::Result;

/// Raw row access. Freshness and retry policy live above this, in `CacheStore`.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn load_demographics(&self, key: &SubjectKey) -> Result<Option<CacheEntry>>;

    /// Insert, or overwrite every column of the existing row.
    async fn upsert_demographics(&self, entry: &CacheEntry) -> Result<()>;

    async fn load_query(
        &self,
        key: &SubjectKey,
        fingerprint: &str,
    ) -> Result<Option<QueryCacheEntry>>;

    async fn upsert_query(&self, entry: &QueryCacheEntry) -> Result<()>;

    /// Delete rows of both tables timestamped at or before `cutoff`. Returns rows removed.
    async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
