// In-memory doubles for the cache store. No database, no network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use audiencelens_common::SubjectKey;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::backend::CacheBackend;
use crate::connection::Link;
use crate::entry::{CacheEntry, QueryCacheEntry};
use crate::error::{CacheError, ConnectionError, Result};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Decrement a failure budget; true if one was left.
fn take_one(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Cache backend over two hash maps, with injectable failures.
#[derive(Default)]
pub struct MemoryBackend {
    demographics: Mutex<HashMap<SubjectKey, CacheEntry>>,
    queries: Mutex<HashMap<(SubjectKey, String), QueryCacheEntry>>,
    transient_failures: AtomicU32,
    demographic_write_failures: AtomicU32,
    reject_writes: AtomicBool,
    calls: AtomicU32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls fail with a transient error.
    pub fn fail_next(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Inject more transient failures into a shared backend.
    pub fn inject_failures(&self, n: u32) {
        self.transient_failures.fetch_add(n, Ordering::SeqCst);
    }

    /// The next `n` demographics writes fail with a transient error. Other calls succeed.
    pub fn fail_demographic_writes(self, n: u32) -> Self {
        self.demographic_write_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Every write fails as invalid data.
    pub fn reject_writes(self) -> Self {
        self.reject_writes.store(true, Ordering::SeqCst);
        self
    }

    /// Backend calls made so far, failed ones included.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn demographics_len(&self) -> usize {
        lock(&self.demographics).len()
    }

    pub fn query_len(&self) -> usize {
        lock(&self.queries).len()
    }

    /// Raw row, ignoring freshness.
    pub fn demographics_row(&self, key: &SubjectKey) -> Option<CacheEntry> {
        lock(&self.demographics).get(key).cloned()
    }

    /// Every raw query row, ignoring freshness.
    pub fn query_rows(&self) -> Vec<QueryCacheEntry> {
        lock(&self.queries).values().cloned().collect()
    }

    fn enter(&self, write: bool) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.transient_failures) {
            return Err(CacheError::Transient("memory: injected connection drop".into()));
        }
        if write && self.reject_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Invalid("memory: write rejected".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn load_demographics(&self, key: &SubjectKey) -> Result<Option<CacheEntry>> {
        self.enter(false)?;
        Ok(lock(&self.demographics).get(key).cloned())
    }

    async fn upsert_demographics(&self, entry: &CacheEntry) -> Result<()> {
        self.enter(true)?;
        if take_one(&self.demographic_write_failures) {
            return Err(CacheError::Transient("memory: injected write drop".into()));
        }
        lock(&self.demographics).insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn load_query(
        &self,
        key: &SubjectKey,
        fingerprint: &str,
    ) -> Result<Option<QueryCacheEntry>> {
        self.enter(false)?;
        Ok(lock(&self.queries)
            .get(&(key.clone(), fingerprint.to_string()))
            .cloned())
    }

    async fn upsert_query(&self, entry: &QueryCacheEntry) -> Result<()> {
        self.enter(true)?;
        lock(&self.queries).insert(
            (entry.key.clone(), entry.fingerprint.clone()),
            entry.clone(),
        );
        Ok(())
    }

    async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.enter(true)?;
        let mut removed = 0;
        {
            let mut rows = lock(&self.demographics);
            let before = rows.len();
            rows.retain(|_, e| e.fetched_at > cutoff);
            removed += before - rows.len();
        }
        {
            let mut rows = lock(&self.queries);
            let before = rows.len();
            rows.retain(|_, e| e.completed_at > cutoff);
            removed += before - rows.len();
        }
        Ok(removed as u64)
    }
}

/// Connection probe that answers from a script, then stays alive.
#[derive(Default)]
pub struct ScriptedLink {
    probes: Mutex<VecDeque<bool>>,
    dead: bool,
    reopen_failures: AtomicU32,
    pings: AtomicU32,
    reopens: Mutex<Vec<Instant>>,
}

impl ScriptedLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe outcomes in order. Once exhausted, probes succeed.
    pub fn probes(self, script: impl IntoIterator<Item = bool>) -> Self {
        lock(&self.probes).extend(script);
        self
    }

    /// Every probe fails.
    pub fn always_dead(mut self) -> Self {
        self.dead = true;
        self
    }

    /// The next `n` reopens fail.
    pub fn fail_reopens(self, n: u32) -> Self {
        self.reopen_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn pings(&self) -> u32 {
        self.pings.load(Ordering::SeqCst)
    }

    /// When each reopen was attempted, failed ones included.
    pub fn reopen_times(&self) -> Vec<Instant> {
        lock(&self.reopens).clone()
    }
}

#[async_trait]
impl Link for ScriptedLink {
    async fn ping(&self) -> std::result::Result<(), ConnectionError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let alive = !self.dead && lock(&self.probes).pop_front().unwrap_or(true);
        if alive {
            Ok(())
        } else {
            Err(ConnectionError::Unavailable("scripted: probe failed".into()))
        }
    }

    async fn reopen(&self) -> std::result::Result<(), ConnectionError> {
        lock(&self.reopens).push(Instant::now());
        if take_one(&self.reopen_failures) {
            Err(ConnectionError::Unavailable("scripted: reopen refused".into()))
        } else {
            Ok(())
        }
    }
}
