// Connection health for the cache store.
//
// Hosted Postgres drops idle sessions while a research job runs for half an
// hour. `ResilientConnection` probes, reopens and backs off; the store wraps
// every query so a dead session costs a reconnect instead of a failed write.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ConnectionError;

/// Reconnect attempts `ensure_connection` makes by default.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Point-in-time copy of the health state, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub last_verified_alive: Option<Instant>,
    pub consecutive_failures: u32,
}

#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Round-trip probe. Never errors; any failure is `false`.
    async fn is_alive(&self) -> bool;

    /// Close and reopen the underlying pool. Safe to call when already alive.
    async fn reconnect(&self) -> Result<(), ConnectionError>;

    /// Probe, and if dead, reconnect with exponential backoff up to `max_retries` times.
    async fn ensure_connection(&self, max_retries: u32) -> Result<(), ConnectionError>;

    /// `ensure_connection` only if nothing has verified the connection for longer than `interval`.
    async fn refresh_if_stale(&self, interval: Duration) -> Result<(), ConnectionError>;

    fn health(&self) -> HealthSnapshot;
}

/// The thing being kept alive: one probe, one reopen.
#[async_trait]
pub trait Link: Send + Sync {
    async fn ping(&self) -> Result<(), ConnectionError>;
    async fn reopen(&self) -> Result<(), ConnectionError>;
}

/// Generic resilient wrapper over a [`Link`].
///
/// Health checks are serialized by `check_lock`. A caller that queued behind
/// another check re-probes first, so a connection that was just healed is not
/// reopened a second time.
pub struct ResilientConnection<L> {
    link: L,
    health: Mutex<HealthSnapshot>,
    check_lock: tokio::sync::Mutex<()>,
    base_backoff: Duration,
    probe_timeout: Duration,
}

impl<L: Link> ResilientConnection<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            health: Mutex::new(HealthSnapshot::default()),
            check_lock: tokio::sync::Mutex::new(()),
            base_backoff: DEFAULT_BASE_BACKOFF,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_backoff(mut self, base: Duration) -> Self {
        self.base_backoff = base;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    fn update_health(&self, f: impl FnOnce(&mut HealthSnapshot)) {
        let mut guard = self.health.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard);
    }
}

#[async_trait]
impl<L: Link> ConnectionManager for ResilientConnection<L> {
    async fn is_alive(&self) -> bool {
        let alive = matches!(
            tokio::time::timeout(self.probe_timeout, self.link.ping()).await,
            Ok(Ok(()))
        );
        self.update_health(|h| {
            if alive {
                h.last_verified_alive = Some(Instant::now());
                h.consecutive_failures = 0;
            } else {
                h.consecutive_failures += 1;
            }
        });
        alive
    }

    async fn reconnect(&self) -> Result<(), ConnectionError> {
        self.link.reopen().await
    }

    async fn ensure_connection(&self, max_retries: u32) -> Result<(), ConnectionError> {
        let _guard = self.check_lock.lock().await;

        if self.is_alive().await {
            return Ok(());
        }

        let mut last = "probe failed".to_string();
        for attempt in 0..max_retries {
            let delay = self.base_backoff * 2u32.saturating_pow(attempt);
            warn!(
                attempt = attempt + 1,
                max_retries,
                delay_secs = delay.as_secs_f64(),
                "Store connection is dead, reconnecting"
            );
            tokio::time::sleep(delay).await;

            match self.reconnect().await {
                Ok(()) if self.is_alive().await => {
                    info!(attempt = attempt + 1, "Store connection restored");
                    return Ok(());
                }
                Ok(()) => last = "probe failed after reconnect".to_string(),
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Reconnect failed");
                    last = e.to_string();
                }
            }
        }

        Err(ConnectionError::Exhausted {
            attempts: max_retries,
            last,
        })
    }

    async fn refresh_if_stale(&self, interval: Duration) -> Result<(), ConnectionError> {
        match self.health().last_verified_alive {
            Some(at) if at.elapsed() <= interval => Ok(()),
            _ => {
                debug!(interval_secs = interval.as_secs(), "Refreshing idle store connection");
                self.ensure_connection(DEFAULT_MAX_RETRIES).await
            }
        }
    }

    fn health(&self) -> HealthSnapshot {
        *self.health.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Embedded stores have no session to lose.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalConnection;

#[async_trait]
impl ConnectionManager for LocalConnection {
    async fn is_alive(&self) -> bool {
        true
    }

    async fn reconnect(&self) -> Result<(), ConnectionError> {
        Ok(())
    }

    async fn ensure_connection(&self, _max_retries: u32) -> Result<(), ConnectionError> {
        Ok(())
    }

    async fn refresh_if_stale(&self, _interval: Duration) -> Result<(), ConnectionError> {
        Ok(())
    }

    fn health(&self) -> HealthSnapshot {
        HealthSnapshot::default()
    }
}

/// Postgres pool behind an atomic swap, so a reopen replaces the pool under
/// running queries without blocking them.
pub struct PgLink {
    url: String,
    max_connections: u32,
    pool: ArcSwap<PgPool>,
}

impl PgLink {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, ConnectionError> {
        let pool = open_pool(url, max_connections).await?;
        Ok(Self {
            url: url.to_string(),
            max_connections,
            pool: ArcSwap::new(Arc::new(pool)),
        })
    }

    /// Current pool. Cheap clone of a shared handle.
    pub fn pool(&self) -> PgPool {
        PgPool::clone(&self.pool.load())
    }
}

async fn open_pool(url: &str, max_connections: u32) -> Result<PgPool, ConnectionError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await
        .map_err(|e| ConnectionError::Unavailable(e.to_string()))
}

#[async_trait]
impl Link for PgLink {
    async fn ping(&self) -> Result<(), ConnectionError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool())
            .await
            .map(|_| ())
            .map_err(|e| ConnectionError::Unavailable(e.to_string()))
    }

    async fn reopen(&self) -> Result<(), ConnectionError> {
        let fresh = open_pool(&self.url, self.max_connections).await?;
        let old = self.pool.swap(Arc::new(fresh));
        // close() waits for checked-out connections; a query stuck on a dead
        // socket must not hold up the health check that replaced its pool.
        tokio::spawn(async move { old.close().await });
        Ok(())
    }
}
