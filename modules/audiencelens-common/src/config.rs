use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_AGENT: &str = "deep-research-pro-preview-12-2025";
const DEFAULT_SQLITE_PATH: &str = "./data/audiencelens.db";

/// Where cached demographics live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// Hosted Postgres, reached through the resilient connection manager.
    Postgres(String),
    /// Embedded SQLite file.
    Sqlite(PathBuf),
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Research agent
    pub research_api_key: String,
    pub research_base_url: String,
    pub research_agent: String,
    pub research_timeout: Duration,

    // Cache store
    pub store: StoreLocation,
    pub demographics_ttl: Duration,
    pub connection_refresh_interval: Duration,

    // Background worker
    pub worker_concurrency: usize,
}

impl Config {
    /// Load `.env` (if present) and then the process environment.
    pub fn from_env() -> Result<Self> {
        Self::load(true)
    }

    /// Config for commands that only read or maintain the cache (no research key needed).
    pub fn store_from_env() -> Result<Self> {
        Self::load(false)
    }

    fn load(require_research_key: bool) -> Result<Self> {
        dotenvy::dotenv().ok();

        let store = match env::var("DATABASE_URL") {
            Ok(url) if !url.trim().is_empty() => StoreLocation::Postgres(url),
            _ => StoreLocation::Sqlite(PathBuf::from(
                env::var("SQLITE_PATH").unwrap_or_else(|_| DEFAULT_SQLITE_PATH.to_string()),
            )),
        };

        let demographics_ttl = ttl_from_days(parsed_env("DEMOGRAPHICS_TTL_DAYS", 90)?)?;
        let worker_concurrency: usize = parsed_env("ENRICHMENT_CONCURRENCY", 4)?;
        if worker_concurrency == 0 {
            anyhow::bail!("ENRICHMENT_CONCURRENCY must be at least 1");
        }

        let config = Self {
            research_api_key: if require_research_key {
                required_env("RESEARCH_API_KEY")?
            } else {
                env::var("RESEARCH_API_KEY").unwrap_or_default()
            },
            research_base_url: env::var("RESEARCH_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            research_agent: env::var("RESEARCH_AGENT")
                .unwrap_or_else(|_| DEFAULT_AGENT.to_string()),
            research_timeout: Duration::from_secs(parsed_env("RESEARCH_TIMEOUT_SECS", 1800)?),
            store,
            demographics_ttl,
            connection_refresh_interval: Duration::from_secs(parsed_env(
                "CONNECTION_REFRESH_SECS",
                300,
            )?),
            worker_concurrency,
        };
        config.log_keys();
        Ok(config)
    }

    /// Log which keys are present (first 4 chars only) for debugging.
    pub fn log_keys(&self) {
        let preview = |s: &str| {
            if s.len() > 4 {
                format!("{}...", s.chars().take(4).collect::<String>())
            } else if s.is_empty() {
                "(empty)".to_string()
            } else {
                "(set)".to_string()
            }
        };
        let store = match &self.store {
            StoreLocation::Postgres(_) => "postgres".to_string(),
            StoreLocation::Sqlite(path) => format!("sqlite:{}", path.display()),
        };
        info!(
            research_api_key = preview(&self.research_api_key),
            research_agent = %self.research_agent,
            store = %store,
            ttl_days = self.demographics_ttl.as_secs() / 86_400,
            "Config loaded"
        );
    }
}

fn required_env(key: &str) -> Result<String> {
    env::var(key).with_context(|| format!("{key} environment variable is required"))
}

fn ttl_from_days(days: u64) -> Result<Duration> {
    days.checked_mul(86_400)
        .map(Duration::from_secs)
        .with_context(|| format!("DEMOGRAPHICS_TTL_DAYS is too large: {days}"))
}

fn parsed_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a number, got {raw:?}")),
        Err(_) => Ok(default),
    }
}
