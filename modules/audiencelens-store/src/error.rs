use audiencelens_common::KeyError;

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// The store could not be reached. Always transient from the caller's view.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store still unreachable after {attempts} reconnect attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Connectivity-class failure from a query. Worth a reconnect and retry.
    #[error("Transient store failure: {0}")]
    Transient(String),

    /// Malformed payload, constraint violation, undecodable row. Never retried.
    #[error("Invalid cache data: {0}")]
    Invalid(String),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl CacheError {
    /// Whether `execute_with_retry` should heal the connection and try again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CacheError::Transient(_) | CacheError::Connection(ConnectionError::Unavailable(_))
        )
    }
}

/// SQLSTATE classes that mean the session is gone rather than the statement was bad:
/// 08xxx connection exceptions, 57P01-57P03 admin/crash shutdown.
///
/// SQLite BUSY/LOCKED are lock contention, already waited out by the busy
/// timeout. Reconnecting an embedded file fixes nothing, so they are final.
fn is_connection_sqlstate(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03")
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        let transient = match &e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => true,
            sqlx::Error::Database(db) => db.code().is_some_and(|c| is_connection_sqlstate(&c)),
            _ => false,
        };
        if transient {
            CacheError::Transient(e.to_string())
        } else {
            CacheError::Invalid(e.to_string())
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Invalid(e.to_string())
    }
}

impl From<KeyError> for CacheError {
    fn from(e: KeyError) -> Self {
        CacheError::Invalid(e.to_string())
    }
}
