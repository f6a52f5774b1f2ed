pub mod backend;
pub mod connection;
pub mod entry;
pub mod error;
pub mod postgres;
pub mod sqlite;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
#[cfg(feature = "test-utils")]
pub mod testutil;

pub use backend::CacheBackend;
pub use connection::{
    ConnectionManager, HealthSnapshot, Link, LocalConnection, PgLink, ResilientConnection,
    DEFAULT_MAX_RETRIES,
};
pub use entry::{CacheEntry, EntryMeta, QueryCacheEntry, SOURCE_DEEP_RESEARCH};
pub use error::{CacheError, ConnectionError, Result};
pub use postgres::PgCacheBackend;
pub use sqlite::SqliteCacheBackend;
pub use store::{execute_with_retry, CacheStore, DEFAULT_TTL};
