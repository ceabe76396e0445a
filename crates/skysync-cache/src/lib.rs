//! SkySync Cache - Local state persistence
//!
//! SQLite-based storage for:
//! - The sync index (last synchronized state per remote path)
//! - The local fingerprint cache
//! - Scalar settings such as the remote cursor and the exclusion list
//!
//! ## Architecture
//!
//! This crate implements the `ISyncIndex`, `IHashCache` and `IStateStore`
//! ports from `skysync-core` using SQLite as the storage backend. It is a
//! driven (secondary) adapter in the hexagonal architecture.
//!
//! ## Key Components
//!
//! - [`DatabasePool`] - Connection pool with migration support
//! - [`SqliteSyncIndex`] - `ISyncIndex` implementation
//! - [`SqliteHashCache`] - `IHashCache` implementation
//! - [`SqliteStateStore`] - `IStateStore` implementation
//! - [`CacheError`] - Error types for cache operations
//!
//! ## Usage
//!
//! ```no_run
//! use skysync_cache::{DatabasePool, SqliteSyncIndex};
//! use skysync_core::config::DatabaseConfig;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let (index_db, _cache_db) = DatabasePool::open_all(&DatabaseConfig::default()).await?;
//! let index = SqliteSyncIndex::new(index_db.pool().clone());
//! // Use index as ISyncIndex...
//! # Ok(())
//! # }
//! ```

pub mod hash_cache;
pub mod pool;
pub mod repository;
pub mod state_store;

pub use hash_cache::SqliteHashCache;
pub use pool::DatabasePool;
pub use repository::SqliteSyncIndex;
pub use state_store::SqliteStateStore;

use skysync_core::ports::IndexCorruption;

/// Errors that can occur during cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A stored row does not decode into a domain type
    #[error("Corrupt record: {0}")]
    CorruptRecord(#[source] IndexCorruption),
}

impl CacheError {
    pub(crate) fn corrupt(detail: impl Into<String>) -> Self {
        CacheError::CorruptRecord(IndexCorruption(detail.into()))
    }
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}
