//! Sync index ports (driven/secondary ports)
//!
//! - [`ISyncIndex`] - last synchronized state per remote path
//! - [`IHashCache`] - memoized local fingerprints
//! - [`IStateStore`] - small scalar settings (cursor, exclusions, ...)
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific and
//!   don't need domain-level classification.
//! - Paths passed to [`ISyncIndex`] may use any casing; adapters compare by
//!   the lower-cased key.
//! - Each write is atomic; [`ISyncIndex::put_many`] commits all entries or
//!   none.

use std::path::Path;

use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::domain::index_entry::{HashCacheEntry, IndexEntry};

/// A stored record that no longer decodes
///
/// Adapters put this in the error chain so that callers can tell a corrupt
/// index, which needs a rebuild, from a transient storage failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct IndexCorruption(pub String);

/// Port trait for the sync index
#[async_trait::async_trait]
pub trait ISyncIndex: Send + Sync {
    /// Entry for `path`, compared case-insensitively
    async fn get(&self, path: &str) -> anyhow::Result<Option<IndexEntry>>;

    /// Inserts or replaces the entry keyed by `entry.path_lower`
    async fn put(&self, entry: &IndexEntry) -> anyhow::Result<()>;

    /// Inserts or replaces several entries in one transaction
    async fn put_many(&self, entries: &[IndexEntry]) -> anyhow::Result<()>;

    /// Removes the entry for `path` and every entry below it
    ///
    /// Returns the number of entries removed.
    async fn remove(&self, path: &str) -> anyhow::Result<u64>;

    /// Entries strictly below `path`, parents before children
    async fn descendants(&self, path: &str) -> anyhow::Result<Vec<IndexEntry>>;

    /// Lazily streams every entry ordered by path
    ///
    /// Each call starts a fresh scan.
    fn iterate(&self) -> BoxStream<'_, anyhow::Result<IndexEntry>>;

    async fn count(&self) -> anyhow::Result<u64>;

    /// Removes every entry
    async fn clear(&self) -> anyhow::Result<()>;
}

/// Port trait for the local fingerprint cache
#[async_trait::async_trait]
pub trait IHashCache: Send + Sync {
    async fn get(&self, local_path: &Path) -> anyhow::Result<Option<HashCacheEntry>>;

    async fn put(&self, entry: &HashCacheEntry) -> anyhow::Result<()>;

    async fn remove(&self, local_path: &Path) -> anyhow::Result<()>;

    async fn clear(&self) -> anyhow::Result<()>;
}

/// Port trait for persisted scalar settings
///
/// Values are stored as JSON so adapters need no per-key schema.
#[async_trait::async_trait]
pub trait IStateStore: Send + Sync {
    async fn get_value(&self, key: &str) -> anyhow::Result<Option<Value>>;

    async fn set_value(&self, key: &str, value: &Value) -> anyhow::Result<()>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}
