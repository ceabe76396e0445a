//! SQLite implementation of IHashCache

use std::path::{Path, PathBuf};

use sqlx::{Row, SqlitePool};

use skysync_core::domain::{newtypes::ContentHash, HashCacheEntry};
use skysync_core::ports::IHashCache;

use crate::CacheError;

/// Fingerprint cache keyed by local path
#[derive(Debug, Clone)]
pub struct SqliteHashCache {
    pool: SqlitePool,
}

impl SqliteHashCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait::async_trait]
impl IHashCache for SqliteHashCache {
    async fn get(&self, local_path: &Path) -> anyhow::Result<Option<HashCacheEntry>> {
        let row = sqlx::query("SELECT mtime_ns, content_hash FROM hash_cache WHERE local_path = ?1")
            .bind(path_text(local_path))
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mtime_ns: i64 = row.get("mtime_ns");
        let content_hash: String = row.get("content_hash");
        let content_hash = ContentHash::new(content_hash)
            .map_err(|e| CacheError::corrupt(e.to_string()))?;

        Ok(Some(HashCacheEntry {
            local_path: PathBuf::from(local_path),
            mtime_ns,
            content_hash,
        }))
    }

    async fn put(&self, entry: &HashCacheEntry) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO hash_cache (local_path, mtime_ns, content_hash)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(local_path) DO UPDATE SET
                mtime_ns = excluded.mtime_ns,
                content_hash = excluded.content_hash
            "#,
        )
        .bind(path_text(&entry.local_path))
        .bind(entry.mtime_ns)
        .bind(entry.content_hash.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, local_path: &Path) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM hash_cache WHERE local_path = ?1")
            .bind(path_text(local_path))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM hash_cache")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
