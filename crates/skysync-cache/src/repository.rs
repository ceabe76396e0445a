//! SQLite implementation of ISyncIndex
//!
//! One row per remote path, keyed by the lower-cased path. Subtree queries
//! use a `LIKE` prefix match on the key with `%`, `_` and `\` escaped.
//!
//! ## Type Mapping
//!
//! | Domain Type         | SQL Type | Strategy                                      |
//! |---------------------|----------|-----------------------------------------------|
//! | path key            | TEXT     | `path_key()` of the display path              |
//! | RemotePath          | TEXT     | String via `.as_str()` / `RemotePath::new()`  |
//! | ItemKind            | TEXT     | `.name()` / `ItemKind::from_name()`           |
//! | Revision            | TEXT     | String via `.as_str()` / `Revision::new()`    |
//! | ContentHash         | TEXT     | String via `.as_str()` / `ContentHash::new()`, NULL for folders |
//! | DateTime<Utc>       | TEXT     | ISO 8601 via `to_rfc3339()` / `DateTime::parse_from_rfc3339()` |

use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, StreamExt};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool};

use skysync_core::domain::{
    newtypes::{path_key, ContentHash, RemotePath, Revision},
    IndexEntry, ItemKind,
};
use skysync_core::ports::ISyncIndex;

use crate::CacheError;

const SELECT_COLUMNS: &str =
    "SELECT path_lower, path_display, remote_id, item_kind, last_sync, rev, content_hash FROM sync_index";

/// SQLite-backed sync index
#[derive(Debug, Clone)]
pub struct SqliteSyncIndex {
    pool: SqlitePool,
}

impl SqliteSyncIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

/// Parse a DateTime<Utc> from an ISO 8601 string
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // SQLite's own datetime() format
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .map_err(|e| CacheError::corrupt(format!("Failed to parse datetime '{}': {}", s, e)))
}

/// `LIKE` pattern matching every path strictly below `key`
pub(crate) fn descendant_pattern(key: &str) -> String {
    if key == "/" {
        return "/%".to_string();
    }
    let mut escaped = String::with_capacity(key.len() + 2);
    for c in key.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push_str("/%");
    escaped
}

// ============================================================================
// Row mapping
// ============================================================================

fn index_entry_from_row(row: &SqliteRow) -> Result<IndexEntry, CacheError> {
    let path_lower: String = row.get("path_lower");
    let path_display: String = row.get("path_display");
    let remote_id: String = row.get("remote_id");
    let item_kind: String = row.get("item_kind");
    let last_sync: String = row.get("last_sync");
    let rev: String = row.get("rev");
    let content_hash: Option<String> = row.get("content_hash");

    let corrupt = |what: &str, detail: String| {
        CacheError::corrupt(format!("{} of '{}': {}", what, path_lower, detail))
    };

    Ok(IndexEntry {
        path_display: RemotePath::new(path_display).map_err(|e| corrupt("path", e.to_string()))?,
        remote_id,
        item_kind: ItemKind::from_name(&item_kind)
            .ok_or_else(|| corrupt("item kind", item_kind.clone()))?,
        last_sync: parse_datetime(&last_sync)?,
        rev: Revision::new(rev).map_err(|e| corrupt("revision", e.to_string()))?,
        content_hash: content_hash
            .map(ContentHash::new)
            .transpose()
            .map_err(|e| corrupt("content hash", e.to_string()))?,
        path_lower,
    })
}

fn bind_entry<'q>(
    query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    entry: &'q IndexEntry,
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(&entry.path_lower)
        .bind(entry.path_display.as_str())
        .bind(&entry.remote_id)
        .bind(entry.item_kind.name())
        .bind(entry.last_sync.to_rfc3339())
        .bind(entry.rev.as_str())
        .bind(entry.content_hash.as_ref().map(|h| h.as_str()))
}

const UPSERT_SQL: &str = r#"
    INSERT INTO sync_index (path_lower, path_display, remote_id, item_kind, last_sync, rev, content_hash)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
    ON CONFLICT(path_lower) DO UPDATE SET
        path_display = excluded.path_display,
        remote_id = excluded.remote_id,
        item_kind = excluded.item_kind,
        last_sync = excluded.last_sync,
        rev = excluded.rev,
        content_hash = excluded.content_hash
"#;

// ============================================================================
// ISyncIndex implementation
// ============================================================================

#[async_trait::async_trait]
impl ISyncIndex for SqliteSyncIndex {
    async fn get(&self, path: &str) -> anyhow::Result<Option<IndexEntry>> {
        let sql = format!("{SELECT_COLUMNS} WHERE path_lower = ?1");
        let row = sqlx::query(&sql)
            .bind(path_key(path))
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(index_entry_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, entry: &IndexEntry) -> anyhow::Result<()> {
        bind_entry(sqlx::query(UPSERT_SQL), entry)
            .execute(&self.pool)
            .await?;
        tracing::trace!(path = %entry.path_display, rev = %entry.rev, "Index entry stored");
        Ok(())
    }

    async fn put_many(&self, entries: &[IndexEntry]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            bind_entry(sqlx::query(UPSERT_SQL), entry)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> anyhow::Result<u64> {
        let key = path_key(path);
        let result = sqlx::query(
            r#"DELETE FROM sync_index WHERE path_lower = ?1 OR path_lower LIKE ?2 ESCAPE '\'"#,
        )
        .bind(&key)
        .bind(descendant_pattern(&key))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn descendants(&self, path: &str) -> anyhow::Result<Vec<IndexEntry>> {
        let sql = format!(r#"{SELECT_COLUMNS} WHERE path_lower LIKE ?1 ESCAPE '\' ORDER BY path_lower"#);
        let rows = sqlx::query(&sql)
            .bind(descendant_pattern(&path_key(path)))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| index_entry_from_row(row).map_err(anyhow::Error::from))
            .collect()
    }

    fn iterate(&self) -> BoxStream<'_, anyhow::Result<IndexEntry>> {
        sqlx::query(
            "SELECT path_lower, path_display, remote_id, item_kind, last_sync, rev, content_hash \
             FROM sync_index ORDER BY path_lower",
        )
        .fetch(&self.pool)
        .map(|row| -> anyhow::Result<IndexEntry> {
            let row = row?;
            Ok(index_entry_from_row(&row)?)
        })
        .boxed()
    }

    async fn count(&self) -> anyhow::Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_index")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn clear(&self) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM sync_index")
            .execute(&self.pool)
            .await?;
        tracing::info!("Sync index cleared");
        Ok(())
    }
}
