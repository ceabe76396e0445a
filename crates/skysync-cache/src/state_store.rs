//! SQLite implementation of IStateStore
//!
//! Values are stored as JSON text; an unparsable value is reported as a
//! corrupt record rather than silently dropped.

use serde_json::Value;
use sqlx::{Row, SqlitePool};

use skysync_core::ports::IStateStore;

use crate::CacheError;

/// Key/value store for scalar sync settings
#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl IStateStore for SqliteStateStore {
    async fn get_value(&self, key: &str) -> anyhow::Result<Option<Value>> {
        let row = sqlx::query("SELECT value FROM sync_state WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let text: String = row.get("value");
                let value = serde_json::from_str(&text).map_err(|e| {
                    CacheError::corrupt(format!("state '{}': {}", key, e))
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set_value(&self, key: &str, value: &Value) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value.to_string())
        .execute(&self.pool)
        .await?;
        tracing::trace!(key, "State value stored");
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM sync_state WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
