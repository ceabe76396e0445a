//! Database connection pool management
//!
//! Wraps SQLx's `SqlitePool` with directory creation, WAL journaling, a
//! busy timeout and the embedded schema migration. The index and the hash
//! cache live in separate files so that rebuilding the index never discards
//! cached fingerprints; [`DatabasePool::open_all`] opens both.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use skysync_core::config::DatabaseConfig;

use crate::CacheError;

const MIGRATION_SQL: &str = include_str!("migrations/20261017_initial.sql");

/// A pool of SQLite connections with the SkySync schema applied
///
/// File-backed pools allow 5 connections. In-memory pools use a single
/// connection, since every SQLite in-memory connection is its own database.
#[derive(Debug, Clone)]
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Opens (creating if needed) the database file at `db_path`
    ///
    /// # Errors
    ///
    /// Returns `CacheError::ConnectionFailed` if the directory or connection
    /// cannot be created, or `CacheError::MigrationFailed` if the schema
    /// cannot be applied.
    pub async fn new(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "Failed to open database at {}: {}",
                    db_path.display(),
                    e
                ))
            })?;

        Self::run_migrations(&pool).await?;

        tracing::info!(path = %db_path.display(), "Database opened");
        Ok(Self { pool })
    }

    /// Creates an in-memory database for testing
    ///
    /// # Errors
    ///
    /// Same as [`DatabasePool::new`].
    pub async fn in_memory() -> Result<Self, CacheError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!("Failed to create in-memory database: {}", e))
            })?;

        Self::run_migrations(&pool).await?;

        tracing::debug!("In-memory database initialized");
        Ok(Self { pool })
    }

    /// Opens the index and hash cache databases named in `config`
    ///
    /// Returns `(index, hash_cache)`.
    pub async fn open_all(config: &DatabaseConfig) -> Result<(Self, Self), CacheError> {
        let index = Self::new(&config.index_path).await?;
        let hash_cache = Self::new(&config.hash_cache_path).await?;
        Ok((index, hash_cache))
    }

    /// Returns a reference to the underlying SQLite connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every connection, waiting for in-flight queries
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), CacheError> {
        sqlx::raw_sql(MIGRATION_SQL)
            .execute(pool)
            .await
            .map_err(|e| {
                CacheError::MigrationFailed(format!("Failed to apply schema: {}", e))
            })?;

        tracing::debug!("Database schema up to date");
        Ok(())
    }
}
