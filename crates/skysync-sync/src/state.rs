//! Typed access to the persisted scalar state
//!
//! Wraps an [`IStateStore`] with one accessor per setting. Sets of remote
//! paths (pending and failed downloads) are updated under a lock so that
//! concurrent workers do not lose each other's writes.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use skysync_core::domain::{path_key, Cursor, ExclusionTree, RemotePath};
use skysync_core::ports::IStateStore;

const CURSOR: &str = "cursor";
const EXCLUDED_ITEMS: &str = "excluded_items";
const LAST_REINDEX: &str = "last_reindex";
const REINDEX_INTERVAL_DAYS: &str = "reindex_interval_days";
const NAMESPACE_ID: &str = "namespace_id";
const HOME_PATH: &str = "home_path";
const PENDING_DOWNLOADS: &str = "pending_downloads";
const FAILED_DOWNLOADS: &str = "failed_downloads";

/// Persisted engine settings
#[derive(Clone)]
pub struct SyncState {
    store: Arc<dyn IStateStore>,
    sets: Arc<Mutex<()>>,
}

impl SyncState {
    pub fn new(store: Arc<dyn IStateStore>) -> Self {
        Self {
            store,
            sets: Arc::new(Mutex::new(())),
        }
    }

    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get_value(key).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .with_context(|| format!("Invalid value stored for '{key}'")),
            None => Ok(None),
        }
    }

    async fn set<T: Serialize + ?Sized>(&self, key: &str, value: Option<&T>) -> Result<()> {
        match value {
            Some(value) => {
                let json = serde_json::to_value(value)?;
                self.store.set_value(key, &json).await
            }
            None => self.store.delete(key).await,
        }
    }

    // Cursor

    pub async fn cursor(&self) -> Result<Option<Cursor>> {
        let raw: Option<String> = self.get(CURSOR).await?;
        Ok(raw.and_then(|c| Cursor::new(c).ok()))
    }

    pub async fn set_cursor(&self, cursor: Option<&Cursor>) -> Result<()> {
        self.set(CURSOR, cursor.map(Cursor::as_str)).await
    }

    // Selective sync

    pub async fn excluded_items(&self) -> Result<ExclusionTree> {
        let paths: Vec<String> = self.get(EXCLUDED_ITEMS).await?.unwrap_or_default();
        Ok(ExclusionTree::from_paths(paths))
    }

    pub async fn set_excluded_items(&self, tree: &ExclusionTree) -> Result<()> {
        self.set(EXCLUDED_ITEMS, Some(&tree.paths())).await
    }

    // Reindexing

    pub async fn last_reindex(&self) -> Result<Option<DateTime<Utc>>> {
        self.get(LAST_REINDEX).await
    }

    pub async fn set_last_reindex(&self, at: Option<DateTime<Utc>>) -> Result<()> {
        self.set(LAST_REINDEX, at.as_ref()).await
    }

    /// Reindex interval chosen at runtime, overriding the configuration
    pub async fn reindex_interval_days(&self) -> Result<Option<u32>> {
        self.get(REINDEX_INTERVAL_DAYS).await
    }

    pub async fn set_reindex_interval_days(&self, days: u32) -> Result<()> {
        self.set(REINDEX_INTERVAL_DAYS, Some(&days)).await
    }

    // Namespace

    pub async fn namespace_id(&self) -> Result<Option<String>> {
        self.get(NAMESPACE_ID).await
    }

    pub async fn set_namespace_id(&self, id: &str) -> Result<()> {
        self.set(NAMESPACE_ID, Some(&id)).await
    }

    pub async fn home_path(&self) -> Result<Option<RemotePath>> {
        self.get(HOME_PATH).await
    }

    pub async fn set_home_path(&self, path: Option<&RemotePath>) -> Result<()> {
        self.set(HOME_PATH, path).await
    }

    // Download retry lists

    pub async fn pending_downloads(&self) -> Result<BTreeSet<String>> {
        Ok(self.get(PENDING_DOWNLOADS).await?.unwrap_or_default())
    }

    pub async fn add_pending_download(&self, path: &str) -> Result<()> {
        self.update_set(PENDING_DOWNLOADS, |set| set.insert(path_key(path))).await
    }

    pub async fn remove_pending_download(&self, path: &str) -> Result<()> {
        self.update_set(PENDING_DOWNLOADS, |set| set.remove(&path_key(path))).await
    }

    pub async fn failed_downloads(&self) -> Result<BTreeSet<String>> {
        Ok(self.get(FAILED_DOWNLOADS).await?.unwrap_or_default())
    }

    pub async fn add_failed_download(&self, path: &str) -> Result<()> {
        self.update_set(FAILED_DOWNLOADS, |set| set.insert(path_key(path))).await
    }

    pub async fn remove_failed_download(&self, path: &str) -> Result<()> {
        self.update_set(FAILED_DOWNLOADS, |set| set.remove(&path_key(path))).await
    }

    async fn update_set<F>(&self, key: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeSet<String>) -> bool,
    {
        let _guard = self.sets.lock().await;
        let mut set: BTreeSet<String> = self.get(key).await?.unwrap_or_default();
        if f(&mut set) {
            self.set(key, Some(&set)).await?;
        }
        Ok(())
    }

    /// Forgets everything tied to the current index
    ///
    /// The next start performs a full reconciliation.
    pub async fn reset_sync_state(&self) -> Result<()> {
        self.set_cursor(None).await?;
        self.set_last_reindex(None).await?;
        self.store.delete(PENDING_DOWNLOADS).await?;
        self.store.delete(FAILED_DOWNLOADS).await
    }
}
