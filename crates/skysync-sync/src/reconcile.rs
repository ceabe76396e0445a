//! Reconciliation passes
//!
//! A reconciliation compares a complete remote listing and a complete walk
//! of the local folder with the index, instead of relying on the change
//! feed and the watcher. It runs at startup when the index is stale, after
//! the index was rebuilt, and whenever no cursor exists.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::thread::available_parallelism;

use chrono::Utc;
use futures_util::{stream, StreamExt, TryStreamExt};
use tracing::{debug, info, instrument, warn};

use skysync_core::domain::{DeletedMetadata, IndexEntry, LocalFingerprint, Metadata, RemotePath};

use crate::coalesce::coalesce;
use crate::engine::SyncEngine;
use crate::errors::{EngineResult, FatalError};
use crate::filesystem;
use crate::fs_event::FsEvent;

impl SyncEngine {
    /// Runs once before the workers start
    ///
    /// Retries downloads that failed or were interrupted, then either runs a
    /// full reconciliation or catches up with the change feed and uploads
    /// whatever changed locally while the engine was stopped.
    #[instrument(skip(self))]
    pub async fn startup(&self) -> EngineResult<usize> {
        self.check_root().await?;
        filesystem::clean_staging(&self.root).await?;
        self.load_excluded_items().await?;
        self.check_namespace().await?;

        let mut synced = self.retry_failed_downloads().await?;
        if self.needs_reindex().await? {
            synced += self.full_sync().await?;
        } else {
            synced += self.download_sync_cycle().await?;
            synced += self.upload_local_scan().await?;
        }
        info!(synced, "Startup sync complete");
        Ok(synced)
    }

    /// Fails with [`FatalError::RootMissing`] if the sync folder is gone
    pub async fn check_root(&self) -> EngineResult<()> {
        match filesystem::stat(&self.root).await? {
            Some(meta) if meta.is_dir() => Ok(()),
            _ => Err(FatalError::RootMissing(self.root.clone()).into()),
        }
    }

    /// True if there is no cursor or the last full reconciliation is older
    /// than the reindex interval
    pub async fn needs_reindex(&self) -> EngineResult<bool> {
        if self.state.cursor().await?.is_none() {
            return Ok(true);
        }
        let interval = match self.state.reindex_interval_days().await? {
            Some(days) => chrono::Duration::days(i64::from(days)),
            None => self.config.reindex_interval(),
        };
        Ok(match self.state.last_reindex().await? {
            Some(at) => Utc::now() - at > interval,
            None => true,
        })
    }

    /// Compares the complete remote tree and the local folder with the index
    /// and syncs every difference
    ///
    /// Index entries missing from the listing are applied as remote
    /// deletions, keeping local modifications.
    #[instrument(skip(self))]
    pub async fn full_sync(&self) -> EngineResult<usize> {
        info!("Starting full reconciliation");
        let (mut changes, cursor) = self.list_all(&RemotePath::root(), true).await?;

        let listed: HashSet<String> = changes.iter().map(Metadata::path_lower).collect();
        let indexed: Vec<IndexEntry> = self.index.iterate().try_collect().await?;
        {
            let excluded = self.excluded.read().await;
            changes.extend(
                indexed
                    .into_iter()
                    .filter(|entry| !listed.contains(&entry.path_lower))
                    .filter(|entry| !excluded.is_excluded(&entry.path_lower))
                    .map(|entry| {
                        Metadata::Deleted(DeletedMetadata {
                            path_display: entry.path_display,
                        })
                    }),
            );
        }

        let downloaded = self.apply_remote_changes(changes).await?;
        self.state.set_cursor(Some(&cursor)).await?;
        self.state.set_last_reindex(Some(Utc::now())).await?;

        let uploaded = self.upload_local_scan().await?;
        info!(downloaded, uploaded, "Full reconciliation complete");
        Ok(downloaded + uploaded)
    }

    /// Uploads every local difference to the index
    pub async fn upload_local_scan(&self) -> EngineResult<usize> {
        let events = self.scan_local_changes().await?;
        if events.is_empty() {
            return Ok(0);
        }
        info!(count = events.len(), "Found local changes");
        self.upload_local_changes(events).await
    }

    /// Walks the local folder and returns the events that turn the indexed
    /// state into the current one
    pub async fn scan_local_changes(&self) -> EngineResult<Vec<FsEvent>> {
        let indexed: HashMap<String, IndexEntry> = self
            .index
            .iterate()
            .map_ok(|entry| (entry.path_lower.clone(), entry))
            .try_collect()
            .await?;
        let items = filesystem::walk(&self.root, &self.root).await?;
        let excluded = self.excluded.read().await.clone();

        let mut events = Vec::new();
        let mut seen: HashSet<String> = HashSet::with_capacity(items.len());
        // Folders reported as new; their contents are added when uploading.
        let mut covered: Vec<PathBuf> = Vec::new();
        let mut to_hash = Vec::new();

        for item in items {
            if covered.iter().any(|dir| item.path.starts_with(dir)) {
                continue;
            }
            let Ok(remote_path) = self.classifier.to_remote(&item.path) else {
                continue;
            };
            let key = remote_path.lower();
            seen.insert(key.clone());

            if excluded.is_excluded(&key) {
                events.push(FsEvent::created(item.path.clone(), item.is_dir));
                if item.is_dir {
                    covered.push(item.path);
                }
                continue;
            }
            match indexed.get(&key) {
                None => {
                    events.push(FsEvent::created(item.path.clone(), item.is_dir));
                    if item.is_dir {
                        covered.push(item.path);
                    }
                }
                Some(entry) if entry.is_folder() != item.is_dir => {
                    events.push(FsEvent::deleted(item.path.clone(), entry.is_folder()));
                    events.push(FsEvent::created(item.path.clone(), item.is_dir));
                    if item.is_dir {
                        covered.push(item.path);
                    }
                }
                Some(entry) if !item.is_dir => to_hash.push((item.path, entry.content_hash.clone())),
                Some(_) => {}
            }
        }

        let workers = available_parallelism().map_or(1, |n| n.get());
        let hashed: Vec<anyhow::Result<Option<PathBuf>>> = stream::iter(to_hash)
            .map(|(path, indexed_hash)| async move {
                let changed = match self.hasher.get_local_hash(&path).await? {
                    LocalFingerprint::File(hash) => indexed_hash.as_ref() != Some(&hash),
                    _ => false,
                };
                Ok::<_, anyhow::Error>(changed.then_some(path))
            })
            .buffer_unordered(workers)
            .collect()
            .await;
        for result in hashed {
            if let Some(path) = result? {
                events.push(FsEvent::modified(path, false));
            }
        }

        let mut missing: Vec<&IndexEntry> = indexed
            .values()
            .filter(|entry| !seen.contains(&entry.path_lower))
            .filter(|entry| !excluded.is_excluded(&entry.path_lower))
            .collect();
        missing.sort_by(|a, b| a.path_lower.cmp(&b.path_lower));
        let mut deleted_dirs: Vec<&RemotePath> = Vec::new();
        for entry in missing {
            if deleted_dirs
                .iter()
                .any(|dir| entry.path_display.is_descendant_of(dir))
            {
                continue;
            }
            events.push(FsEvent::deleted(
                self.classifier.to_local(&entry.path_display),
                entry.is_folder(),
            ));
            if entry.is_folder() {
                deleted_dirs.push(&entry.path_display);
            }
        }

        debug!(count = events.len(), "Scanned local folder");
        Ok(coalesce(events))
    }

    /// Downloads items whose previous download failed or was interrupted
    pub async fn retry_failed_downloads(&self) -> EngineResult<usize> {
        let mut paths: BTreeSet<String> = self.state.pending_downloads().await?;
        paths.extend(self.state.failed_downloads().await?);
        if paths.is_empty() {
            return Ok(0);
        }
        info!(count = paths.len(), "Retrying failed downloads");

        let mut changes = Vec::with_capacity(paths.len());
        for key in paths {
            self.state.remove_pending_download(&key).await?;
            self.state.remove_failed_download(&key).await?;
            let Ok(path) = RemotePath::new(key.clone()) else {
                warn!(path = %key, "Dropping invalid path from retry list");
                continue;
            };
            match self.remote.get_metadata(&path).await {
                Ok(Some(md)) => changes.push(md),
                Ok(None) => changes.push(Metadata::Deleted(DeletedMetadata { path_display: path })),
                Err(err) if err.is_connection() => {
                    self.state.add_failed_download(&key).await?;
                    return Err(err.into());
                }
                Err(err) => {
                    warn!(path = %key, error = %err, "Cannot fetch metadata for retry");
                    self.state.add_failed_download(&key).await?;
                }
            }
        }
        self.apply_remote_changes(changes).await
    }

    /// Clears the index and runs a full reconciliation
    #[instrument(skip(self))]
    pub async fn rebuild_index(&self) -> EngineResult<usize> {
        {
            let _lock = self.sync_lock.lock().await;
            info!("Rebuilding sync index");
            self.index.clear().await?;
            self.state.reset_sync_state().await?;
            self.events.clear();
        }
        self.full_sync().await
    }
}
