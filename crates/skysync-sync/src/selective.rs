//! Selective sync
//!
//! Excluding an item deletes its local copy and index entries but leaves it
//! untouched remotely. Including an item removes it from the exclusion list;
//! the caller then downloads it with [`SyncEngine::download_tree`].

use std::collections::HashMap;

use tracing::{debug, info, instrument};

use skysync_core::domain::{Metadata, RemotePath};

use crate::engine::SyncEngine;
use crate::errors::EngineResult;
use crate::filesystem;

impl SyncEngine {
    /// Excludes `path` and its descendants from sync and removes them locally
    #[instrument(skip(self), fields(path = %path))]
    pub async fn exclude_item(&self, path: &RemotePath) -> EngineResult<()> {
        let _lock = self.sync_lock.lock().await;
        {
            let mut excluded = self.excluded.write().await;
            if !excluded.exclude(path)? {
                debug!("Already excluded");
                return Ok(());
            }
            self.state.set_excluded_items(&excluded).await?;
        }

        let display = self
            .index
            .get(path.as_str())
            .await?
            .map_or_else(|| path.clone(), |entry| entry.path_display);
        let wanted = self.classifier.to_local(&display);
        let local = filesystem::find_case_insensitive(&wanted)
            .await?
            .unwrap_or(wanted);
        {
            let _guard = self.events.ignore([local.clone()], true);
            filesystem::remove_item(&local).await?;
        }
        self.hasher.forget(&local).await?;
        let removed = self.index.remove(path.as_str()).await?;
        self.activity.clear_sync_errors(&local);
        info!(index_entries = removed, "Excluded item from sync");
        Ok(())
    }

    /// Includes `path` in sync again and returns the paths to download
    ///
    /// Including an item below an excluded folder lists the folders in
    /// between, so that their other children stay excluded.
    #[instrument(skip(self), fields(path = %path))]
    pub async fn include_item(&self, path: &RemotePath) -> EngineResult<Vec<RemotePath>> {
        let folders = self.excluded.read().await.folders_to_expand(path);
        let mut children: HashMap<String, Vec<String>> = HashMap::with_capacity(folders.len());
        for folder in folders {
            let folder_path = RemotePath::new(folder.clone())?;
            let (entries, _) = self.list_all(&folder_path, false).await?;
            let names = entries
                .iter()
                .filter(|md| !md.is_deleted())
                .map(Metadata::path_lower)
                .filter(|child| *child != folder)
                .collect();
            children.insert(folder, names);
        }

        let included = {
            let mut excluded = self.excluded.write().await;
            let included = excluded.include(path, |folder| {
                children.get(folder).cloned().unwrap_or_default()
            })?;
            if !included.is_empty() {
                self.state.set_excluded_items(&excluded).await?;
            }
            included
        };
        info!(count = included.len(), "Included item in sync");

        included
            .into_iter()
            .map(|p| RemotePath::new(p).map_err(Into::into))
            .collect()
    }

    /// Downloads `path` with everything below it, plus any parent folders
    /// that are not synced yet
    #[instrument(skip(self), fields(path = %path))]
    pub async fn download_tree(&self, path: &RemotePath) -> EngineResult<usize> {
        let mut missing_parents = Vec::new();
        let mut current = path.parent();
        while let Some(parent) = current {
            if parent.is_root() {
                break;
            }
            if self.index.get(parent.as_str()).await?.is_none() {
                missing_parents.push(parent.clone());
            }
            current = parent.parent();
        }

        let mut changes = Vec::new();
        for parent in missing_parents.iter().rev() {
            if let Some(md) = self.remote.get_metadata(parent).await? {
                changes.push(md);
            }
        }
        match self.remote.get_metadata(path).await? {
            Some(md @ Metadata::Folder(_)) => {
                changes.push(md);
                let (entries, _) = self.list_all(path, true).await?;
                changes.extend(entries);
            }
            Some(md) => changes.push(md),
            None => {
                debug!("Item no longer exists remotely");
                return Ok(0);
            }
        }
        self.apply_remote_changes(changes).await
    }
}
