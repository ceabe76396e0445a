//! Root namespace migration
//!
//! Remote paths are resolved relative to the account's root namespace. When
//! an account joins a team space, its files move below a home folder
//! (`/Robin Smith/...`); when it leaves, they move back up to the root. The
//! local folder is relocated to the new layout through a temporary directory
//! so that no two items ever compete for a name, the exclusion list is
//! rewritten to the new prefixes, and the index is rebuilt from scratch.

use std::path::Path;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use skysync_conflict::ConflictSuffix;
use skysync_core::domain::RemotePath;
use skysync_core::ports::NamespaceInfo;

use crate::engine::SyncEngine;
use crate::errors::EngineResult;
use crate::filesystem;

impl SyncEngine {
    /// Compares the remote root namespace with the stored one and migrates
    /// the local folder if it changed
    #[instrument(skip(self))]
    pub async fn check_namespace(&self) -> EngineResult<()> {
        let info = self.remote.get_namespace_info().await?;
        match self.state.namespace_id().await? {
            None => {
                debug!(namespace = %info.root_namespace_id, "Storing root namespace");
                self.state.set_namespace_id(&info.root_namespace_id).await?;
                self.state.set_home_path(info.home_path.as_ref()).await?;
                Ok(())
            }
            Some(id) if id == info.root_namespace_id => Ok(()),
            Some(old_id) => {
                info!(
                    from = %old_id,
                    to = %info.root_namespace_id,
                    team = info.is_team(),
                    "Root namespace changed, migrating local folder"
                );
                let old_home = self.state.home_path().await?;
                self.migrate_namespace(old_home, &info).await
            }
        }
    }

    /// Moves local items from the old home folder to the new one, rewrites
    /// the exclusions and forces a full reindex
    pub async fn migrate_namespace(&self, old_home: Option<RemotePath>, info: &NamespaceInfo) -> EngineResult<()> {
        let _lock = self.sync_lock.lock().await;
        let _guard = self.events.ignore([self.root.clone()], true);

        let from = old_home.unwrap_or_else(RemotePath::root);
        let to = info.home_path.clone().unwrap_or_else(RemotePath::root);
        if from.lower() != to.lower() {
            self.relocate_local_items(&from, &to).await?;
        }

        {
            let mut excluded = self.excluded.write().await;
            excluded.rewrite_prefix(&from, &to, info.is_team());
            self.state.set_excluded_items(&excluded).await?;
        }

        self.index.clear().await?;
        self.state.reset_sync_state().await?;
        self.state.set_namespace_id(&info.root_namespace_id).await?;
        self.state.set_home_path(info.home_path.as_ref()).await?;
        self.events.clear();
        info!(home = %to, "Namespace migration complete");
        Ok(())
    }

    /// Relocates the children of `from` to `to`, both relative to the root
    ///
    /// Everything is parked in a migration directory first; items outside
    /// `from` return to the root afterwards.
    async fn relocate_local_items(&self, from: &RemotePath, to: &RemotePath) -> anyhow::Result<()> {
        let parking = self
            .root
            .join(format!("{}{}", filesystem::MIGRATION_DIR_PREFIX, Uuid::new_v4()));
        filesystem::ensure_dir(&parking).await?;
        self.move_children(&self.root, &parking).await?;

        let source = from.to_local(&parking);
        let target = to.to_local(&self.root);
        if filesystem::stat(&source).await?.is_some() {
            filesystem::ensure_dir(&target).await?;
            self.move_children(&source, &target).await?;
            if source != parking {
                if let Err(e) = tokio::fs::remove_dir(&source).await {
                    debug!(error = %e, "Old home folder not removed");
                }
            }
        }

        self.move_children(&parking, &self.root).await?;
        if let Err(e) = tokio::fs::remove_dir(&parking).await {
            warn!(path = %parking.display(), error = %e, "Migration directory not empty");
        }
        info!(from = %from, to = %to, "Relocated local items");
        Ok(())
    }

    /// Moves every child of `src` into `dest`, renaming on collisions
    async fn move_children(&self, src: &Path, dest: &Path) -> anyhow::Result<()> {
        for child in filesystem::read_children(src).await? {
            let Some(name) = child.file_name() else {
                continue;
            };
            let mut target = dest.join(name);
            if filesystem::stat(&target).await?.is_some() {
                let is_dir = filesystem::stat(&child).await?.map_or(false, |m| m.is_dir());
                target = self
                    .unique_sibling(&target, is_dir, ConflictSuffix::ConflictingCopy)
                    .await?;
            }
            filesystem::move_item(&child, &target).await?;
        }
        Ok(())
    }
}
