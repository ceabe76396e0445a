//! Change classification
//!
//! Turns remote metadata and coalesced local events into [`SyncEvent`]s,
//! or into nothing when the item is already in its synced state. Local
//! items are compared to the index by fingerprint, remote items by
//! revision.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, trace};

use skysync_core::domain::{
    ChangeType, DomainError, IndexEntry, ItemKind, Metadata, RemotePath, SyncDirection, SyncEvent,
};
use skysync_core::ports::ISyncIndex;

use crate::filesystem;
use crate::fs_event::{FsEvent, FsEventKind};
use crate::hasher::LocalHasher;

/// Decides what needs to be transferred
pub struct Classifier {
    root: PathBuf,
    index: Arc<dyn ISyncIndex>,
    hasher: LocalHasher,
}

impl Classifier {
    pub fn new(root: impl Into<PathBuf>, index: Arc<dyn ISyncIndex>, hasher: LocalHasher) -> Self {
        Self {
            root: root.into(),
            index,
            hasher,
        }
    }

    pub fn to_remote(&self, local: &Path) -> Result<RemotePath, DomainError> {
        RemotePath::from_local(&self.root, local)
    }

    pub fn to_local(&self, remote: &RemotePath) -> PathBuf {
        remote.to_local(&self.root)
    }

    /// Classifies a remote change against its index entry
    ///
    /// Returns `None` for a deletion of an unknown item and for an item whose
    /// kind and revision are already indexed.
    pub fn classify_remote(&self, md: &Metadata, entry: Option<&IndexEntry>) -> Option<SyncEvent> {
        let local_path = self.to_local(md.path_display());
        match md {
            Metadata::Deleted(_) => {
                let entry = entry?;
                Some(SyncEvent::from_metadata(
                    md,
                    ChangeType::Removed,
                    entry.item_kind,
                    local_path,
                ))
            }
            Metadata::File(_) | Metadata::Folder(_) => {
                if let Some(entry) = entry {
                    if entry.item_kind == md.item_kind() && md.rev().as_ref() == Some(&entry.rev) {
                        trace!(path = %md.path_display(), "Remote item unchanged");
                        return None;
                    }
                }
                let change_type = if entry.is_some() {
                    ChangeType::Modified
                } else {
                    ChangeType::Added
                };
                Some(SyncEvent::from_metadata(
                    md,
                    change_type,
                    md.item_kind(),
                    local_path,
                ))
            }
        }
    }

    /// Classifies a coalesced local event against the index
    ///
    /// # Errors
    ///
    /// Fails if the path cannot be expressed remotely or if the index or the
    /// file cannot be read.
    pub async fn classify_local(&self, event: &FsEvent) -> Result<Option<SyncEvent>> {
        match event.kind {
            FsEventKind::Created | FsEventKind::Modified => self.classify_write(&event.src_path).await,
            FsEventKind::Deleted => self.classify_delete(&event.src_path).await,
            FsEventKind::Moved => {
                let Some(dest) = event.dest_path.as_deref() else {
                    return self.classify_write(&event.src_path).await;
                };
                self.classify_move(&event.src_path, dest, event.is_directory)
                    .await
            }
        }
    }

    async fn classify_write(&self, path: &Path) -> Result<Option<SyncEvent>> {
        let remote = self.to_remote(path)?;
        let local = self.hasher.get_local_hash(path).await?;
        if !local.exists() {
            debug!(path = %path.display(), "Item vanished before upload");
            return Ok(None);
        }

        let entry = self.index.get(remote.as_str()).await?;
        if let Some(entry) = &entry {
            if entry.fingerprint() == local {
                trace!(path = %remote, "Local item unchanged");
                return Ok(None);
            }
        }

        let change_type = match &entry {
            Some(entry) if entry.item_kind == local.item_kind() => ChangeType::Modified,
            _ => ChangeType::Added,
        };
        let mut sync_event = SyncEvent::new(
            SyncDirection::Up,
            local.item_kind(),
            change_type,
            remote,
            path.to_path_buf(),
        );
        sync_event.content_hash = local.content_hash().cloned();
        sync_event.rev = entry.map(|e| e.rev);
        sync_event.change_time = Some(Utc::now());
        if !local.is_folder() {
            sync_event.size = filesystem::stat(path).await?.map_or(0, |meta| meta.len());
        }
        Ok(Some(sync_event))
    }

    async fn classify_delete(&self, path: &Path) -> Result<Option<SyncEvent>> {
        let remote = self.to_remote(path)?;
        if filesystem::stat(path).await?.is_some() {
            debug!(path = %remote, "Deleted item is back, skipping deletion");
            return Ok(None);
        }
        let Some(entry) = self.index.get(remote.as_str()).await? else {
            return Ok(None);
        };

        let mut sync_event = SyncEvent::new(
            SyncDirection::Up,
            entry.item_kind,
            ChangeType::Removed,
            remote,
            path.to_path_buf(),
        );
        sync_event.rev = Some(entry.rev);
        sync_event.change_time = Some(Utc::now());
        Ok(Some(sync_event))
    }

    async fn classify_move(&self, src: &Path, dest: &Path, is_dir: bool) -> Result<Option<SyncEvent>> {
        let remote_from = self.to_remote(src)?;
        let Some(entry) = self.index.get(remote_from.as_str()).await? else {
            // Never synced, so only the destination matters.
            return self.classify_write(dest).await;
        };
        let remote_to = self.to_remote(dest)?;

        let kind = if is_dir { ItemKind::Folder } else { ItemKind::File };
        let mut sync_event = SyncEvent::new(SyncDirection::Up, kind, ChangeType::Moved, remote_to, dest.to_path_buf());
        sync_event.local_path_from = Some(src.to_path_buf());
        sync_event.remote_path_from = Some(remote_from);
        sync_event.rev = Some(entry.rev);
        sync_event.content_hash = entry.content_hash;
        sync_event.change_time = Some(Utc::now());
        Ok(Some(sync_event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use skysync_cache::{DatabasePool, SqliteHashCache, SqliteSyncIndex};
    use skysync_core::domain::{
        ContentHash, DeletedMetadata, FileMetadata, FolderMetadata, Revision,
    };
    use tempfile::TempDir;

    use crate::hasher::hash_file;

    struct Fixture {
        _pool: DatabasePool,
        dir: TempDir,
        index: Arc<SqliteSyncIndex>,
        classifier: Classifier,
    }

    async fn fixture() -> Fixture {
        let pool = DatabasePool::in_memory().await.unwrap();
        let index = Arc::new(SqliteSyncIndex::new(pool.pool().clone()));
        let hasher = LocalHasher::new(Arc::new(SqliteHashCache::new(pool.pool().clone())));
        let dir = TempDir::new().unwrap();
        let classifier = Classifier::new(dir.path(), index.clone(), hasher);
        Fixture {
            _pool: pool,
            dir,
            index,
            classifier,
        }
    }

    fn path(p: &str) -> RemotePath {
        RemotePath::new(p.to_string()).unwrap()
    }

    fn remote_file(p: &str, rev: &str, hash: ContentHash) -> Metadata {
        Metadata::File(FileMetadata {
            id: format!("id:{p}"),
            path_display: path(p),
            rev: Revision::new(rev.to_string()).unwrap(),
            content_hash: hash,
            size: 5,
            client_modified: Utc::now(),
            server_modified: Utc::now(),
            modified_by: Some("Robin".into()),
        })
    }

    fn some_hash() -> ContentHash {
        ContentHash::new("a".repeat(64)).unwrap()
    }

    #[tokio::test]
    async fn test_remote_unchanged_revision_is_skipped() {
        let fx = fixture().await;
        let md = remote_file("/a.txt", "r1", some_hash());
        let entry = IndexEntry::from_metadata(&md).unwrap();

        assert!(fx.classifier.classify_remote(&md, Some(&entry)).is_none());

        let newer = remote_file("/a.txt", "r2", some_hash());
        let event = fx.classifier.classify_remote(&newer, Some(&entry)).unwrap();
        assert_eq!(event.change_type, ChangeType::Modified);
        assert_eq!(event.direction, SyncDirection::Down);
        assert_eq!(event.change_user.as_deref(), Some("Robin"));
        assert_eq!(event.local_path, fx.dir.path().join("a.txt"));
    }

    #[tokio::test]
    async fn test_remote_added_and_deleted() {
        let fx = fixture().await;
        let folder = Metadata::Folder(FolderMetadata {
            id: "id:d".into(),
            path_display: path("/Docs"),
        });
        let event = fx.classifier.classify_remote(&folder, None).unwrap();
        assert_eq!(event.change_type, ChangeType::Added);
        assert!(event.is_folder());

        let deleted = Metadata::Deleted(DeletedMetadata {
            path_display: path("/Docs"),
        });
        assert!(fx.classifier.classify_remote(&deleted, None).is_none());

        let entry = IndexEntry::from_metadata(&folder).unwrap();
        let event = fx.classifier.classify_remote(&deleted, Some(&entry)).unwrap();
        assert_eq!(event.change_type, ChangeType::Removed);
        assert_eq!(event.item_kind, ItemKind::Folder);
    }

    #[tokio::test]
    async fn test_local_write_compares_fingerprint() {
        let fx = fixture().await;
        let file = fx.dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();

        let event = fx
            .classifier
            .classify_local(&FsEvent::created(&file, false))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.change_type, ChangeType::Added);
        assert_eq!(event.size, 5);
        assert!(event.rev.is_none());

        let hash = hash_file(&file).unwrap();
        fx.index
            .put(&IndexEntry::file(path("/a.txt"), "id:a", Revision::new("r1".into()).unwrap(), hash))
            .await
            .unwrap();
        assert!(fx
            .classifier
            .classify_local(&FsEvent::modified(&file, false))
            .await
            .unwrap()
            .is_none());

        std::fs::write(&file, b"hello, again").unwrap();
        let event = fx
            .classifier
            .classify_local(&FsEvent::modified(&file, false))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.change_type, ChangeType::Modified);
        assert_eq!(event.rev.as_ref().map(Revision::as_str), Some("r1"));
    }

    #[tokio::test]
    async fn test_local_delete_needs_index_entry() {
        let fx = fixture().await;
        let gone = fx.dir.path().join("gone.txt");
        assert!(fx
            .classifier
            .classify_local(&FsEvent::deleted(&gone, false))
            .await
            .unwrap()
            .is_none());

        fx.index
            .put(&IndexEntry::file(
                path("/gone.txt"),
                "id:g",
                Revision::new("r3".into()).unwrap(),
                some_hash(),
            ))
            .await
            .unwrap();
        let event = fx
            .classifier
            .classify_local(&FsEvent::deleted(&gone, false))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.change_type, ChangeType::Removed);
        assert_eq!(event.rev.as_ref().map(Revision::as_str), Some("r3"));
    }

    #[tokio::test]
    async fn test_move_of_unknown_item_is_an_addition() {
        let fx = fixture().await;
        let dest = fx.dir.path().join("b.txt");
        std::fs::write(&dest, b"content").unwrap();

        let event = fx
            .classifier
            .classify_local(&FsEvent::moved(fx.dir.path().join("a.txt"), &dest, false))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.change_type, ChangeType::Added);
        assert_eq!(event.remote_path, path("/b.txt"));
    }

    #[tokio::test]
    async fn test_case_only_rename_is_a_move() {
        let fx = fixture().await;
        fx.index
            .put(&IndexEntry::file(
                path("/notes.txt"),
                "id:n",
                Revision::new("r1".into()).unwrap(),
                some_hash(),
            ))
            .await
            .unwrap();
        let src = fx.dir.path().join("notes.txt");
        let dest = fx.dir.path().join("Notes.txt");
        std::fs::write(&dest, b"x").unwrap();

        let event = fx
            .classifier
            .classify_local(&FsEvent::moved(&src, &dest, false))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.change_type, ChangeType::Moved);
        assert_eq!(event.remote_path_from, Some(path("/notes.txt")));
        assert_eq!(event.remote_path.as_str(), "/Notes.txt");
    }
}
