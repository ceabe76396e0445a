//! Bidirectional synchronization engine
//!
//! The [`SyncEngine`] applies remote changes to the local folder and local
//! changes to the remote, keeping the sync index as the record of the last
//! state both sides agreed on.
//!
//! ## Sync Flow
//!
//! 1. **Remote changes** (download): list the change feed from the stored
//!    cursor, classify every entry against the index, check for conflicts,
//!    apply deletions, then folders by depth, then files in parallel
//! 2. **Local changes** (upload): take a coalesced batch of filesystem
//!    events, resolve selective sync conflicts, classify against the index,
//!    apply deletions and moves, then folders, then files in parallel
//! 3. **Bookkeeping**: the index entry of an item is written only after the
//!    item was transferred; the cursor only after the whole batch
//!
//! Both directions serialize on the sync lock, so the index never sees
//! interleaved writes from an upload and a download of the same item.
//!
//! ## Retry Logic
//!
//! Transient server errors are retried with exponential backoff starting at
//! 500 ms, up to `max_retries` times. Connection errors are not retried here;
//! they surface as [`EngineError::Connection`] and pause the workers.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use futures_util::{stream, StreamExt};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use skysync_conflict::{ConflictDetector, ConflictError, ConflictNamer, ConflictSuffix, DetectionResult};
use skysync_core::config::SyncConfig;
use skysync_core::domain::{
    ChangeType, Cursor, ExclusionTree, FileMetadata, IndexEntry, Metadata, RemotePath,
    SyncDirection, SyncEvent, SyncStatus,
};
use skysync_core::ports::{
    IHashCache, IRemoteClient, IStateStore, ISyncIndex, ProgressCallback, RemoteError, WriteMode,
};

use crate::activity::ActivityTracker;
use crate::classifier::Classifier;
use crate::errors::{EngineError, EngineResult, ItemResultExt, SyncError, SyncErrorKind};
use crate::event_handler::FsEventHandler;
use crate::filesystem;
use crate::fs_event::{FsEvent, FsEventKind};
use crate::hasher::LocalHasher;
use crate::state::SyncState;

// ============================================================================
// Retry logic
// ============================================================================

/// Base delay for exponential backoff
const BASE_DELAY: Duration = Duration::from_millis(500);

/// Executes a remote call, retrying transient server errors with
/// exponential backoff
async fn with_retry<F, Fut, T>(operation_name: &str, max_retries: u32, f: F) -> Result<T, RemoteError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt, "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(RemoteError::ServerError(reason)) if attempt < max_retries => {
                let delay = BASE_DELAY * 2u32.pow(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Removes `dir` unless it still holds entries
async fn remove_dir_if_empty(dir: &Path) {
    match tokio::fs::remove_dir(dir).await {
        Ok(()) => {}
        Err(e) if matches!(e.kind(), ErrorKind::DirectoryNotEmpty | ErrorKind::NotFound) => {}
        Err(e) => debug!(dir = %dir.display(), error = %e, "Folder not removed"),
    }
}

// ============================================================================
// FileStatus
// ============================================================================

/// Sync status of a single local path, as shown by file managers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Outside the sync root, internal, excluded, or syncing is stopped
    Unwatched,
    Uploading,
    Downloading,
    Error,
    Synced,
}

// ============================================================================
// SyncEngine
// ============================================================================

/// Orchestrates bidirectional synchronization for one sync root
pub struct SyncEngine {
    pub(crate) root: PathBuf,
    pub(crate) config: SyncConfig,
    pub(crate) remote: Arc<dyn IRemoteClient>,
    pub(crate) index: Arc<dyn ISyncIndex>,
    pub(crate) hasher: LocalHasher,
    pub(crate) state: SyncState,
    pub(crate) classifier: Classifier,
    pub(crate) events: Arc<FsEventHandler>,
    pub(crate) activity: Arc<ActivityTracker>,
    /// Serializes every mutation of the index and the local folder
    pub(crate) sync_lock: Arc<Mutex<()>>,
    pub(crate) excluded: RwLock<ExclusionTree>,
}

impl SyncEngine {
    /// Creates an engine and loads the persisted exclusions
    ///
    /// # Errors
    ///
    /// Fails if the state store cannot be read.
    pub async fn new(
        config: SyncConfig,
        remote: Arc<dyn IRemoteClient>,
        index: Arc<dyn ISyncIndex>,
        hash_cache: Arc<dyn IHashCache>,
        state_store: Arc<dyn IStateStore>,
    ) -> EngineResult<Self> {
        let root = config.root.clone();
        let hasher = LocalHasher::new(hash_cache);
        let state = SyncState::new(state_store);
        let excluded = state.excluded_items().await?;
        let classifier = Classifier::new(root.clone(), Arc::clone(&index), hasher.clone());
        let events = Arc::new(FsEventHandler::new(root.clone(), config.local_event_delay()));
        let activity = Arc::new(ActivityTracker::new(config.history_limit.max(1)));

        info!(root = %root.display(), excluded = excluded.paths().len(), "Sync engine created");
        Ok(Self {
            root,
            config,
            remote,
            index,
            hasher,
            state,
            classifier,
            events,
            activity,
            sync_lock: Arc::new(Mutex::new(())),
            excluded: RwLock::new(excluded),
        })
    }

    /// Shares a sync lock with other engines on the same configuration
    pub fn with_sync_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.sync_lock = lock;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn remote(&self) -> &Arc<dyn IRemoteClient> {
        &self.remote
    }

    pub fn fs_events(&self) -> &Arc<FsEventHandler> {
        &self.events
    }

    pub fn activity(&self) -> &Arc<ActivityTracker> {
        &self.activity
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub async fn excluded_items(&self) -> ExclusionTree {
        self.excluded.read().await.clone()
    }

    /// Reloads the exclusions from the state store
    pub async fn load_excluded_items(&self) -> EngineResult<()> {
        let tree = self.state.excluded_items().await?;
        *self.excluded.write().await = tree;
        Ok(())
    }

    /// Current sync status of a local path
    pub async fn file_status(&self, local_path: &Path) -> EngineResult<FileStatus> {
        if !local_path.starts_with(&self.root) || filesystem::is_internal_path(&self.root, local_path) {
            return Ok(FileStatus::Unwatched);
        }
        if self.activity.has_sync_error(local_path) {
            return Ok(FileStatus::Error);
        }
        match self.activity.active_direction(local_path) {
            Some(SyncDirection::Up) => return Ok(FileStatus::Uploading),
            Some(SyncDirection::Down) => return Ok(FileStatus::Downloading),
            None => {}
        }
        let Ok(remote_path) = self.classifier.to_remote(local_path) else {
            return Ok(FileStatus::Unwatched);
        };
        if self.excluded.read().await.is_excluded(&remote_path.lower()) {
            return Ok(FileStatus::Unwatched);
        }
        if self.events.is_pending(local_path) {
            return Ok(FileStatus::Uploading);
        }
        if self.index.get(remote_path.as_str()).await?.is_some() {
            Ok(FileStatus::Synced)
        } else {
            Ok(FileStatus::Unwatched)
        }
    }

    // ========================================================================
    // Remote listings
    // ========================================================================

    /// Lists `path` completely, following pagination
    ///
    /// Returns the entries and the cursor for changes after the listing.
    pub(crate) async fn list_all(&self, path: &RemotePath, recursive: bool) -> EngineResult<(Vec<Metadata>, Cursor)> {
        let retries = self.config.max_retries;
        let mut page = with_retry("list_folder", retries, || self.remote.list_folder(path, recursive)).await?;
        let mut entries = std::mem::take(&mut page.entries);
        while page.has_more {
            let next = page.cursor.clone();
            page = with_retry("list_folder_continue", retries, || {
                self.remote.list_remote_changes(&next)
            })
            .await?;
            entries.append(&mut page.entries);
        }
        Ok((entries, page.cursor))
    }

    async fn fetch_changes(&self, cursor: &Cursor) -> Result<(Vec<Metadata>, Cursor), RemoteError> {
        let retries = self.config.max_retries;
        let mut page = with_retry("list_remote_changes", retries, || {
            self.remote.list_remote_changes(cursor)
        })
        .await?;
        let mut entries = std::mem::take(&mut page.entries);
        while page.has_more {
            let next = page.cursor.clone();
            page = with_retry("list_remote_changes", retries, || {
                self.remote.list_remote_changes(&next)
            })
            .await?;
            entries.append(&mut page.entries);
        }
        Ok((entries, page.cursor))
    }

    /// Every remote change since `cursor`, with the cursor after them
    ///
    /// An invalidated cursor is retried a bounded number of times before the
    /// failure becomes fatal.
    pub async fn list_remote_changes(&self, cursor: &Cursor) -> EngineResult<(Vec<Metadata>, Cursor)> {
        let mut attempt = 0;
        loop {
            match self.fetch_changes(cursor).await {
                Ok(changes) => return Ok(changes),
                Err(RemoteError::CursorInvalidated) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(attempt, "Remote cursor invalidated, retrying");
                    tokio::time::sleep(BASE_DELAY * 2u32.pow(attempt)).await;
                }
                Err(err @ (RemoteError::CursorInvalidated | RemoteError::CursorReset)) => {
                    error!(error = %err, "Remote cursor unusable, a full reindex is required");
                    return Err(err.into());
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Long-polls for remote changes after the stored cursor
    ///
    /// Sleeps for the backoff the remote asks for before returning. Returns
    /// true if a download cycle should run.
    pub async fn wait_for_remote_changes(&self, timeout: Duration) -> EngineResult<bool> {
        let Some(cursor) = self.state.cursor().await? else {
            return Ok(true);
        };
        match self.remote.wait_for_remote_changes(&cursor, timeout).await {
            Ok(result) => {
                if let Some(backoff) = result.backoff {
                    debug!(backoff_secs = backoff.as_secs(), "Remote asked for long-poll backoff");
                    tokio::time::sleep(backoff).await;
                }
                Ok(result.changes)
            }
            // Let the download cycle deal with the cursor.
            Err(RemoteError::CursorInvalidated) => Ok(true),
            Err(err) => Err(err.into()),
        }
    }

    // ========================================================================
    // Download
    // ========================================================================

    /// Downloads every remote change since the stored cursor
    ///
    /// Without a cursor a full reconciliation runs instead.
    #[instrument(skip(self))]
    pub async fn download_sync_cycle(&self) -> EngineResult<usize> {
        let Some(cursor) = self.state.cursor().await? else {
            return self.full_sync().await;
        };
        let (changes, cursor) = self.list_remote_changes(&cursor).await?;
        if !changes.is_empty() {
            info!(count = changes.len(), "Fetched remote changes");
        }
        let synced = self.apply_remote_changes(changes).await?;
        self.state.set_cursor(Some(&cursor)).await?;
        Ok(synced)
    }

    /// Applies remote entries locally and returns how many were transferred
    ///
    /// Per-item failures are recorded as sync errors; fatal and connection
    /// errors are returned after the batch.
    pub async fn apply_remote_changes(&self, changes: Vec<Metadata>) -> EngineResult<usize> {
        let changes = self.prepare_remote_changes(changes).await?;
        if changes.is_empty() {
            return Ok(0);
        }
        let _lock = self.sync_lock.lock().await;

        let (mut sequential, files): (Vec<_>, Vec<_>) = changes
            .into_iter()
            .partition(|md| !matches!(md, Metadata::File(_)));
        // Deletions first, then folders, both parents before children.
        sequential.sort_by_key(|md| (!md.is_deleted(), md.path_display().depth()));

        let mut synced = 0;
        let mut first_error = None;
        for md in sequential {
            match self.apply_remote_logged(md).await {
                Ok(true) => synced += 1,
                Ok(false) => {}
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        let results: Vec<EngineResult<bool>> = stream::iter(files)
            .map(|md| self.apply_remote_logged(md))
            .buffer_unordered(self.config.max_parallel_downloads.max(1))
            .collect()
            .await;
        for result in results {
            match result {
                Ok(true) => synced += 1,
                Ok(false) => {}
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(synced),
        }
    }

    /// Drops root, internal and excluded entries and keeps the last entry
    /// per path
    async fn prepare_remote_changes(&self, changes: Vec<Metadata>) -> EngineResult<Vec<Metadata>> {
        let mut excluded = self.excluded.write().await;
        let mut tree_changed = false;
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut kept: Vec<Metadata> = Vec::with_capacity(changes.len());

        for md in changes {
            let path = md.path_display();
            if path.is_root() || path.file_name().map_or(false, filesystem::is_internal_name) {
                continue;
            }
            let key = md.path_lower();
            let was_excluded = excluded.is_excluded(&key);
            if md.is_deleted() {
                tree_changed |= excluded.remove_deleted(&key);
            }
            if was_excluded {
                debug!(path = %path, "Skipping excluded remote item");
                continue;
            }
            match positions.get(&key) {
                Some(&pos) => kept[pos] = md,
                None => {
                    positions.insert(key, kept.len());
                    kept.push(md);
                }
            }
        }

        if tree_changed {
            self.state.set_excluded_items(&excluded).await?;
        }
        Ok(kept)
    }

    async fn apply_remote_logged(&self, md: Metadata) -> EngineResult<bool> {
        let remote_path = md.path_display().clone();
        let local_path = self.classifier.to_local(&remote_path);
        match self.apply_remote_item(md).await.for_item(&local_path, &remote_path) {
            Err(EngineError::Sync(err)) => {
                if let Err(e) = self.state.add_failed_download(remote_path.as_str()).await {
                    warn!(error = %e, "Failed to record failed download");
                }
                self.activity.add_sync_error(err);
                Ok(false)
            }
            other => other,
        }
    }

    /// Applies one remote entry; returns true if anything was transferred
    #[instrument(skip_all, fields(path = %md.path_display()))]
    pub(crate) async fn apply_remote_item(&self, md: Metadata) -> Result<bool> {
        let remote_path = md.path_display().clone();
        let entry = self.index.get(remote_path.as_str()).await?;
        let local_path = self.apply_case_change(&md, entry.as_ref()).await?;

        let Some(mut sync_event) = self.classifier.classify_remote(&md, entry.as_ref()) else {
            if md.is_deleted() {
                // Gone on both sides; earlier failures no longer apply.
                self.activity.clear_sync_errors(&local_path);
                self.state.remove_failed_download(remote_path.as_str()).await?;
                self.state.remove_pending_download(remote_path.as_str()).await?;
            }
            return Ok(false);
        };
        sync_event.local_path = local_path.clone();
        let id = self.activity.queue(sync_event);
        self.activity.start(id);

        let result = self.download_item(id, &md, entry.as_ref(), &local_path).await;
        self.activity
            .finish(id, result.as_ref().map_or(SyncStatus::Failed, |status| *status));
        let status = result?;

        self.activity.clear_sync_errors(&local_path);
        self.state.remove_failed_download(remote_path.as_str()).await?;
        Ok(status == SyncStatus::Done)
    }

    /// Renames the local item when only the casing changed remotely, and
    /// returns the local path the entry maps to
    async fn apply_case_change(&self, md: &Metadata, entry: Option<&IndexEntry>) -> Result<PathBuf> {
        let remote_path = md.path_display();
        let wanted = self.classifier.to_local(remote_path);
        if md.is_deleted() {
            return Ok(filesystem::find_case_insensitive(&wanted).await?.unwrap_or(wanted));
        }
        let Some(entry) = entry else {
            return Ok(wanted);
        };
        if entry.path_display.as_str() == remote_path.as_str() {
            return Ok(wanted);
        }

        if let Some(existing) = filesystem::find_case_insensitive(&wanted).await? {
            if existing != wanted {
                let _guard = self.events.ignore([existing.clone(), wanted.clone()], true);
                filesystem::move_item(&existing, &wanted).await?;
                info!(
                    from = %existing.display(),
                    to = %wanted.display(),
                    "Applied remote case change"
                );
            }
        }
        self.move_index_entries(&entry.path_display, remote_path).await?;
        Ok(wanted)
    }

    async fn download_item(
        &self,
        id: Uuid,
        md: &Metadata,
        entry: Option<&IndexEntry>,
        local_path: &Path,
    ) -> Result<SyncStatus> {
        let local = self.hasher.get_local_hash(local_path).await?;
        match ConflictDetector::check_remote_change(md, entry, &local) {
            DetectionResult::Identical => {
                self.record_remote(md).await?;
                return Ok(SyncStatus::Skipped);
            }
            DetectionResult::Conflicted if md.is_deleted() => {
                info!("Remote deletion of a locally changed item, keeping local copy");
                self.index.remove(md.path_display().as_str()).await?;
                self.events
                    .queue_local(FsEvent::created(local_path, local.is_folder()));
                return Ok(SyncStatus::Skipped);
            }
            DetectionResult::Conflicted => {
                if local.is_folder() {
                    self.index.remove(md.path_display().as_str()).await?;
                }
                self.move_to_conflicting_copy(local_path, local.is_folder())
                    .await?;
            }
            DetectionResult::NoConflict => {}
        }

        match md {
            Metadata::File(file) => self.download_file(id, file, local_path).await?,
            Metadata::Folder(folder) => {
                {
                    let _guard = self.events.ignore([local_path.to_path_buf()], false);
                    filesystem::ensure_dir(local_path).await?;
                }
                self.index
                    .put(&IndexEntry::folder(folder.path_display.clone(), folder.id.clone()))
                    .await?;
                debug!("Created local folder");
            }
            Metadata::Deleted(deleted) => {
                self.remove_local_tree(&deleted.path_display, local_path)
                    .await?
            }
        }
        Ok(SyncStatus::Done)
    }

    async fn download_file(&self, id: Uuid, file: &FileMetadata, local_path: &Path) -> Result<()> {
        let remote_path = &file.path_display;
        let staging = filesystem::new_staging_path(&self.root).await?;
        self.state.add_pending_download(remote_path.as_str()).await?;

        let progress = self.progress_callback(id);
        let downloaded = with_retry("download", self.config.max_retries, || {
            self.remote
                .download(remote_path, &staging, Some(Arc::clone(&progress)))
        })
        .await;
        let downloaded = match downloaded {
            Ok(md) => md,
            Err(err) => {
                if let Err(e) = filesystem::remove_item(&staging).await {
                    debug!(error = %e, "Failed to clean up staging file");
                }
                return Err(err.into());
            }
        };

        {
            let _guard = self.events.ignore([local_path.to_path_buf()], false);
            filesystem::move_item(&staging, local_path).await?;
        }
        self.hasher
            .remember(local_path, &downloaded.content_hash)
            .await?;
        self.index
            .put(&IndexEntry::file(
                downloaded.path_display.clone(),
                downloaded.id.clone(),
                downloaded.rev.clone(),
                downloaded.content_hash.clone(),
            ))
            .await?;
        self.state.remove_pending_download(remote_path.as_str()).await?;
        info!(rev = %downloaded.rev, size = downloaded.size, "Downloaded file");
        Ok(())
    }

    /// Deletes a local item after a remote deletion
    ///
    /// Inside a folder, files changed since the last sync are kept and
    /// queued for upload; everything else goes.
    async fn remove_local_tree(&self, remote_path: &RemotePath, local_path: &Path) -> Result<()> {
        let Some(meta) = filesystem::stat(local_path).await? else {
            self.index.remove(remote_path.as_str()).await?;
            return Ok(());
        };

        let _guard = self.events.ignore([local_path.to_path_buf()], true);
        if !meta.is_dir() {
            filesystem::remove_item(local_path).await?;
            self.hasher.forget(local_path).await?;
            self.index.remove(remote_path.as_str()).await?;
            info!("Deleted local file");
            return Ok(());
        }

        let items = filesystem::walk(&self.root, local_path).await?;
        let mut changed = Vec::new();
        let mut unchanged = Vec::new();
        for item in items.iter().filter(|item| !item.is_dir) {
            let item_remote = self.classifier.to_remote(&item.path)?;
            let indexed = self.index.get(item_remote.as_str()).await?;
            let current = self.hasher.get_local_hash(&item.path).await?;
            if ConflictDetector::has_local_changes(indexed.as_ref(), &current) {
                changed.push(item.path.clone());
            } else {
                unchanged.push(item.path.clone());
            }
        }

        if changed.is_empty() {
            filesystem::remove_item(local_path).await?;
        } else {
            for path in &unchanged {
                filesystem::remove_item(path).await?;
                self.hasher.forget(path).await?;
            }
            // Deepest first; folders still holding kept files stay.
            let dirs = items.iter().rev().filter(|item| item.is_dir).map(|item| item.path.as_path());
            for dir in dirs.chain(std::iter::once(local_path)) {
                remove_dir_if_empty(dir).await;
            }
            for path in changed.iter() {
                self.events.queue_local(FsEvent::created(path.clone(), false));
            }
            info!(kept = changed.len(), "Kept locally changed files of a remotely deleted folder");
        }
        self.index.remove(remote_path.as_str()).await?;
        info!("Deleted local folder");
        Ok(())
    }

    /// Records `md` as the synced state without transferring anything
    async fn record_remote(&self, md: &Metadata) -> Result<()> {
        match IndexEntry::from_metadata(md) {
            Some(entry) => self.index.put(&entry).await,
            None => self.index.remove(md.path_display().as_str()).await.map(|_| ()),
        }
    }

    /// Moves a local item out of the way to a conflicting copy name and
    /// queues the copy for upload
    async fn move_to_conflicting_copy(&self, local_path: &Path, is_dir: bool) -> Result<PathBuf> {
        let copy = self
            .unique_sibling(local_path, is_dir, ConflictSuffix::ConflictingCopy)
            .await?;
        {
            let _guard = self
                .events
                .ignore([local_path.to_path_buf(), copy.clone()], true);
            filesystem::move_item(local_path, &copy).await?;
        }
        self.hasher.forget(local_path).await?;
        info!(
            path = %local_path.display(),
            copy = %copy.display(),
            "Created conflicting copy"
        );
        self.events.queue_local(FsEvent::created(copy.clone(), is_dir));
        Ok(copy)
    }

    /// Free sibling name for `path`, checked against the local folder and
    /// against excluded remote paths
    pub(crate) async fn unique_sibling(&self, path: &Path, is_dir: bool, suffix: ConflictSuffix) -> Result<PathBuf> {
        let (Some(parent), Some(name)) = (path.parent(), path.file_name().and_then(|n| n.to_str())) else {
            return Err(ConflictError::NoFileName(path.display().to_string()).into());
        };
        let taken: HashSet<String> = filesystem::read_children(parent)
            .await?
            .iter()
            .filter_map(|child| child.file_name())
            .map(|child| child.to_string_lossy().to_lowercase())
            .collect();
        let remote_parent = self.classifier.to_remote(parent)?;
        let excluded = self.excluded.read().await;

        let unique = ConflictNamer::generate_unique(name, is_dir, suffix, |candidate| {
            taken.contains(&candidate.to_lowercase())
                || remote_parent
                    .join(candidate)
                    .map_or(false, |p| excluded.is_excluded(&p.lower()))
        })?;
        Ok(parent.join(unique))
    }

    /// Re-keys the index entries at and below `from` to lie below `to`
    pub(crate) async fn move_index_entries(&self, from: &RemotePath, to: &RemotePath) -> Result<()> {
        let mut moved = Vec::new();
        if let Some(entry) = self.index.get(from.as_str()).await? {
            moved.push(entry);
        }
        moved.extend(self.index.descendants(from.as_str()).await?);
        if from.lower() != to.lower() {
            self.index.remove(to.as_str()).await?;
        }
        if moved.is_empty() {
            return Ok(());
        }

        self.index.remove(from.as_str()).await?;
        let rebased: Vec<IndexEntry> = moved
            .into_iter()
            .filter_map(|mut entry| {
                let path = entry.path_display.replace_prefix(from, to)?;
                entry.path_lower = path.lower();
                entry.path_display = path;
                entry.last_sync = Utc::now();
                Some(entry)
            })
            .collect();
        self.index.put_many(&rebased).await
    }

    fn progress_callback(&self, id: Uuid) -> ProgressCallback {
        let activity = Arc::clone(&self.activity);
        Arc::new(move |completed, total| activity.progress(id, completed, total))
    }

    // ========================================================================
    // Upload
    // ========================================================================

    /// Applies a batch of coalesced local events to the remote
    ///
    /// Returns how many events were transferred.
    #[instrument(skip_all, fields(count = events.len()))]
    pub async fn upload_local_changes(&self, events: Vec<FsEvent>) -> EngineResult<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let _lock = self.sync_lock.lock().await;
        let events = self.resolve_selective_sync_conflicts(events).await?;
        let events = self.expand_created_folders(events).await?;

        let (sequential, files): (Vec<_>, Vec<_>) = events
            .into_iter()
            .partition(|event| event.is_directory || event.is_deleted() || event.is_moved());
        debug!(sequential = sequential.len(), files = files.len(), "Uploading local changes");

        let mut synced = 0;
        let mut first_error = None;
        for event in sequential {
            match self.upload_or_requeue(event).await {
                Ok(true) => synced += 1,
                Ok(false) => {}
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        let results: Vec<EngineResult<bool>> = stream::iter(files)
            .map(|event| self.upload_or_requeue(event))
            .buffer_unordered(self.config.max_parallel_uploads.max(1))
            .collect()
            .await;
        for result in results {
            match result {
                Ok(true) => synced += 1,
                Ok(false) => {}
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(synced),
        }
    }

    /// Records a per-item error and swallows it; other errors pass through
    fn absorb(&self, err: EngineError) -> EngineResult<()> {
        match err {
            EngineError::Sync(err) => {
                self.activity.add_sync_error(err);
                Ok(())
            }
            other => Err(other),
        }
    }

    /// Renames local items created inside excluded folders
    ///
    /// The renamed item is uploaded under its new name; the excluded remote
    /// item stays untouched.
    async fn resolve_selective_sync_conflicts(&self, events: Vec<FsEvent>) -> EngineResult<Vec<FsEvent>> {
        let mut resolved = Vec::with_capacity(events.len());
        for event in events {
            if event.is_deleted() {
                resolved.push(event);
                continue;
            }
            let target = event.path().to_path_buf();
            let Ok(remote_path) = self.classifier.to_remote(&target) else {
                resolved.push(event);
                continue;
            };
            if !self.excluded.read().await.is_excluded(&remote_path.lower()) {
                resolved.push(event);
                continue;
            }

            match self
                .rename_selective_sync_conflict(&target, event.is_directory)
                .await
                .for_item(&target, &remote_path)
            {
                Ok(Some(renamed)) => {
                    if event.is_moved() {
                        resolved.push(FsEvent::deleted(event.src_path.clone(), event.is_directory));
                    }
                    resolved.push(FsEvent::created(renamed, event.is_directory));
                }
                Ok(None) => {}
                Err(err) => self.absorb(err)?,
            }
        }
        Ok(resolved)
    }

    async fn rename_selective_sync_conflict(&self, target: &Path, is_dir: bool) -> Result<Option<PathBuf>> {
        if filesystem::stat(target).await?.is_none() {
            return Ok(None);
        }
        let renamed = self
            .unique_sibling(target, is_dir, ConflictSuffix::SelectiveSyncConflict)
            .await?;
        {
            let _guard = self
                .events
                .ignore([target.to_path_buf(), renamed.clone()], true);
            filesystem::move_item(target, &renamed).await?;
        }
        info!(
            path = %target.display(),
            renamed = %renamed.display(),
            "Selective sync conflict, renamed local item"
        );
        Ok(Some(renamed))
    }

    /// Adds creation events for the contents of new folders
    ///
    /// A folder moved from an unknown location counts as new.
    async fn expand_created_folders(&self, events: Vec<FsEvent>) -> EngineResult<Vec<FsEvent>> {
        let mut expanded = Vec::with_capacity(events.len());
        for event in events {
            let event = match event.kind {
                FsEventKind::Moved if event.is_directory => {
                    let known = match self.classifier.to_remote(&event.src_path) {
                        Ok(src) => self.index.get(src.as_str()).await?.is_some(),
                        Err(_) => false,
                    };
                    if known {
                        expanded.push(event);
                        continue;
                    }
                    FsEvent::created(event.path().to_path_buf(), true)
                }
                FsEventKind::Created if event.is_directory => event,
                _ => {
                    expanded.push(event);
                    continue;
                }
            };

            let folder = event.src_path.clone();
            expanded.push(event);
            match filesystem::walk(&self.root, &folder).await {
                Ok(items) => expanded.extend(
                    items
                        .into_iter()
                        .map(|item| FsEvent::created(item.path, item.is_dir)),
                ),
                Err(e) => {
                    let err = EngineError::from_anyhow(e, Some(folder.as_path()), None);
                    self.absorb(err)?;
                }
            }
        }
        Ok(expanded)
    }

    /// Uploads one event; after a connection error the event is queued
    /// again for the batch that runs once the remote is reachable
    async fn upload_or_requeue(&self, event: FsEvent) -> EngineResult<bool> {
        let result = self.upload_logged(event.clone()).await;
        if matches!(&result, Err(err) if err.is_connection()) {
            self.events.queue_local(event);
        }
        result
    }

    async fn upload_logged(&self, event: FsEvent) -> EngineResult<bool> {
        let local_path = event.path().to_path_buf();
        let remote_path = match self.classifier.to_remote(&local_path) {
            Ok(remote_path) => remote_path,
            Err(e) => {
                if event.is_deleted() && matches!(filesystem::stat(&local_path).await, Ok(None)) {
                    self.activity.clear_sync_errors(&local_path);
                    return Ok(false);
                }
                let err = SyncError::new(SyncErrorKind::PathInvalid, e.to_string()).with_local(&local_path);
                return self.absorb(err.into()).map(|()| false);
            }
        };
        match self.upload_event(&event).await.for_item(&local_path, &remote_path) {
            Err(err) => self.absorb(err).map(|()| false),
            ok => ok,
        }
    }

    #[instrument(skip_all, fields(path = %event.path().display()))]
    async fn upload_event(&self, event: &FsEvent) -> Result<bool> {
        let Some(sync_event) = self.classifier.classify_local(event).await? else {
            if (event.is_deleted() || event.is_moved()) && filesystem::stat(&event.src_path).await?.is_none() {
                self.activity.clear_sync_errors(&event.src_path);
            }
            return Ok(false);
        };
        let id = self.activity.queue(sync_event.clone());
        self.activity.start(id);

        let result = match sync_event.change_type {
            ChangeType::Added | ChangeType::Modified if sync_event.is_folder() => {
                self.create_remote_folder(&sync_event).await
            }
            ChangeType::Added | ChangeType::Modified => self.upload_file(id, &sync_event).await,
            ChangeType::Removed => self.delete_remote(&sync_event).await,
            ChangeType::Moved => self.move_remote(&sync_event).await,
        };
        let status = if result.is_ok() {
            SyncStatus::Done
        } else {
            SyncStatus::Failed
        };
        self.activity.finish(id, status);
        result?;

        self.activity.clear_sync_errors(&sync_event.local_path);
        Ok(true)
    }

    async fn upload_file(&self, id: Uuid, event: &SyncEvent) -> Result<()> {
        let local_path = &event.local_path;
        let remote_path = &event.remote_path;
        let mode = match &event.rev {
            Some(rev) if !rev.is_folder() => WriteMode::Update(rev.clone()),
            _ => WriteMode::Add,
        };

        match self.upload_with_mode(id, local_path, remote_path, mode).await {
            Ok(md) => self.record_upload(&md).await,
            Err(RemoteError::Conflict(reason)) => {
                debug!(reason = %reason, "Upload rejected, checking remote item");
                match self.remote.get_metadata(remote_path).await? {
                    Some(Metadata::File(existing))
                        if Some(&existing.content_hash) == event.content_hash.as_ref() =>
                    {
                        debug!("Remote already has identical content");
                        self.record_upload(&existing).await
                    }
                    None => {
                        // Deleted remotely in the meantime: upload as new.
                        match self.upload_with_mode(id, local_path, remote_path, WriteMode::Add).await {
                            Ok(md) => self.record_upload(&md).await,
                            Err(RemoteError::Conflict(_)) => self.upload_conflicting_copy(id, event).await,
                            Err(err) => Err(err.into()),
                        }
                    }
                    Some(_) => self.upload_conflicting_copy(id, event).await,
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn upload_with_mode(
        &self,
        id: Uuid,
        local_path: &Path,
        remote_path: &RemotePath,
        mode: WriteMode,
    ) -> Result<FileMetadata, RemoteError> {
        let progress = self.progress_callback(id);
        with_retry("upload", self.config.max_retries, || {
            self.remote.upload(
                local_path,
                remote_path,
                mode.clone(),
                Some(Arc::clone(&progress)),
            )
        })
        .await
    }

    async fn record_upload(&self, md: &FileMetadata) -> Result<()> {
        self.index
            .put(&IndexEntry::file(
                md.path_display.clone(),
                md.id.clone(),
                md.rev.clone(),
                md.content_hash.clone(),
            ))
            .await?;
        info!(path = %md.path_display, rev = %md.rev, size = md.size, "Uploaded file");
        Ok(())
    }

    /// Uploads the local file next to the diverged remote item, then renames
    /// the local file to match and fetches the remote version
    ///
    /// The remote rejects an `Add` to a taken name, so a candidate that
    /// turns out to be taken is skipped and the next one tried.
    async fn upload_conflicting_copy(&self, id: Uuid, event: &SyncEvent) -> Result<()> {
        let local_path = &event.local_path;
        let remote_path = &event.remote_path;
        let Some(name) = remote_path.file_name() else {
            return Err(ConflictError::NoFileName(remote_path.to_string()).into());
        };
        let parent = remote_path.parent().unwrap_or_else(RemotePath::root);

        let (siblings, _) = self.list_all(&parent, false).await?;
        let mut taken: HashSet<String> = siblings
            .iter()
            .filter(|md| !md.is_deleted())
            .filter_map(|md| md.path_display().file_name().map(str::to_lowercase))
            .collect();
        if let Some(local_parent) = local_path.parent() {
            taken.extend(
                filesystem::read_children(local_parent)
                    .await?
                    .iter()
                    .filter_map(|child| child.file_name())
                    .map(|child| child.to_string_lossy().to_lowercase()),
            );
        }

        for _ in 0..=self.config.max_retries {
            let candidate = ConflictNamer::generate_unique(name, false, ConflictSuffix::ConflictingCopy, |c| {
                taken.contains(&c.to_lowercase())
            })?;
            let copy_remote = remote_path.with_file_name(&candidate)?;

            match self
                .upload_with_mode(id, local_path, &copy_remote, WriteMode::Add)
                .await
            {
                Ok(md) => {
                    let copy_local = local_path.with_file_name(&candidate);
                    {
                        let _guard = self
                            .events
                            .ignore([local_path.clone(), copy_local.clone()], false);
                        filesystem::move_item(local_path, &copy_local).await?;
                    }
                    self.hasher.forget(local_path).await?;
                    self.record_upload(&md).await?;
                    info!(copy = %copy_remote, "Uploaded conflicting copy");

                    if let Some(original) = self.remote.get_metadata(remote_path).await? {
                        self.apply_remote_item(original).await?;
                    }
                    return Ok(());
                }
                Err(RemoteError::Conflict(_)) => {
                    warn!(candidate = %candidate, "Conflict name taken remotely, trying the next one");
                    taken.insert(candidate.to_lowercase());
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(SyncError::new(
            SyncErrorKind::Conflict,
            format!("No free conflicting copy name for {remote_path}"),
        )
        .into())
    }

    async fn create_remote_folder(&self, event: &SyncEvent) -> Result<()> {
        let remote_path = &event.remote_path;
        match with_retry("make_dir", self.config.max_retries, || {
            self.remote.make_dir(remote_path)
        })
        .await
        {
            Ok(folder) => {
                self.index
                    .put(&IndexEntry::folder(folder.path_display.clone(), folder.id))
                    .await?;
                info!(path = %folder.path_display, "Created remote folder");
                Ok(())
            }
            Err(RemoteError::Conflict(_)) => match self.remote.get_metadata(remote_path).await? {
                Some(Metadata::Folder(folder)) => {
                    debug!("Remote folder already exists");
                    self.index
                        .put(&IndexEntry::folder(folder.path_display, folder.id))
                        .await
                }
                Some(remote_item) => {
                    // A file took the name remotely; keep both.
                    self.move_to_conflicting_copy(&event.local_path, true)
                        .await?;
                    self.apply_remote_item(remote_item).await.map(|_| ())
                }
                None => Err(RemoteError::Conflict(format!("Cannot create folder {remote_path}")).into()),
            },
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_remote(&self, event: &SyncEvent) -> Result<()> {
        let remote_path = &event.remote_path;
        let expected_rev = event.rev.as_ref().filter(|rev| !rev.is_folder());

        match with_retry("remove", self.config.max_retries, || {
            self.remote.remove(remote_path, expected_rev)
        })
        .await
        {
            Ok(_) | Err(RemoteError::NotFound(_)) => {
                self.index.remove(remote_path.as_str()).await?;
                self.hasher.forget(&event.local_path).await?;
                info!(path = %remote_path, "Deleted remote item");
                Ok(())
            }
            Err(RemoteError::Conflict(_)) => {
                info!(path = %remote_path, "Remote item changed since last sync, restoring it");
                self.index.remove(remote_path.as_str()).await?;
                if let Some(md) = self.remote.get_metadata(remote_path).await? {
                    self.apply_remote_item(md).await?;
                }
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn move_remote(&self, event: &SyncEvent) -> Result<()> {
        let (Some(from), Some(local_from)) = (&event.remote_path_from, &event.local_path_from) else {
            bail!("Move event without origin: {}", event.remote_path);
        };
        let to = &event.remote_path;

        match with_retry("move", self.config.max_retries, || self.remote.move_item(from, to)).await {
            Ok(md) => {
                self.move_index_entries(from, md.path_display()).await?;
                if let Some(entry) = IndexEntry::from_metadata(&md) {
                    self.index.put(&entry).await?;
                }
                self.hasher.forget(local_from).await?;
                info!(from = %from, to = %md.path_display(), "Moved remote item");
                Ok(())
            }
            Err(RemoteError::NotFound(_)) => {
                debug!(from = %from, "Move source gone remotely, uploading as new");
                self.index.remove(from.as_str()).await?;
                self.events
                    .queue_local(FsEvent::created(event.local_path.clone(), event.is_folder()));
                Ok(())
            }
            Err(RemoteError::Conflict(_)) => {
                debug!(to = %to, "Move target taken remotely, uploading as new");
                let expected_rev = event.rev.as_ref().filter(|rev| !rev.is_folder());
                match self.remote.remove(from, expected_rev).await {
                    Ok(_) | Err(RemoteError::NotFound(_)) | Err(RemoteError::Conflict(_)) => {}
                    Err(err) => return Err(err.into()),
                }
                self.index.remove(from.as_str()).await?;
                self.events
                    .queue_local(FsEvent::created(event.local_path.clone(), event.is_folder()));
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}
