//! Polling fallback for platforms without reliable recursive notifications
//!
//! [`DirectorySnapshot`] records every item below the sync root with its
//! file id (inode), type, modification time and size. Diffing two snapshots
//! yields events that, replayed against the older snapshot, produce the
//! newer one: deletions first, then moves (matched by file id, shallow
//! origins first), creations parents first, and modifications last. The
//! result goes through the coalescer like native events.
//!
//! [`PollingWatcher`] takes a snapshot every interval and sends the diff to
//! the same channel the native watcher uses.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coalesce::coalesce;
use crate::filesystem;
use crate::fs_event::FsEvent;
use crate::watcher::{WatchEvent, WatchFailure, WatchMessage};

/// State of one item in a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotEntry {
    /// Inode number where the platform has one
    pub file_id: Option<u64>,
    pub is_dir: bool,
    pub mtime_ns: i64,
    pub size: u64,
}

impl SnapshotEntry {
    fn is_same_item(&self, other: &SnapshotEntry) -> bool {
        self.is_dir == other.is_dir
            && match (self.file_id, other.file_id) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }

    fn content_changed(&self, other: &SnapshotEntry) -> bool {
        !self.is_dir && (self.mtime_ns != other.mtime_ns || self.size != other.size)
    }
}

/// Recursive listing of the sync root
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectorySnapshot {
    entries: HashMap<PathBuf, SnapshotEntry>,
}

impl DirectorySnapshot {
    /// Lists everything below `root`, skipping internal names and symlinks
    ///
    /// Blocks the calling thread.
    pub fn take(root: &Path) -> io::Result<Self> {
        let mut snapshot = Self::default();
        snapshot.scan(root, root)?;
        Ok(snapshot)
    }

    /// [`take`](Self::take) on the blocking thread pool
    pub async fn take_async(root: &Path) -> io::Result<Self> {
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || Self::take(&root))
            .await
            .map_err(io::Error::other)?
    }

    fn scan(&mut self, root: &Path, dir: &Path) -> io::Result<()> {
        let reader = match fs::read_dir(dir) {
            Ok(reader) => reader,
            // Vanished between listing its parent and reading it.
            Err(e) if e.kind() == io::ErrorKind::NotFound && dir != root => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in reader {
            let entry = entry?;
            let path = entry.path();
            if filesystem::is_internal_path(root, &path) {
                continue;
            }
            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if meta.file_type().is_symlink() {
                continue;
            }
            let is_dir = meta.is_dir();
            self.entries.insert(
                path.clone(),
                SnapshotEntry {
                    file_id: file_id(&meta),
                    is_dir,
                    mtime_ns: filesystem::mtime_ns(&meta),
                    size: if is_dir { 0 } else { meta.len() },
                },
            );
            if is_dir {
                self.scan(root, &path)?;
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, entry: SnapshotEntry) {
        self.entries.insert(path.into(), entry);
    }

    pub fn get(&self, path: &Path) -> Option<&SnapshotEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Events that turn `self` into `newer`, coalesced
    pub fn diff(&self, newer: &DirectorySnapshot) -> Vec<FsEvent> {
        let new_by_id: HashMap<u64, &Path> = newer
            .entries
            .iter()
            .filter_map(|(path, entry)| entry.file_id.map(|id| (id, path.as_path())))
            .collect();

        let mut deleted = Vec::new();
        let mut moved = Vec::new();
        let mut modified = Vec::new();
        let mut move_dests: HashSet<&Path> = HashSet::new();

        for (path, old) in &self.entries {
            if let Some(new) = newer.entries.get(path).filter(|new| old.is_same_item(new)) {
                if old.content_changed(new) {
                    modified.push(FsEvent::modified(path.clone(), false));
                }
                continue;
            }

            let dest = old
                .file_id
                .and_then(|id| new_by_id.get(&id).copied())
                .filter(|dest| {
                    newer.entries.get(*dest).is_some_and(|new| new.is_dir == old.is_dir)
                        && *dest != path.as_path()
                });
            match dest {
                Some(dest) => {
                    move_dests.insert(dest);
                    moved.push((path.as_path(), dest, old.is_dir));
                    if newer.entries.get(dest).is_some_and(|new| old.content_changed(new)) {
                        modified.push(FsEvent::modified(dest, false));
                    }
                }
                None => deleted.push(FsEvent::deleted(path.clone(), old.is_dir)),
            }
        }

        let mut created: Vec<FsEvent> = newer
            .entries
            .iter()
            .filter(|(path, new)| {
                !move_dests.contains(path.as_path())
                    && !self.entries.get(*path).is_some_and(|old| old.is_same_item(new))
            })
            .map(|(path, new)| FsEvent::created(path.clone(), new.is_dir))
            .collect();

        deleted.sort_by(|a, b| a.src_path.cmp(&b.src_path));
        moved.sort_by(|a, b| {
            let depth = |p: &Path| p.components().count();
            depth(a.0).cmp(&depth(b.0)).then_with(|| a.0.cmp(b.0))
        });
        created.sort_by(|a, b| {
            let depth = |p: &Path| p.components().count();
            depth(&a.src_path)
                .cmp(&depth(&b.src_path))
                .then_with(|| a.src_path.cmp(&b.src_path))
        });
        modified.sort_by(|a, b| a.src_path.cmp(&b.src_path));

        // Moves are reported with their original paths; rebase each source
        // through the moves of its ancestors applied before it.
        let mut applied: Vec<(PathBuf, PathBuf)> = Vec::new();
        let mut move_events = Vec::with_capacity(moved.len());
        for (src, dest, is_dir) in moved {
            let current = applied
                .iter()
                .rev()
                .find_map(|(from, to)| crate::coalesce::rebase(src, from, to))
                .unwrap_or_else(|| src.to_path_buf());
            if is_dir {
                applied.push((src.to_path_buf(), dest.to_path_buf()));
            }
            if current == dest {
                continue;
            }
            move_events.push(FsEvent::moved(current, dest, is_dir));
        }

        let mut events = deleted;
        events.extend(move_events);
        events.extend(created);
        events.extend(modified);
        debug!(count = events.len(), "Snapshot diff");
        coalesce(events)
    }
}

#[cfg(unix)]
fn file_id(meta: &fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn file_id(_meta: &fs::Metadata) -> Option<u64> {
    None
}

/// Watches the sync root by diffing periodic snapshots
pub struct PollingWatcher;

impl PollingWatcher {
    /// Starts polling `root` every `interval` until `cancel` fires
    pub fn spawn(
        root: PathBuf,
        interval: Duration,
        tx: mpsc::Sender<WatchMessage>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(root = %root.display(), interval_secs = interval.as_secs(), "Starting polling watcher");
            let mut previous = match DirectorySnapshot::take_async(&root).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(error = %e, "Initial snapshot failed");
                    let _ = tx.send(WatchMessage::Failed(WatchFailure::Other(e.to_string()))).await;
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let current = match DirectorySnapshot::take_async(&root).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!(error = %e, "Snapshot failed, retrying next interval");
                        continue;
                    }
                };
                for event in previous.diff(&current) {
                    if tx.send(WatchMessage::Event(WatchEvent::from(event))).await.is_err() {
                        debug!("Event receiver dropped, stopping polling watcher");
                        return;
                    }
                }
                previous = current;
            }
            debug!("Polling watcher stopped");
        })
    }
}
