//! Local filesystem change events
//!
//! [`FsEvent`] is the single event shape produced by the native watcher,
//! the polling fallback and the startup scan, and consumed by the coalescer
//! and the classifier.

use std::path::{Path, PathBuf};

/// Kind of local change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsEventKind {
    Created,
    Deleted,
    Modified,
    Moved,
}

/// A change to one local path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FsEvent {
    pub kind: FsEventKind,
    /// Path of the item, or the origin of a move
    pub src_path: PathBuf,
    /// Destination of a move
    pub dest_path: Option<PathBuf>,
    pub is_directory: bool,
}

impl FsEvent {
    pub fn created(path: impl Into<PathBuf>, is_directory: bool) -> Self {
        Self {
            kind: FsEventKind::Created,
            src_path: path.into(),
            dest_path: None,
            is_directory,
        }
    }

    pub fn deleted(path: impl Into<PathBuf>, is_directory: bool) -> Self {
        Self {
            kind: FsEventKind::Deleted,
            src_path: path.into(),
            dest_path: None,
            is_directory,
        }
    }

    pub fn modified(path: impl Into<PathBuf>, is_directory: bool) -> Self {
        Self {
            kind: FsEventKind::Modified,
            src_path: path.into(),
            dest_path: None,
            is_directory,
        }
    }

    pub fn moved(src: impl Into<PathBuf>, dest: impl Into<PathBuf>, is_directory: bool) -> Self {
        Self {
            kind: FsEventKind::Moved,
            src_path: src.into(),
            dest_path: Some(dest.into()),
            is_directory,
        }
    }

    /// Path the item occupies after the event
    pub fn path(&self) -> &Path {
        self.dest_path.as_deref().unwrap_or(&self.src_path)
    }

    /// Every path the event touches
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.src_path.as_path()).chain(self.dest_path.as_deref())
    }

    pub fn is_created(&self) -> bool {
        self.kind == FsEventKind::Created
    }

    pub fn is_deleted(&self) -> bool {
        self.kind == FsEventKind::Deleted
    }

    pub fn is_modified(&self) -> bool {
        self.kind == FsEventKind::Modified
    }

    pub fn is_moved(&self) -> bool {
        self.kind == FsEventKind::Moved
    }
}
