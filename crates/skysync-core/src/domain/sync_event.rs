//! In-flight units of sync work
//!
//! A [`SyncEvent`] is created from a remote metadata record or a coalesced
//! local filesystem event, updated while its transfer runs, and archived in
//! a bounded history once it reaches a terminal status.
//!
//! ## Status machine
//!
//! ```text
//! Queued ──→ Syncing ──→ Done | Failed | Skipped | Aborted
//!    └───────────────────↗ (Skipped / Aborted directly from Queued)
//! ```
//!
//! Status only moves forward; terminal statuses are final.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DomainError;
use super::metadata::{ItemKind, Metadata};
use super::newtypes::{ContentHash, RemotePath, Revision};

/// Which replica the change originated on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Local change, applied to the remote
    Up,
    /// Remote change, applied locally
    Down,
}

/// Kind of change a sync event applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Removed,
    Moved,
    Modified,
}

/// Progress status of a sync event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Queued,
    Syncing,
    Done,
    Failed,
    Skipped,
    Aborted,
}

impl SyncStatus {
    pub fn name(&self) -> &'static str {
        match self {
            SyncStatus::Queued => "queued",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Done => "done",
            SyncStatus::Failed => "failed",
            SyncStatus::Skipped => "skipped",
            SyncStatus::Aborted => "aborted",
        }
    }

    /// Returns true for statuses no event can leave
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncStatus::Done | SyncStatus::Failed | SyncStatus::Skipped | SyncStatus::Aborted
        )
    }

    /// Checks whether `target` lies strictly ahead of this status
    pub fn can_transition_to(&self, target: SyncStatus) -> bool {
        match (self, target) {
            (SyncStatus::Queued, SyncStatus::Queued) => false,
            (SyncStatus::Queued, _) => true,
            (SyncStatus::Syncing, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A unit of work flowing from the classifier to a transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: Uuid,
    pub direction: SyncDirection,
    pub item_kind: ItemKind,
    pub local_path: PathBuf,
    /// Local origin of a move
    pub local_path_from: Option<PathBuf>,
    pub remote_path: RemotePath,
    /// Remote origin of a move
    pub remote_path_from: Option<RemotePath>,
    pub rev: Option<Revision>,
    pub content_hash: Option<ContentHash>,
    pub change_type: ChangeType,
    pub change_time: Option<DateTime<Utc>>,
    /// Who last changed the item, when the remote reports it
    pub change_user: Option<String>,
    status: SyncStatus,
    pub size: u64,
    pub completed: u64,
}

impl SyncEvent {
    /// Creates a queued event
    pub fn new(
        direction: SyncDirection,
        item_kind: ItemKind,
        change_type: ChangeType,
        remote_path: RemotePath,
        local_path: PathBuf,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction,
            item_kind,
            local_path,
            local_path_from: None,
            remote_path,
            remote_path_from: None,
            rev: None,
            content_hash: None,
            change_type,
            change_time: None,
            change_user: None,
            status: SyncStatus::Queued,
            size: 0,
            completed: 0,
        }
    }

    /// Creates a download event for a remote change
    ///
    /// `change_type` is decided by the caller from the index state.
    pub fn from_metadata(
        md: &Metadata,
        change_type: ChangeType,
        item_kind: ItemKind,
        local_path: PathBuf,
    ) -> Self {
        let mut event = Self::new(
            SyncDirection::Down,
            item_kind,
            change_type,
            md.path_display().clone(),
            local_path,
        );
        event.rev = md.rev();
        event.content_hash = md.content_hash().cloned();
        if let Metadata::File(file) = md {
            event.size = file.size;
            event.change_time = Some(file.server_modified);
            event.change_user = file.modified_by.clone();
        }
        event
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    /// Moves the event forward to `target`
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidState` for backward or repeated transitions.
    pub fn transition_to(&mut self, target: SyncStatus) -> Result<(), DomainError> {
        if !self.status.can_transition_to(target) {
            return Err(DomainError::InvalidState {
                from: self.status.name().to_string(),
                to: target.name().to_string(),
            });
        }
        if target == SyncStatus::Done && self.change_type != ChangeType::Removed {
            self.completed = self.size;
        }
        self.status = target;
        Ok(())
    }

    pub fn is_file(&self) -> bool {
        self.item_kind == ItemKind::File
    }

    pub fn is_folder(&self) -> bool {
        self.item_kind == ItemKind::Folder
    }

    pub fn is_upload(&self) -> bool {
        self.direction == SyncDirection::Up
    }

    pub fn is_download(&self) -> bool {
        self.direction == SyncDirection::Down
    }

    pub fn is_added(&self) -> bool {
        self.change_type == ChangeType::Added
    }

    pub fn is_removed(&self) -> bool {
        self.change_type == ChangeType::Removed
    }

    pub fn is_moved(&self) -> bool {
        self.change_type == ChangeType::Moved
    }

    pub fn is_modified(&self) -> bool {
        self.change_type == ChangeType::Modified
    }
}
