//! Conflict detection logic
//!
//! Decides, before a remote change is written to the local filesystem,
//! whether the local item can be replaced. The inputs are the remote item,
//! the index entry recorded at the last sync, and the current local
//! fingerprint. The checks run in this order:
//!
//! 1. Remote revision equals the indexed revision: nothing to do.
//! 2. Local item already equals the remote item: nothing to download.
//! 3. No local item: apply.
//! 4. Local and remote kinds differ: conflict, the local subtree is kept.
//! 5. Local item unchanged since the last sync: apply.
//! 6. Otherwise both sides changed: conflict.

use skysync_core::domain::{IndexEntry, LocalFingerprint, Metadata};
use tracing::{debug, info};

/// Result of a conflict check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionResult {
    /// Local state already matches the remote item
    Identical,
    /// Safe to apply the remote change
    NoConflict,
    /// Both sides changed; the local item must be preserved
    Conflicted,
}

/// Detects conflicts between local and remote versions
pub struct ConflictDetector;

impl ConflictDetector {
    /// Checks whether a remote change can overwrite the local item
    ///
    /// For a remote deletion, [`DetectionResult::Conflicted`] means the local
    /// item was changed since the last sync and must not be deleted.
    pub fn check_remote_change(
        remote: &Metadata,
        entry: Option<&IndexEntry>,
        local: &LocalFingerprint,
    ) -> DetectionResult {
        let path = remote.path_display();

        if let (Some(entry), Some(rev)) = (entry, remote.rev()) {
            if entry.rev == rev && entry.item_kind == remote.item_kind() {
                debug!(path = %path, rev = %rev, "Remote revision already synced");
                return DetectionResult::Identical;
            }
        }

        let remote_fingerprint = LocalFingerprint::of_metadata(remote);
        if *local == remote_fingerprint {
            debug!(path = %path, "Local item already matches remote");
            return DetectionResult::Identical;
        }

        if !local.exists() {
            return DetectionResult::NoConflict;
        }

        if !remote.is_deleted() && local.item_kind() != remote.item_kind() {
            info!(
                path = %path,
                local_kind = %local.item_kind(),
                remote_kind = %remote.item_kind(),
                "Conflict detected: item type changed"
            );
            return DetectionResult::Conflicted;
        }

        if let Some(entry) = entry {
            if entry.fingerprint() == *local {
                return DetectionResult::NoConflict;
            }
        }

        info!(
            path = %path,
            indexed_rev = ?entry.map(|e| e.rev.as_str()),
            remote_rev = ?remote.rev().map(|r| r.as_str().to_string()),
            "Conflict detected: both local and remote versions changed"
        );
        DetectionResult::Conflicted
    }

    /// Returns true if the local item differs from its last synced state
    pub fn has_local_changes(entry: Option<&IndexEntry>, local: &LocalFingerprint) -> bool {
        match entry {
            Some(entry) => entry.fingerprint() != *local,
            None => local.exists(),
        }
    }
}
