//! Sync activity bookkeeping
//!
//! Tracks the events currently queued or transferring, a bounded history of
//! finished events, the per-item sync errors and the fatal errors. All state
//! sits behind one mutex; every method holds it only briefly.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, warn};
use uuid::Uuid;

use skysync_core::domain::{SyncDirection, SyncEvent, SyncStatus};

use crate::errors::{FatalError, SyncError};

/// Finished events kept in the history
pub const HISTORY_LIMIT: usize = 1000;

#[derive(Debug, Default)]
struct ActivityState {
    /// Queued and running events, in queue order
    active: BTreeMap<u64, SyncEvent>,
    ids: BTreeMap<Uuid, u64>,
    next_seq: u64,
    history: VecDeque<SyncEvent>,
    /// Keyed by local path
    sync_errors: BTreeMap<PathBuf, SyncError>,
    fatal_errors: Vec<FatalError>,
}

/// Shared activity state of one engine
#[derive(Debug)]
pub struct ActivityTracker {
    state: Mutex<ActivityState>,
    history_limit: usize,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new(HISTORY_LIMIT)
    }
}

impl ActivityTracker {
    pub fn new(history_limit: usize) -> Self {
        Self {
            state: Mutex::new(ActivityState::default()),
            history_limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ActivityState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Registers a queued event and returns its id
    ///
    /// A failed event for the same local path is dropped from the history,
    /// since the new event supersedes it.
    pub fn queue(&self, event: SyncEvent) -> Uuid {
        let mut state = self.lock();
        let id = event.id;
        state
            .history
            .retain(|old| !(old.status() == SyncStatus::Failed && old.local_path == event.local_path));
        let seq = state.next_seq;
        state.next_seq += 1;
        state.ids.insert(id, seq);
        state.active.insert(seq, event);
        id
    }

    /// Applies `f` to an active event
    pub fn update<F>(&self, id: Uuid, f: F)
    where
        F: FnOnce(&mut SyncEvent),
    {
        let mut state = self.lock();
        let Some(seq) = state.ids.get(&id).copied() else {
            return;
        };
        if let Some(event) = state.active.get_mut(&seq) {
            f(event);
        }
    }

    /// Marks an active event as transferring
    pub fn start(&self, id: Uuid) {
        self.update(id, |event| {
            if let Err(e) = event.transition_to(SyncStatus::Syncing) {
                debug!(error = %e, "Ignoring status change");
            }
        });
    }

    /// Records transfer progress
    pub fn progress(&self, id: Uuid, completed: u64, total: u64) {
        self.update(id, |event| {
            event.completed = completed;
            if total > 0 {
                event.size = total;
            }
        });
    }

    /// Moves an active event to the history with a terminal status
    pub fn finish(&self, id: Uuid, status: SyncStatus) {
        let mut state = self.lock();
        let Some(seq) = state.ids.remove(&id) else {
            return;
        };
        let Some(mut event) = state.active.remove(&seq) else {
            return;
        };
        if let Err(e) = event.transition_to(status) {
            debug!(error = %e, "Ignoring status change");
        }
        state.history.push_back(event);
        while state.history.len() > self.history_limit {
            state.history.pop_front();
        }
    }

    /// Queued and running events in queue order
    pub fn active(&self) -> Vec<SyncEvent> {
        self.lock().active.values().cloned().collect()
    }

    /// Finished events, oldest first
    pub fn history(&self) -> Vec<SyncEvent> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        self.lock().history.clear();
    }

    /// Direction of the active event for `path`, if any
    pub fn active_direction(&self, path: &Path) -> Option<SyncDirection> {
        self.lock()
            .active
            .values()
            .find(|event| event.local_path == path)
            .map(|event| event.direction)
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    /// Records a per-item error, replacing an older one for the same path
    pub fn add_sync_error(&self, err: SyncError) {
        warn!(
            kind = ?err.kind,
            local_path = ?err.local_path,
            remote_path = ?err.remote_path.as_ref().map(|p| p.as_str()),
            cause = %err.cause,
            "Sync error"
        );
        let key = err
            .local_path
            .clone()
            .or_else(|| err.remote_path.as_ref().map(|p| PathBuf::from(p.as_str())))
            .unwrap_or_default();
        self.lock().sync_errors.insert(key, err);
    }

    /// Clears the error of `path` and of everything below it
    pub fn clear_sync_errors(&self, path: &Path) {
        self.lock()
            .sync_errors
            .retain(|errored, _| !errored.starts_with(path));
    }

    pub fn sync_errors(&self) -> Vec<SyncError> {
        self.lock().sync_errors.values().cloned().collect()
    }

    pub fn has_sync_error(&self, path: &Path) -> bool {
        self.lock().sync_errors.contains_key(path)
    }

    pub fn add_fatal_error(&self, err: FatalError) {
        error!(error = %err, "Fatal sync error");
        let mut state = self.lock();
        if !state.fatal_errors.contains(&err) {
            state.fatal_errors.push(err);
        }
    }

    pub fn fatal_errors(&self) -> Vec<FatalError> {
        self.lock().fatal_errors.clone()
    }

    pub fn clear_fatal_errors(&self) {
        self.lock().fatal_errors.clear();
    }
}
