//! File watching and batched change queue
//!
//! Provides a [`FileWatcher`] that wraps the `notify` crate to monitor the
//! sync root, converting raw OS events into [`FsEvent`] values.
//!
//! The [`EventBatch`] collects events in arrival order and releases them as
//! one batch once no new event has arrived for a quiet period, so that the
//! coalescer sees complete bursts (a save through a temporary file, a folder
//! copy) instead of fragments.
//!
//! ## Architecture
//!
//! ```text
//! inotify / kqueue        DirectorySnapshot diff
//!       │                         │
//!       ▼                         ▼
//!  FileWatcher ──→ mpsc::channel ←── PollingWatcher
//!                       │
//!                       ▼
//!               FsEventHandler (ignore rules, EventBatch)
//!                       │
//!                       ▼
//!                   coalesce ──→ upload worker
//! ```

use std::path::Path;
use std::time::{Duration, Instant};

use notify::event::{MetadataKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::fs_event::FsEvent;

// ============================================================================
// Watch messages
// ============================================================================

/// A mapped filesystem event and the rename tracker it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event: FsEvent,
    /// Links the halves of a rename reported as separate events
    pub tracker: Option<usize>,
}

impl From<FsEvent> for WatchEvent {
    fn from(event: FsEvent) -> Self {
        Self {
            event,
            tracker: None,
        }
    }
}

/// Why a watcher stopped delivering events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchFailure {
    /// The OS limit on watched directories is exhausted
    LimitReached,
    Other(String),
}

/// What watchers send to the event handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchMessage {
    Event(WatchEvent),
    Failed(WatchFailure),
}

// ============================================================================
// FileWatcher
// ============================================================================

/// Watches the sync root using the OS-native mechanism
///
/// On Linux this uses inotify. Events and failures are sent through the
/// channel given at construction; the watch stops when the watcher is
/// dropped.
pub struct FileWatcher {
    watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Creates a watcher that reports to `tx`
    ///
    /// # Errors
    /// Returns an error if the underlying OS watcher cannot be created
    pub fn new(tx: mpsc::Sender<WatchMessage>) -> Result<Self, notify::Error> {
        info!("Initializing native file watcher");

        let watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                let message = match res {
                    Ok(event) => match map_notify_event(&event) {
                        Some(fs_event) => WatchMessage::Event(WatchEvent {
                            event: fs_event,
                            tracker: event.tracker(),
                        }),
                        None => return,
                    },
                    Err(err) => {
                        error!(error = %err, "File watcher error");
                        WatchMessage::Failed(classify_error(&err))
                    }
                };
                if let Err(e) = tx.blocking_send(message) {
                    warn!(error = %e, "Failed to send watch event (receiver dropped)");
                }
            },
            notify::Config::default(),
        )?;

        Ok(Self { watcher })
    }

    /// Starts watching a directory recursively
    ///
    /// # Errors
    /// Returns an error if the path cannot be watched (e.g., does not exist,
    /// insufficient permissions, or the inotify watch limit is reached)
    pub fn watch(&mut self, path: &Path) -> Result<(), notify::Error> {
        info!(path = %path.display(), "Starting recursive watch");
        self.watcher.watch(path, RecursiveMode::Recursive)
    }

    /// Stops watching a directory
    ///
    /// # Errors
    /// Returns an error if the path was not being watched
    pub fn unwatch(&mut self, path: &Path) -> Result<(), notify::Error> {
        info!(path = %path.display(), "Stopping watch");
        self.watcher.unwatch(path)
    }
}

/// Maps a watcher error to the failure reported to the engine
pub fn classify_error(err: &notify::Error) -> WatchFailure {
    match &err.kind {
        notify::ErrorKind::MaxFilesWatch => WatchFailure::LimitReached,
        _ => WatchFailure::Other(err.to_string()),
    }
}

// ============================================================================
// Event mapping - notify::Event → FsEvent
// ============================================================================

/// Converts a `notify::Event` into an [`FsEvent`]
///
/// Maps the notify event kinds as follows:
/// - `Create(*)` -> created
/// - `Remove(*)` -> deleted
/// - `Modify(Name(Both))` with 2 paths -> moved
/// - `Modify(Name(From))` -> deleted, `Modify(Name(To))` -> created
/// - `Modify(Name(Any))` -> created or deleted, depending on existence
/// - `Modify(Data(*))`, `Modify(Metadata(WriteTime))`, `Modify(Any)` -> modified,
///   for files only
///
/// Returns `None` for events without paths and for events that do not
/// change content (access, permission and ownership changes).
pub(crate) fn map_notify_event(event: &notify::Event) -> Option<FsEvent> {
    let paths = &event.paths;
    let path = paths.first()?;

    let mapped = match &event.kind {
        EventKind::Create(kind) => {
            let is_dir = match kind {
                notify::event::CreateKind::Folder => true,
                notify::event::CreateKind::File => false,
                _ => path.is_dir(),
            };
            FsEvent::created(path.clone(), is_dir)
        }

        EventKind::Remove(kind) => FsEvent::deleted(path.clone(), matches!(kind, RemoveKind::Folder)),

        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match paths.get(1) {
            Some(dest) => FsEvent::moved(path.clone(), dest.clone(), dest.is_dir()),
            None => {
                debug!(path = %path.display(), "Rename with single path, treating as created");
                FsEvent::created(path.clone(), path.is_dir())
            }
        },

        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => FsEvent::deleted(path.clone(), false),

        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            FsEvent::created(path.clone(), path.is_dir())
        }

        EventKind::Modify(ModifyKind::Name(_)) => {
            if path.exists() {
                FsEvent::created(path.clone(), path.is_dir())
            } else {
                FsEvent::deleted(path.clone(), false)
            }
        }

        EventKind::Modify(ModifyKind::Metadata(MetadataKind::WriteTime))
        | EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Any) => {
            if path.is_dir() {
                return None;
            }
            FsEvent::modified(path.clone(), false)
        }

        _ => {
            debug!(kind = ?event.kind, "Ignoring event kind");
            return None;
        }
    };

    debug!(event = ?mapped, "Mapped watch event");
    Some(mapped)
}

// ============================================================================
// EventBatch
// ============================================================================

/// Queue that releases events in batches after a quiet period
///
/// Events are kept in arrival order. A batch becomes available once no
/// event has arrived for longer than the quiet period; each new event
/// restarts the wait, so bursts are never split.
///
/// The halves of a rename that the OS reports separately (a deletion at the
/// origin and a creation at the destination, followed by the paired move)
/// are replaced by the move when it arrives.
#[derive(Debug)]
pub struct EventBatch {
    pending: Vec<WatchEvent>,
    last_event: Option<Instant>,
    quiet_period: Duration,
}

impl EventBatch {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            pending: Vec::new(),
            last_event: None,
            quiet_period,
        }
    }

    /// Appends an event and restarts the quiet period
    pub fn push(&mut self, event: WatchEvent) {
        if let (true, Some(tracker)) = (event.event.is_moved(), event.tracker) {
            self.pending.retain(|queued| queued.tracker != Some(tracker));
        }
        debug!(event = ?event.event, "Enqueuing change event");
        self.pending.push(event);
        self.last_event = Some(Instant::now());
    }

    /// Time left until the batch settles, `None` if nothing is pending
    pub fn time_until_settled(&self, now: Instant) -> Option<Duration> {
        if self.pending.is_empty() {
            return None;
        }
        let elapsed = self
            .last_event
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or(self.quiet_period);
        Some(self.quiet_period.saturating_sub(elapsed))
    }

    /// Returns the whole batch if it has settled, otherwise nothing
    pub fn poll(&mut self) -> Vec<FsEvent> {
        match self.time_until_settled(Instant::now()) {
            Some(left) if left.is_zero() => self.drain(),
            _ => Vec::new(),
        }
    }

    /// Returns everything pending regardless of the quiet period
    pub fn drain(&mut self) -> Vec<FsEvent> {
        self.last_event = None;
        let settled: Vec<FsEvent> = self.pending.drain(..).map(|w| w.event).collect();
        if !settled.is_empty() {
            debug!(count = settled.len(), "Released change batch");
        }
        settled
    }

    /// Returns the number of pending events
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if there are no pending events
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Paths with pending events
    pub fn pending_paths(&self) -> impl Iterator<Item = &Path> {
        self.pending.iter().flat_map(|w| w.event.paths())
    }
}
