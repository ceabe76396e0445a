//! Local event intake
//!
//! [`FsEventHandler`] sits between the watchers and the upload worker. It
//! drops events for internal paths and for changes the engine made itself,
//! queues the rest in an [`EventBatch`], and hands out coalesced batches.
//!
//! Changes made by the engine are announced with [`FsEventHandler::ignore`].
//! The returned guard keeps the rule active; once dropped, the rule lingers
//! for a short grace period because the OS may report the change late.
//! During that period a rule only matches while the path still looks the way
//! the engine left it, so a user edit right after a download gets through.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::coalesce::coalesce;
use crate::filesystem;
use crate::fs_event::FsEvent;
use crate::watcher::{EventBatch, WatchEvent};

/// How long a released ignore rule keeps matching
pub const IGNORE_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// What the filesystem showed for a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    is_dir: bool,
    len: u64,
    modified: Option<SystemTime>,
}

impl Stamp {
    fn of(path: &Path) -> Option<Self> {
        std::fs::symlink_metadata(path).ok().map(|meta| Self {
            is_dir: meta.is_dir(),
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }

    fn same_as(&self, other: &Stamp) -> bool {
        (self.is_dir && other.is_dir) || self == other
    }
}

/// State of a rule whose guard was dropped
#[derive(Debug)]
struct Release {
    at: SystemTime,
    expires: Instant,
    /// The rule path as the engine left it
    left: Option<Stamp>,
}

impl Release {
    /// True if `path` still looks the way the engine left it
    fn explains(&self, rule_path: &Path, path: &Path) -> bool {
        if path == rule_path {
            return match (Stamp::of(path), &self.left) {
                (None, None) => true,
                (Some(now), Some(left)) => now.same_as(left),
                _ => false,
            };
        }
        // Below the rule path the item, or for a deletion its nearest
        // existing parent, must not have changed since the release.
        for candidate in path.ancestors().take_while(|p| p.starts_with(rule_path)) {
            if let Some(stamp) = Stamp::of(candidate) {
                return stamp.modified.map_or(false, |modified| modified <= self.at);
            }
        }
        self.left.is_none()
    }
}

#[derive(Debug)]
struct IgnoreRule {
    id: u64,
    path: PathBuf,
    recursive: bool,
    /// Set once the guard is dropped
    released: Option<Release>,
}

impl IgnoreRule {
    fn matches(&self, path: &Path) -> bool {
        let covered = if self.recursive {
            path.starts_with(&self.path)
        } else {
            path == self.path
        };
        match &self.released {
            _ if !covered => false,
            None => true,
            Some(release) => release.explains(&self.path, path),
        }
    }
}

#[derive(Debug, Default)]
struct IgnoreRules {
    rules: Vec<IgnoreRule>,
    next_id: u64,
}

impl IgnoreRules {
    fn purge(&mut self, now: Instant) {
        self.rules.retain(|rule| {
            rule.released
                .as_ref()
                .map_or(true, |release| release.expires > now)
        });
    }

    fn covers(&self, path: &Path) -> bool {
        self.rules.iter().any(|rule| rule.matches(path))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps ignore rules active while alive
#[must_use = "the rule expires as soon as the guard is dropped"]
pub struct IgnoreGuard {
    rules: Arc<Mutex<IgnoreRules>>,
    ids: Vec<u64>,
}

impl Drop for IgnoreGuard {
    fn drop(&mut self) {
        let at = SystemTime::now();
        let expires = Instant::now() + IGNORE_GRACE_PERIOD;
        let mut rules = lock(&self.rules);
        for rule in rules.rules.iter_mut().filter(|rule| self.ids.contains(&rule.id)) {
            rule.released = Some(Release {
                at,
                expires,
                left: Stamp::of(&rule.path),
            });
        }
    }
}

/// Filters and batches local filesystem events
pub struct FsEventHandler {
    root: PathBuf,
    batch: Mutex<EventBatch>,
    rules: Arc<Mutex<IgnoreRules>>,
    notify: Notify,
}

impl FsEventHandler {
    pub fn new(root: impl Into<PathBuf>, quiet_period: Duration) -> Self {
        Self {
            root: root.into(),
            batch: Mutex::new(EventBatch::new(quiet_period)),
            rules: Arc::new(Mutex::new(IgnoreRules::default())),
            notify: Notify::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ignores events for `paths` until the guard is dropped, and afterwards
    /// for the grace period as long as the paths stay unchanged
    pub fn ignore<I, P>(&self, paths: I, recursive: bool) -> IgnoreGuard
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut rules = lock(&self.rules);
        let mut ids = Vec::new();
        for path in paths {
            let id = rules.next_id;
            rules.next_id += 1;
            rules.rules.push(IgnoreRule {
                id,
                path: path.into(),
                recursive,
                released: None,
            });
            ids.push(id);
        }
        IgnoreGuard {
            rules: Arc::clone(&self.rules),
            ids,
        }
    }

    /// Takes an event from a watcher
    ///
    /// Events for the root, for internal names and for paths covered by an
    /// ignore rule are dropped. A move from or into an internal location
    /// becomes a creation or deletion.
    pub fn handle(&self, watch_event: WatchEvent) {
        let Some(event) = self.externalize(watch_event.event) else {
            return;
        };
        {
            let mut rules = lock(&self.rules);
            rules.purge(Instant::now());
            if event.paths().all(|path| rules.covers(path)) {
                trace!(event = ?event, "Ignoring self-caused event");
                return;
            }
        }
        lock(&self.batch).push(WatchEvent {
            event,
            tracker: watch_event.tracker,
        });
        self.notify.notify_one();
    }

    /// Queues an event produced by the engine itself, bypassing ignore rules
    pub fn queue_local(&self, event: FsEvent) {
        debug!(event = ?event, "Queueing rescan event");
        lock(&self.batch).push(WatchEvent::from(event));
        self.notify.notify_one();
    }

    fn externalize(&self, event: FsEvent) -> Option<FsEvent> {
        let internal = |path: &Path| path == self.root || filesystem::is_internal_path(&self.root, path);
        let outside = |path: &Path| !path.starts_with(&self.root);

        match &event.dest_path {
            Some(dest) => {
                let src_hidden = internal(&event.src_path) || outside(&event.src_path);
                let dest_hidden = internal(dest) || outside(dest);
                match (src_hidden, dest_hidden) {
                    (false, false) => Some(event),
                    (true, false) => Some(FsEvent::created(dest.clone(), event.is_directory)),
                    (false, true) => Some(FsEvent::deleted(event.src_path, event.is_directory)),
                    (true, true) => None,
                }
            }
            None if internal(&event.src_path) || outside(&event.src_path) => None,
            None => Some(event),
        }
    }

    /// Returns true if events are waiting
    pub fn has_pending(&self) -> bool {
        !lock(&self.batch).is_empty()
    }

    /// Returns true if an event for `path` is waiting
    pub fn is_pending(&self, path: &Path) -> bool {
        lock(&self.batch).pending_paths().any(|p| p == path)
    }

    /// Drops everything queued
    pub fn clear(&self) {
        let dropped = lock(&self.batch).drain();
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "Discarded queued local events");
        }
    }

    /// Waits up to `timeout` for a settled batch and returns it coalesced
    ///
    /// Returns an empty list if no batch settled in time.
    pub async fn wait_for_batch(&self, timeout: Duration) -> Vec<FsEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Vec::new();
            }
            let settled_in = {
                let mut batch = lock(&self.batch);
                match batch.time_until_settled(Instant::now()) {
                    Some(left) if left.is_zero() => return coalesce(batch.drain()),
                    other => other,
                }
            };
            match settled_in {
                Some(left) => tokio::time::sleep_until((now + left).min(deadline)).await,
                None => {
                    let _ = tokio::time::timeout_at(deadline, self.notify.notified()).await;
                }
            }
        }
    }
}
