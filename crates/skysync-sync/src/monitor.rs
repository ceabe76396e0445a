//! Sync orchestration
//!
//! The [`SyncMonitor`] owns the long-lived workers of one sync root:
//!
//! ```text
//! watcher ──→ pump ──→ FsEventHandler ──→ upload worker ──┐
//!                                                         ├─→ SyncEngine (sync lock)
//! remote long-poll ──────────────────────→ download worker┤
//! include_item ──→ queue ────────────────→ added-item worker
//! connection probe ──→ connected flag       startup worker (once)
//! ```
//!
//! Workers block on their input and on three flags: running (cleared by
//! [`pause`](SyncMonitor::pause) and by fatal errors), connected (cleared by
//! connection errors, restored by the probe) and ready (set once the startup
//! sync finished). Every blocking wait also observes the session's
//! cancellation token, so [`stop`](SyncMonitor::stop) returns once in-flight
//! transfers have finished.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use skysync_core::domain::{RemotePath, SyncEvent};
use skysync_core::ports::RemoteError;

use crate::engine::{FileStatus, SyncEngine};
use crate::errors::{EngineError, EngineResult, FatalError, SyncError};
use crate::fs_event::FsEvent;
use crate::snapshot::PollingWatcher;
use crate::watcher::{classify_error, FileWatcher, WatchFailure, WatchMessage};

/// How long the upload worker waits for a batch before counting an idle
/// cycle
const UPLOAD_POLL: Duration = Duration::from_secs(1);

/// Capacity of the channel between the watchers and the pump
const WATCH_CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// Sync lock registry
// ============================================================================

/// Sync locks keyed by configuration name
///
/// Engines for the same configuration share one lock, so that two monitors
/// never mutate the same index concurrently.
#[derive(Debug, Clone, Default)]
pub struct SyncLockRegistry {
    locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SyncLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, config_name: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(config_name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .value(),
        )
    }
}

// ============================================================================
// Idle tracking
// ============================================================================

/// Counts consecutive sync cycles without work
#[derive(Debug)]
pub struct IdleTracker {
    cycles: watch::Sender<u64>,
}

impl Default for IdleTracker {
    fn default() -> Self {
        Self {
            cycles: watch::channel(0).0,
        }
    }
}

impl IdleTracker {
    /// Records a finished cycle
    pub fn record(&self, did_work: bool) {
        self.cycles.send_modify(|cycles| {
            *cycles = if did_work { 0 } else { cycles.saturating_add(1) };
        });
    }

    pub fn idle_cycles(&self) -> u64 {
        *self.cycles.borrow()
    }

    /// Waits until `cycles` consecutive cycles found nothing to do
    ///
    /// Returns false if `timeout` passed first.
    pub async fn wait_for_idle(&self, cycles: u64, timeout: Duration) -> bool {
        let mut rx = self.cycles.subscribe();
        let reached = tokio::time::timeout(timeout, async move {
            rx.wait_for(|idle| *idle >= cycles).await.is_ok()
        })
        .await;
        reached.unwrap_or(false)
    }
}

// ============================================================================
// Shared worker state
// ============================================================================

struct Shared {
    engine: Arc<SyncEngine>,
    running: watch::Sender<bool>,
    connected: watch::Sender<bool>,
    ready: watch::Sender<bool>,
    idle: IdleTracker,
    added_tx: mpsc::UnboundedSender<RemotePath>,
    added_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RemotePath>>,
}

impl Shared {
    /// Waits until the workers may sync; false once cancelled
    async fn wait_active(&self, cancel: &CancellationToken, need_ready: bool) -> bool {
        let mut running = self.running.subscribe();
        let mut connected = self.connected.subscribe();
        let mut ready = self.ready.subscribe();
        loop {
            let waited = tokio::select! {
                _ = cancel.cancelled() => return false,
                res = async {
                    running.wait_for(|v| *v).await?;
                    connected.wait_for(|v| *v).await?;
                    if need_ready {
                        ready.wait_for(|v| *v).await?;
                    }
                    Ok::<_, watch::error::RecvError>(())
                } => res,
            };
            if waited.is_err() {
                return false;
            }
            if self.is_active(need_ready) {
                return true;
            }
        }
    }

    fn is_active(&self, need_ready: bool) -> bool {
        *self.running.borrow() && *self.connected.borrow() && (!need_ready || *self.ready.borrow())
    }

    async fn handle_error(&self, err: EngineError) {
        match err {
            EngineError::Fatal(fatal) => {
                if fatal == FatalError::CursorReset {
                    // Without a cursor the next download cycle reindexes.
                    if let Err(e) = self.engine.state().reset_sync_state().await {
                        warn!(error = %e, "Failed to reset sync state");
                    }
                }
                self.engine.activity().add_fatal_error(fatal);
                self.running.send_replace(false);
                info!("Syncing paused after fatal error");
            }
            EngineError::Connection(reason) => {
                debug!(reason = %reason, "Connection lost, waiting for it to return");
                self.connected.send_replace(false);
            }
            EngineError::Sync(err) => self.engine.activity().add_sync_error(err),
            EngineError::Cancelled => {}
        }
    }
}

// ============================================================================
// SyncMonitor
// ============================================================================

struct Session {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    /// Kept alive for the session; dropping it ends the native watch
    _watcher: Option<FileWatcher>,
}

/// Runs and controls the sync workers of one engine
pub struct SyncMonitor {
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
}

impl SyncMonitor {
    /// Creates a stopped monitor, sharing the sync lock registered for the
    /// engine's configuration name
    pub fn new(engine: SyncEngine, locks: &SyncLockRegistry) -> Self {
        let lock = locks.lock_for(&engine.config().config_name);
        let (added_tx, added_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                engine: Arc::new(engine.with_sync_lock(lock)),
                running: watch::channel(false).0,
                connected: watch::channel(true).0,
                ready: watch::channel(false).0,
                idle: IdleTracker::default(),
                added_tx,
                added_rx: tokio::sync::Mutex::new(added_rx),
            }),
            session: Mutex::new(None),
        }
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.shared.engine
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Starts watching the local folder and spawns the workers
    ///
    /// # Errors
    ///
    /// Fails with a fatal error if the root is missing or the OS watch
    /// limit is exhausted.
    #[instrument(skip(self))]
    pub async fn start(&self) -> EngineResult<()> {
        if self.is_running() {
            return Ok(());
        }
        let engine = Arc::clone(&self.shared.engine);
        engine.check_root().await?;

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let mut tasks = Vec::new();
        let watcher = self.start_watcher(tx, &cancel, &mut tasks)?;

        self.shared.ready.send_replace(false);
        self.shared.running.send_replace(true);
        tasks.push(tokio::spawn(pump(Arc::clone(&self.shared), rx, cancel.clone())));
        tasks.push(tokio::spawn(connection_worker(Arc::clone(&self.shared), cancel.clone())));
        tasks.push(tokio::spawn(startup_worker(Arc::clone(&self.shared), cancel.clone())));
        tasks.push(tokio::spawn(upload_worker(Arc::clone(&self.shared), cancel.clone())));
        tasks.push(tokio::spawn(download_worker(Arc::clone(&self.shared), cancel.clone())));
        tasks.push(tokio::spawn(added_item_worker(Arc::clone(&self.shared), cancel.clone())));

        *self.session() = Some(Session {
            cancel,
            tasks,
            _watcher: watcher,
        });
        info!(root = %engine.root().display(), "Sync started");
        Ok(())
    }

    fn start_watcher(
        &self,
        tx: mpsc::Sender<WatchMessage>,
        cancel: &CancellationToken,
        tasks: &mut Vec<JoinHandle<()>>,
    ) -> EngineResult<Option<FileWatcher>> {
        let engine = &self.shared.engine;
        let root = engine.root().to_path_buf();
        let interval = Duration::from_secs(engine.config().polling_interval.max(1));

        if !engine.config().use_polling_watcher {
            let native = FileWatcher::new(tx.clone()).and_then(|mut watcher| {
                watcher.watch(&root)?;
                Ok(watcher)
            });
            match native {
                Ok(watcher) => return Ok(Some(watcher)),
                Err(err) => match classify_error(&err) {
                    WatchFailure::LimitReached => return Err(FatalError::WatchLimit.into()),
                    WatchFailure::Other(reason) => {
                        warn!(reason = %reason, "Native watcher unavailable, polling instead");
                    }
                },
            }
        }
        tasks.push(PollingWatcher::spawn(root, interval, tx, cancel.child_token()));
        Ok(None)
    }

    /// Stops all workers
    ///
    /// Blocking waits return promptly; running transfers finish first.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let Some(session) = self.session().take() else {
            return;
        };
        session.cancel.cancel();
        drop(session._watcher);
        for task in session.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Sync worker ended abnormally");
            }
        }
        self.shared.running.send_replace(false);
        self.shared.ready.send_replace(false);
        info!("Sync stopped");
    }

    pub fn is_running(&self) -> bool {
        self.session().is_some()
    }

    /// Pauses syncing; local events keep being collected
    pub fn pause(&self) {
        self.shared.running.send_replace(false);
        info!("Sync paused");
    }

    /// Resumes syncing and clears fatal errors
    pub fn resume(&self) {
        self.shared.engine.activity().clear_fatal_errors();
        self.shared.running.send_replace(true);
        info!("Sync resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.is_running() && !*self.shared.running.borrow()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// Queued and running events
    pub fn activity(&self) -> Vec<SyncEvent> {
        self.shared.engine.activity().active()
    }

    /// Recently finished events
    pub fn history(&self) -> Vec<SyncEvent> {
        self.shared.engine.activity().history()
    }

    pub fn sync_errors(&self) -> Vec<SyncError> {
        self.shared.engine.activity().sync_errors()
    }

    pub fn fatal_errors(&self) -> Vec<FatalError> {
        self.shared.engine.activity().fatal_errors()
    }

    pub fn idle(&self) -> &IdleTracker {
        &self.shared.idle
    }

    /// Waits until `cycles` consecutive cycles found nothing to do
    pub async fn wait_for_idle(&self, cycles: u64, timeout: Duration) -> bool {
        self.shared.idle.wait_for_idle(cycles, timeout).await
    }

    /// Sync status of a local path; unwatched while stopped
    pub async fn file_status(&self, local_path: &Path) -> EngineResult<FileStatus> {
        if !self.is_running() {
            return Ok(FileStatus::Unwatched);
        }
        self.shared.engine.file_status(local_path).await
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    pub async fn exclude_item(&self, path: &RemotePath) -> EngineResult<()> {
        self.shared.engine.exclude_item(path).await
    }

    /// Includes `path` and queues it for download
    pub async fn include_item(&self, path: &RemotePath) -> EngineResult<()> {
        for included in self.shared.engine.include_item(path).await? {
            if self.shared.added_tx.send(included).is_err() {
                return Err(EngineError::Cancelled);
            }
        }
        Ok(())
    }

    /// Clears the index and runs a full reconciliation
    pub async fn rebuild_index(&self) -> EngineResult<usize> {
        self.shared.engine.rebuild_index().await
    }
}

// ============================================================================
// Workers
// ============================================================================

/// Forwards watcher output to the event handler
async fn pump(shared: Arc<Shared>, mut rx: mpsc::Receiver<WatchMessage>, cancel: CancellationToken) {
    let engine = &shared.engine;
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx.recv() => message,
        };
        let Some(message) = message else {
            break;
        };
        match message {
            WatchMessage::Event(watch_event) => {
                if removes_root(&watch_event.event, engine.root()) {
                    let root = engine.root().to_path_buf();
                    shared.handle_error(FatalError::RootMissing(root).into()).await;
                    continue;
                }
                engine.fs_events().handle(watch_event);
            }
            WatchMessage::Failed(WatchFailure::LimitReached) => {
                shared.handle_error(FatalError::WatchLimit.into()).await;
            }
            WatchMessage::Failed(WatchFailure::Other(reason)) => {
                if let Err(err) = engine.check_root().await {
                    shared.handle_error(err).await;
                } else {
                    warn!(reason = %reason, "File watcher reported an error");
                }
            }
        }
    }
    debug!("Watch pump stopped");
}

fn removes_root(event: &FsEvent, root: &Path) -> bool {
    (event.is_deleted() || event.is_moved()) && event.src_path == root
}

async fn connection_worker(shared: Arc<Shared>, cancel: CancellationToken) {
    let interval = Duration::from_secs(shared.engine.config().connection_check_interval.max(1));
    loop {
        match shared.engine.remote().check_connection().await {
            Ok(()) => {
                if !shared.connected.send_replace(true) {
                    info!("Connection restored");
                }
            }
            Err(err @ RemoteError::AuthRevoked(_)) => {
                shared.handle_error(EngineError::from_remote(err, None, None)).await;
            }
            Err(err) if err.is_connection() => {
                if shared.connected.send_replace(false) {
                    info!(reason = %err, "Connecting...");
                }
            }
            Err(err) => debug!(error = %err, "Connection probe failed"),
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("Connection worker stopped");
}

/// Runs the startup sync once, retrying after connection loss or resume
async fn startup_worker(shared: Arc<Shared>, cancel: CancellationToken) {
    while shared.wait_active(&cancel, false).await {
        match shared.engine.startup().await {
            Ok(synced) => {
                shared.idle.record(synced > 0);
                shared.ready.send_replace(true);
                break;
            }
            Err(err @ EngineError::Sync(_)) => {
                shared.handle_error(err).await;
                shared.ready.send_replace(true);
                break;
            }
            Err(err) => shared.handle_error(err).await,
        }
    }
    debug!("Startup worker finished");
}

async fn upload_worker(shared: Arc<Shared>, cancel: CancellationToken) {
    let events = Arc::clone(shared.engine.fs_events());
    while shared.wait_active(&cancel, true).await {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = events.wait_for_batch(UPLOAD_POLL) => batch,
        };
        if batch.is_empty() {
            if shared.engine.activity().active().is_empty() {
                shared.idle.record(false);
            }
            continue;
        }
        match shared.engine.upload_local_changes(batch).await {
            Ok(synced) => shared.idle.record(synced > 0),
            Err(err) => shared.handle_error(err).await,
        }
    }
    debug!("Upload worker stopped");
}

async fn download_worker(shared: Arc<Shared>, cancel: CancellationToken) {
    let timeout = shared.engine.config().longpoll_timeout();
    while shared.wait_active(&cancel, true).await {
        let changes = tokio::select! {
            _ = cancel.cancelled() => break,
            changes = shared.engine.wait_for_remote_changes(timeout) => changes,
        };
        match changes {
            Ok(false) => shared.idle.record(false),
            Ok(true) => {
                if !shared.is_active(true) {
                    continue;
                }
                match shared.engine.download_sync_cycle().await {
                    Ok(synced) => shared.idle.record(synced > 0),
                    Err(err) => shared.handle_error(err).await,
                }
            }
            Err(err) => shared.handle_error(err).await,
        }
    }
    debug!("Download worker stopped");
}

/// Downloads newly included items
async fn added_item_worker(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut queue = shared.added_rx.lock().await;
    while shared.wait_active(&cancel, true).await {
        let path = tokio::select! {
            _ = cancel.cancelled() => break,
            path = queue.recv() => path,
        };
        let Some(path) = path else {
            break;
        };
        info!(path = %path, "Downloading included item");
        match shared.engine.download_tree(&path).await {
            Ok(synced) => shared.idle.record(synced > 0),
            Err(err) => {
                if err.is_connection() {
                    // Retry once the connection is back.
                    let _ = shared.added_tx.send(path);
                }
                shared.handle_error(err).await;
            }
        }
    }
    debug!("Added-item worker stopped");
}
