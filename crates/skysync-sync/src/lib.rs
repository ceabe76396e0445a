//! SkySync Sync - Bidirectional synchronization engine
//!
//! Provides:
//! - Content fingerprints bit-compatible with the remote's content hash
//! - Local change detection: native watcher, polling fallback, coalescing
//! - Change classification and conflict handling against the sync index
//! - Upload and download cycles, full reconciliation, selective sync and
//!   root namespace migration
//! - Long-lived workers driving the engine
//!
//! ## Modules
//!
//! - [`hasher`] - Content fingerprinter and the mtime-keyed hash cache front
//! - [`watcher`], [`snapshot`], [`coalesce`], [`event_handler`] - Local
//!   change detection
//! - [`classifier`] - Turns remote metadata and local events into sync events
//! - [`engine`] - The sync engine; reconciliation, selective sync and
//!   migration live in their own modules as further `impl` blocks
//! - [`monitor`] - Worker orchestration and the control API
//! - [`errors`] - Per-item, fatal and connection errors

pub mod activity;
pub mod classifier;
pub mod coalesce;
pub mod engine;
pub mod errors;
pub mod event_handler;
pub mod filesystem;
pub mod fs_event;
pub mod hasher;
pub mod logging;
mod migration;
pub mod monitor;
mod reconcile;
mod selective;
pub mod snapshot;
pub mod state;
pub mod watcher;

pub use activity::ActivityTracker;
pub use engine::{FileStatus, SyncEngine};
pub use errors::{EngineError, EngineResult, FatalError, SyncError, SyncErrorKind};
pub use fs_event::{FsEvent, FsEventKind};
pub use hasher::{hash_file, hash_reader, ContentHasher, LocalHasher};
pub use monitor::{IdleTracker, SyncLockRegistry, SyncMonitor};
