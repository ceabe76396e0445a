//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the sync engine
//! depends on, but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IRemoteClient`] - Remote storage operations
//! - [`ISyncIndex`] - Persistent per-path sync state
//! - [`IHashCache`] - Memoized local fingerprints
//! - [`IStateStore`] - Scalar settings such as the remote cursor

pub mod remote_client;
pub mod sync_index;

pub use remote_client::{
    IRemoteClient, ListFolderResult, LongPollResult, NamespaceInfo, ProgressCallback, RemoteError,
    WriteMode,
};
pub use sync_index::{IHashCache, IStateStore, ISyncIndex, IndexCorruption};
