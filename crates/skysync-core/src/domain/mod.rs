//! Domain entities and business logic
//!
//! This module contains the core domain types for SkySync:
//! - Newtypes for validated remote paths, revisions, fingerprints and cursors
//! - Remote metadata as a closed sum type
//! - Index and hash cache records
//! - Sync events and their status machine
//! - The selective-sync exclusion tree
//! - Domain-specific error types

pub mod errors;
pub mod exclusion;
pub mod index_entry;
pub mod metadata;
pub mod newtypes;
pub mod sync_event;

// Re-export commonly used types
pub use errors::DomainError;
pub use exclusion::ExclusionTree;
pub use index_entry::{HashCacheEntry, IndexEntry, LocalFingerprint};
pub use metadata::{DeletedMetadata, FileMetadata, FolderMetadata, ItemKind, Metadata};
pub use newtypes::*;
pub use sync_event::{ChangeType, SyncDirection, SyncEvent, SyncStatus};
