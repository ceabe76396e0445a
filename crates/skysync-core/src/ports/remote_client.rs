//! Remote client port (driven/secondary port)
//!
//! This module defines the operations the sync engine consumes from the
//! remote storage service. Authentication, request shapes and transport are
//! the adapter's business; the engine only sees the calls below and a
//! pre-classified [`RemoteError`].
//!
//! ## Design Notes
//!
//! - Uses a typed error instead of `anyhow` because the engine branches on
//!   the error kind (retry, surface per item, stop syncing).
//! - Uses `#[async_trait]` for async trait methods.
//! - Paginated listings return one page at a time; callers loop while
//!   `has_more` is set, passing the returned cursor to
//!   [`IRemoteClient::list_remote_changes`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::domain::metadata::{FileMetadata, FolderMetadata, Metadata};
use crate::domain::newtypes::{Cursor, RemotePath, Revision};

// ============================================================================
// Errors
// ============================================================================

/// Pre-classified failures of remote operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Remote item not found: {0}")]
    NotFound(String),

    /// The remote rejected the path (naming rules, length, reserved names)
    #[error("Remote path rejected: {0}")]
    PathInvalid(String),

    #[error("Insufficient permissions: {0}")]
    InsufficientPermissions(String),

    #[error("Insufficient remote space: {0}")]
    InsufficientSpace(String),

    /// A conditional write failed or the target path is taken
    #[error("Remote conflict: {0}")]
    Conflict(String),

    #[error("Remote server error: {0}")]
    ServerError(String),

    /// The cursor expired; listing again from a fresh cursor may succeed
    #[error("Remote cursor invalidated")]
    CursorInvalidated,

    /// The cursor can never be used again; a full reindex is required
    #[error("Remote cursor reset, full reindex required")]
    CursorReset,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication revoked or expired: {0}")]
    AuthRevoked(String),

    #[error("Restricted content: {0}")]
    RestrictedContent(String),

    /// The file type or size is not accepted by the remote
    #[error("Unsupported file: {0}")]
    UnsupportedFile(String),
}

impl RemoteError {
    /// Returns true for failures worth retrying after a short delay
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::ServerError(_) | RemoteError::Connection(_) | RemoteError::CursorInvalidated
        )
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, RemoteError::Connection(_))
    }
}

// ============================================================================
// Request and response types
// ============================================================================

/// How an upload treats an existing remote item at the target path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail with [`RemoteError::Conflict`] if the path is taken
    Add,
    /// Replace whatever is there
    Overwrite,
    /// Replace only if the remote revision is still the given one
    Update(Revision),
}

/// One page of a folder listing or of the change feed
#[derive(Debug, Clone)]
pub struct ListFolderResult {
    pub entries: Vec<Metadata>,
    /// Cursor for the next page, or the latest cursor on the last page
    pub cursor: Cursor,
    pub has_more: bool,
}

/// Outcome of a long-poll for remote changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongPollResult {
    pub changes: bool,
    /// Delay the service asks for before the next long-poll
    pub backoff: Option<Duration>,
}

/// Remote identity context under which paths are resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceInfo {
    /// Namespace that `/` refers to
    pub root_namespace_id: String,
    /// The user's own namespace
    pub home_namespace_id: String,
    /// Path of the user's home folder when the root is a team space
    pub home_path: Option<RemotePath>,
}

impl NamespaceInfo {
    /// Returns true when the root namespace is a team space
    pub fn is_team(&self) -> bool {
        self.root_namespace_id != self.home_namespace_id
    }
}

/// Transfer progress callback, called with `(completed, total)` bytes
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

// ============================================================================
// IRemoteClient trait
// ============================================================================

/// Port trait for remote storage operations
///
/// All paths are resolved in the root namespace reported by
/// [`get_namespace_info`](IRemoteClient::get_namespace_info).
#[async_trait::async_trait]
pub trait IRemoteClient: Send + Sync {
    /// Lists a folder, recursively if asked, returning the first page
    async fn list_folder(
        &self,
        path: &RemotePath,
        recursive: bool,
    ) -> Result<ListFolderResult, RemoteError>;

    /// Lists changes since `cursor`, or the next page of a listing
    async fn list_remote_changes(&self, cursor: &Cursor) -> Result<ListFolderResult, RemoteError>;

    /// Cursor for "everything below `path` seen so far" without listing
    async fn get_latest_cursor(&self, path: &RemotePath) -> Result<Cursor, RemoteError>;

    /// Blocks until changes are available after `cursor` or `timeout` passes
    async fn wait_for_remote_changes(
        &self,
        cursor: &Cursor,
        timeout: Duration,
    ) -> Result<LongPollResult, RemoteError>;

    /// Uploads a local file, chunking large files as the service requires
    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &RemotePath,
        mode: WriteMode,
        progress: Option<ProgressCallback>,
    ) -> Result<FileMetadata, RemoteError>;

    /// Downloads a remote file to `local_path`
    async fn download(
        &self,
        remote_path: &RemotePath,
        local_path: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<FileMetadata, RemoteError>;

    /// Moves or renames a remote item
    async fn move_item(&self, from: &RemotePath, to: &RemotePath) -> Result<Metadata, RemoteError>;

    /// Deletes a remote item, only if still at `expected_rev` when given
    async fn remove(
        &self,
        path: &RemotePath,
        expected_rev: Option<&Revision>,
    ) -> Result<Metadata, RemoteError>;

    /// Creates a remote folder
    ///
    /// Fails with [`RemoteError::Conflict`] if something exists at `path`.
    async fn make_dir(&self, path: &RemotePath) -> Result<FolderMetadata, RemoteError>;

    /// Metadata of the item at `path`, `None` if there is none
    async fn get_metadata(&self, path: &RemotePath) -> Result<Option<Metadata>, RemoteError>;

    async fn get_namespace_info(&self) -> Result<NamespaceInfo, RemoteError>;

    /// Cheap reachability probe
    async fn check_connection(&self) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(RemoteError::ServerError("503".into()).is_transient());
        assert!(RemoteError::CursorInvalidated.is_transient());
        assert!(!RemoteError::CursorReset.is_transient());
        assert!(!RemoteError::Conflict("taken".into()).is_transient());
        assert!(RemoteError::Connection("dns".into()).is_connection());
    }

    #[test]
    fn test_namespace_info_is_team() {
        let individual = NamespaceInfo {
            root_namespace_id: "1".into(),
            home_namespace_id: "1".into(),
            home_path: None,
        };
        assert!(!individual.is_team());

        let team = NamespaceInfo {
            root_namespace_id: "7".into(),
            home_namespace_id: "1".into(),
            home_path: Some(RemotePath::new("/Robin".to_string()).unwrap()),
        };
        assert!(team.is_team());
    }
}
