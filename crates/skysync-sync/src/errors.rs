//! Error taxonomy of the sync engine
//!
//! - [`SyncError`] - one item failed; shown to the user, the engine keeps going
//! - [`FatalError`] - syncing stops until the user acts
//! - [`EngineError`] - what engine operations return; connection loss is
//!   its own variant because it only pauses the workers

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use skysync_conflict::ConflictError;
use skysync_core::domain::{DomainError, RemotePath};
use skysync_core::ports::{IndexCorruption, RemoteError};

/// ENOSPC on Linux and macOS
#[cfg(unix)]
const NO_SPACE_LEFT: i32 = 28;

/// Category of a per-item error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    PermissionDenied,
    PathInvalid,
    InsufficientSpace,
    Conflict,
    UnsupportedFile,
    ServerError,
    RestrictedContent,
    NotFound,
    Io,
}

impl SyncErrorKind {
    pub fn title(&self) -> &'static str {
        match self {
            SyncErrorKind::PermissionDenied => "Permission denied",
            SyncErrorKind::PathInvalid => "Invalid name",
            SyncErrorKind::InsufficientSpace => "Insufficient space",
            SyncErrorKind::Conflict => "Conflict",
            SyncErrorKind::UnsupportedFile => "Unsupported file",
            SyncErrorKind::ServerError => "Server error",
            SyncErrorKind::RestrictedContent => "Restricted content",
            SyncErrorKind::NotFound => "Item not found",
            SyncErrorKind::Io => "Could not access item",
        }
    }
}

impl std::fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.title())
    }
}

/// A recoverable failure of one item
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[error("{kind}: {cause}")]
pub struct SyncError {
    pub kind: SyncErrorKind,
    pub local_path: Option<PathBuf>,
    pub remote_path: Option<RemotePath>,
    pub cause: String,
}

impl SyncError {
    pub fn new(kind: SyncErrorKind, cause: impl Into<String>) -> Self {
        Self {
            kind,
            local_path: None,
            remote_path: None,
            cause: cause.into(),
        }
    }

    pub fn with_local(mut self, path: &Path) -> Self {
        self.local_path = Some(path.to_path_buf());
        self
    }

    pub fn with_remote(mut self, path: &RemotePath) -> Self {
        self.remote_path = Some(path.clone());
        self
    }

    /// Fills in paths the error does not carry yet
    fn located(mut self, local: Option<&Path>, remote: Option<&RemotePath>) -> Self {
        if self.local_path.is_none() {
            self.local_path = local.map(Path::to_path_buf);
        }
        if self.remote_path.is_none() {
            self.remote_path = remote.cloned();
        }
        self
    }
}

/// A failure that stops syncing
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FatalError {
    #[error("Sync folder {0} is missing or was moved")]
    RootMissing(PathBuf),

    #[error("Limit of watched folders reached; raise fs.inotify.max_user_watches")]
    WatchLimit,

    #[error("Authentication revoked or expired: {0}")]
    AuthRevoked(String),

    #[error("Remote cursor cannot be used anymore, a full reindex is required")]
    CursorReset,

    #[error("Sync index is corrupt: {0}")]
    IndexCorrupted(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Error returned by engine operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Fatal(#[from] FatalError),

    /// The remote is unreachable; workers wait for the connection to return
    #[error("Connection lost: {0}")]
    Connection(String),

    #[error("Sync cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Fatal(_))
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, EngineError::Connection(_))
    }

    /// Classifies a remote failure of the item at the given paths
    pub fn from_remote(err: RemoteError, local: Option<&Path>, remote: Option<&RemotePath>) -> Self {
        let kind = match err {
            RemoteError::Connection(msg) => return EngineError::Connection(msg),
            RemoteError::AuthRevoked(msg) => return FatalError::AuthRevoked(msg).into(),
            RemoteError::CursorReset | RemoteError::CursorInvalidated => {
                return FatalError::CursorReset.into()
            }
            RemoteError::NotFound(_) => SyncErrorKind::NotFound,
            RemoteError::PathInvalid(_) => SyncErrorKind::PathInvalid,
            RemoteError::InsufficientPermissions(_) => SyncErrorKind::PermissionDenied,
            RemoteError::InsufficientSpace(_) => SyncErrorKind::InsufficientSpace,
            RemoteError::Conflict(_) => SyncErrorKind::Conflict,
            RemoteError::ServerError(_) => SyncErrorKind::ServerError,
            RemoteError::RestrictedContent(_) => SyncErrorKind::RestrictedContent,
            RemoteError::UnsupportedFile(_) => SyncErrorKind::UnsupportedFile,
        };
        SyncError::new(kind, err.to_string())
            .located(local, remote)
            .into()
    }

    /// Classifies a local I/O failure
    pub fn from_io(err: &io::Error, local: Option<&Path>, remote: Option<&RemotePath>) -> Self {
        #[cfg(unix)]
        if err.raw_os_error() == Some(NO_SPACE_LEFT) {
            return SyncError::new(SyncErrorKind::InsufficientSpace, err.to_string())
                .located(local, remote)
                .into();
        }
        let kind = match err.kind() {
            io::ErrorKind::PermissionDenied => SyncErrorKind::PermissionDenied,
            io::ErrorKind::NotFound => SyncErrorKind::NotFound,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => SyncErrorKind::PathInvalid,
            _ => SyncErrorKind::Io,
        };
        SyncError::new(kind, err.to_string())
            .located(local, remote)
            .into()
    }

    /// Classifies an error from the index, the state store or a filesystem
    /// helper by looking through its chain
    ///
    /// Anything that cannot be attributed to the item is fatal.
    pub fn from_anyhow(err: anyhow::Error, local: Option<&Path>, remote: Option<&RemotePath>) -> Self {
        if let Some(engine) = err.downcast_ref::<EngineError>() {
            return engine.clone();
        }
        for cause in err.chain() {
            if let Some(sync) = cause.downcast_ref::<SyncError>() {
                return sync.clone().located(local, remote).into();
            }
            if let Some(corrupt) = cause.downcast_ref::<IndexCorruption>() {
                return FatalError::IndexCorrupted(corrupt.0.clone()).into();
            }
            if let Some(remote_err) = cause.downcast_ref::<RemoteError>() {
                return Self::from_remote(remote_err.clone(), local, remote);
            }
            if let Some(io_err) = cause.downcast_ref::<io::Error>() {
                if local.is_some() {
                    return Self::from_io(io_err, local, remote);
                }
            }
            if let Some(conflict) = cause.downcast_ref::<ConflictError>() {
                if !matches!(conflict, ConflictError::Io(_)) {
                    return SyncError::new(SyncErrorKind::Conflict, conflict.to_string())
                        .located(local, remote)
                        .into();
                }
            }
            if let Some(domain) = cause.downcast_ref::<DomainError>() {
                return SyncError::new(SyncErrorKind::PathInvalid, domain.to_string())
                    .located(local, remote)
                    .into();
            }
        }
        FatalError::Unexpected(format!("{err:#}")).into()
    }
}

/// Attributes failures of one item to its paths
pub(crate) trait ItemResultExt<T> {
    fn for_item(self, local: &Path, remote: &RemotePath) -> EngineResult<T>;
}

impl<T> ItemResultExt<T> for anyhow::Result<T> {
    fn for_item(self, local: &Path, remote: &RemotePath) -> EngineResult<T> {
        self.map_err(|e| EngineError::from_anyhow(e, Some(local), Some(remote)))
    }
}

impl<T> ItemResultExt<T> for Result<T, RemoteError> {
    fn for_item(self, local: &Path, remote: &RemotePath) -> EngineResult<T> {
        self.map_err(|e| EngineError::from_remote(e, Some(local), Some(remote)))
    }
}

impl<T> ItemResultExt<T> for EngineResult<T> {
    fn for_item(self, local: &Path, remote: &RemotePath) -> EngineResult<T> {
        self.map_err(|e| match e {
            EngineError::Sync(err) => EngineError::Sync(err.located(Some(local), Some(remote))),
            other => other,
        })
    }
}

impl From<RemoteError> for EngineError {
    fn from(err: RemoteError) -> Self {
        EngineError::from_remote(err, None, None)
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::from_anyhow(err, None, None)
    }
}

impl From<DomainError> for EngineError {
    fn from(err: DomainError) -> Self {
        SyncError::new(SyncErrorKind::PathInvalid, err.to_string()).into()
    }
}

impl From<ConflictError> for EngineError {
    fn from(err: ConflictError) -> Self {
        match err {
            ConflictError::Io(io_err) => EngineError::from_io(&io_err, None, None),
            other => SyncError::new(SyncErrorKind::Conflict, other.to_string()).into(),
        }
    }
}

/// Result type of engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_remote_errors_are_classified() {
        let remote = RemotePath::new("/a.txt".into()).unwrap();
        let err = EngineError::from_remote(
            RemoteError::InsufficientSpace("quota".into()),
            Some(Path::new("/r/a.txt")),
            Some(&remote),
        );
        match err {
            EngineError::Sync(sync) => {
                assert_eq!(sync.kind, SyncErrorKind::InsufficientSpace);
                assert_eq!(sync.local_path.as_deref(), Some(Path::new("/r/a.txt")));
                assert_eq!(sync.remote_path, Some(remote));
            }
            other => panic!("expected sync error, got {other:?}"),
        }

        assert!(EngineError::from(RemoteError::Connection("offline".into())).is_connection());
        assert_eq!(
            EngineError::from(RemoteError::AuthRevoked("expired".into())),
            EngineError::Fatal(FatalError::AuthRevoked("expired".into()))
        );
        assert_eq!(
            EngineError::from(RemoteError::CursorReset),
            EngineError::Fatal(FatalError::CursorReset)
        );
    }

    #[test]
    fn test_io_errors_are_per_item() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        let engine = EngineError::from_io(&err, Some(Path::new("/r/x")), None);
        assert!(matches!(
            engine,
            EngineError::Sync(SyncError { kind: SyncErrorKind::PermissionDenied, .. })
        ));

        #[cfg(unix)]
        {
            let full = io::Error::from_raw_os_error(NO_SPACE_LEFT);
            assert!(matches!(
                EngineError::from_io(&full, None, None),
                EngineError::Sync(SyncError { kind: SyncErrorKind::InsufficientSpace, .. })
            ));
        }
    }

    #[test]
    fn test_anyhow_chain_is_searched() {
        let corrupt = anyhow::Error::new(IndexCorruption("bad rev".into())).context("Failed to read index");
        assert_eq!(
            EngineError::from(corrupt),
            EngineError::Fatal(FatalError::IndexCorrupted("bad rev".into()))
        );

        let io_failure: anyhow::Result<()> =
            Err(io::Error::new(io::ErrorKind::NotFound, "gone")).context("Failed to stat /r/x");
        let engine = EngineError::from_anyhow(io_failure.unwrap_err(), Some(Path::new("/r/x")), None);
        assert!(matches!(
            engine,
            EngineError::Sync(SyncError { kind: SyncErrorKind::NotFound, .. })
        ));

        let exhausted = anyhow::Error::new(ConflictError::NamesExhausted {
            name: "a.txt".into(),
            attempts: 3,
        });
        assert!(matches!(
            EngineError::from_anyhow(exhausted, Some(Path::new("/r/a.txt")), None),
            EngineError::Sync(SyncError { kind: SyncErrorKind::Conflict, .. })
        ));

        let item = anyhow::Error::new(SyncError::new(SyncErrorKind::Conflict, "taken"));
        let remote = RemotePath::new("/a.txt".into()).unwrap();
        match EngineError::from_anyhow(item, None, Some(&remote)) {
            EngineError::Sync(sync) => assert_eq!(sync.remote_path, Some(remote)),
            other => panic!("expected sync error, got {other:?}"),
        }

        let unknown = anyhow::anyhow!("disk on fire");
        assert!(EngineError::from(unknown).is_fatal());
    }
}
