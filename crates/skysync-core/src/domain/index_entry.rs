//! Durable sync state records
//!
//! - [`IndexEntry`] - last synchronized state of one remote path
//! - [`HashCacheEntry`] - memoized fingerprint of a local file
//! - [`LocalFingerprint`] - current fingerprint of a local path

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::metadata::{ItemKind, Metadata};
use super::newtypes::{ContentHash, RemotePath, Revision};

/// Last known synchronized state of one path
///
/// Identity is the lower-cased remote path; `path_display` preserves the
/// exact casing used to rebuild the local path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub path_lower: String,
    pub path_display: RemotePath,
    pub remote_id: String,
    pub item_kind: ItemKind,
    pub last_sync: DateTime<Utc>,
    /// Revision, or the folder sentinel
    pub rev: Revision,
    /// `None` for folders
    pub content_hash: Option<ContentHash>,
}

impl IndexEntry {
    /// Entry for a file at `path` with the given revision and fingerprint
    pub fn file(
        path: RemotePath,
        remote_id: impl Into<String>,
        rev: Revision,
        content_hash: ContentHash,
    ) -> Self {
        Self {
            path_lower: path.lower(),
            path_display: path,
            remote_id: remote_id.into(),
            item_kind: ItemKind::File,
            last_sync: Utc::now(),
            rev,
            content_hash: Some(content_hash),
        }
    }

    /// Entry for a folder at `path`
    pub fn folder(path: RemotePath, remote_id: impl Into<String>) -> Self {
        Self {
            path_lower: path.lower(),
            path_display: path,
            remote_id: remote_id.into(),
            item_kind: ItemKind::Folder,
            last_sync: Utc::now(),
            rev: Revision::folder(),
            content_hash: None,
        }
    }

    /// Builds the entry recorded after `md` was synced
    ///
    /// Returns `None` for deletion markers.
    pub fn from_metadata(md: &Metadata) -> Option<Self> {
        match md {
            Metadata::File(file) => Some(Self::file(
                file.path_display.clone(),
                file.id.clone(),
                file.rev.clone(),
                file.content_hash.clone(),
            )),
            Metadata::Folder(folder) => Some(Self::folder(
                folder.path_display.clone(),
                folder.id.clone(),
            )),
            Metadata::Deleted(_) => None,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.item_kind == ItemKind::Folder
    }

    /// Fingerprint as comparable with a [`LocalFingerprint`]
    pub fn fingerprint(&self) -> LocalFingerprint {
        match (&self.item_kind, &self.content_hash) {
            (ItemKind::Folder, _) => LocalFingerprint::Folder,
            (_, Some(hash)) => LocalFingerprint::File(hash.clone()),
            (_, None) => LocalFingerprint::Absent,
        }
    }
}

/// Cached fingerprint of a local file at a given modification time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashCacheEntry {
    pub local_path: PathBuf,
    /// Modification time in nanoseconds since the Unix epoch
    pub mtime_ns: i64,
    pub content_hash: ContentHash,
}

/// Current fingerprint of a local path
///
/// Folders and missing items carry sentinels instead of a hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocalFingerprint {
    File(ContentHash),
    Folder,
    Absent,
}

impl LocalFingerprint {
    pub fn exists(&self) -> bool {
        !matches!(self, LocalFingerprint::Absent)
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, LocalFingerprint::Folder)
    }

    pub fn content_hash(&self) -> Option<&ContentHash> {
        match self {
            LocalFingerprint::File(hash) => Some(hash),
            _ => None,
        }
    }

    pub fn item_kind(&self) -> ItemKind {
        match self {
            LocalFingerprint::File(_) => ItemKind::File,
            LocalFingerprint::Folder => ItemKind::Folder,
            LocalFingerprint::Absent => ItemKind::Unknown,
        }
    }

    /// Fingerprint a remote item would have locally
    pub fn of_metadata(md: &Metadata) -> Self {
        match md {
            Metadata::File(file) => LocalFingerprint::File(file.content_hash.clone()),
            Metadata::Folder(_) => LocalFingerprint::Folder,
            Metadata::Deleted(_) => LocalFingerprint::Absent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::metadata::FolderMetadata;

    fn hash(c: char) -> ContentHash {
        ContentHash::new(c.to_string().repeat(64)).unwrap()
    }

    #[test]
    fn test_file_entry_uses_lower_key() {
        let entry = IndexEntry::file(
            RemotePath::new("/Docs/Report.PDF".to_string()).unwrap(),
            "id:1",
            Revision::new("r1".to_string()).unwrap(),
            hash('a'),
        );
        assert_eq!(entry.path_lower, "/docs/report.pdf");
        assert_eq!(entry.path_display.as_str(), "/Docs/Report.PDF");
        assert_eq!(entry.fingerprint(), LocalFingerprint::File(hash('a')));
    }

    #[test]
    fn test_folder_entry_has_sentinels() {
        let md = Metadata::Folder(FolderMetadata {
            id: "id:2".to_string(),
            path_display: RemotePath::new("/Photos".to_string()).unwrap(),
        });
        let entry = IndexEntry::from_metadata(&md).unwrap();
        assert!(entry.is_folder());
        assert!(entry.rev.is_folder());
        assert!(entry.content_hash.is_none());
        assert_eq!(entry.fingerprint(), LocalFingerprint::Folder);
        assert_eq!(LocalFingerprint::of_metadata(&md), LocalFingerprint::Folder);
    }

    #[test]
    fn test_local_fingerprint_helpers() {
        assert!(!LocalFingerprint::Absent.exists());
        assert!(LocalFingerprint::Folder.is_folder());
        assert_eq!(LocalFingerprint::File(hash('b')).item_kind(), ItemKind::File);
        assert!(LocalFingerprint::Folder.content_hash().is_none());
    }
}
