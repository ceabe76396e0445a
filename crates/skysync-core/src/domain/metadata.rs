//! Remote item metadata
//!
//! Every entry returned by the remote client is exactly one of a file, a
//! folder, or a deletion marker. [`Metadata`] is a closed sum type so that
//! consumers match exhaustively instead of probing for fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{ContentHash, RemotePath, Revision};

/// Kind of item a path refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    File,
    Folder,
    /// The kind is not known (e.g. a deletion of an item never indexed)
    Unknown,
}

impl ItemKind {
    /// Returns the kind name as stored in the index
    pub fn name(&self) -> &'static str {
        match self {
            ItemKind::File => "file",
            ItemKind::Folder => "folder",
            ItemKind::Unknown => "unknown",
        }
    }

    /// Parses a stored kind name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "file" => Some(ItemKind::File),
            "folder" => Some(ItemKind::Folder),
            "unknown" => Some(ItemKind::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Metadata of a remote file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Stable remote item id
    pub id: String,
    pub path_display: RemotePath,
    pub rev: Revision,
    pub content_hash: ContentHash,
    pub size: u64,
    pub client_modified: DateTime<Utc>,
    pub server_modified: DateTime<Utc>,
    /// Display name of the account that last changed the file, when shared
    pub modified_by: Option<String>,
}

/// Metadata of a remote folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderMetadata {
    pub id: String,
    pub path_display: RemotePath,
}

/// Marker for a remote item that was deleted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedMetadata {
    pub path_display: RemotePath,
}

/// A remote item as reported by listings and the change feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Metadata {
    File(FileMetadata),
    Folder(FolderMetadata),
    Deleted(DeletedMetadata),
}

impl Metadata {
    pub fn path_display(&self) -> &RemotePath {
        match self {
            Metadata::File(md) => &md.path_display,
            Metadata::Folder(md) => &md.path_display,
            Metadata::Deleted(md) => &md.path_display,
        }
    }

    pub fn path_lower(&self) -> String {
        self.path_display().lower()
    }

    /// Item kind; deletions report [`ItemKind::Unknown`]
    pub fn item_kind(&self) -> ItemKind {
        match self {
            Metadata::File(_) => ItemKind::File,
            Metadata::Folder(_) => ItemKind::Folder,
            Metadata::Deleted(_) => ItemKind::Unknown,
        }
    }

    /// Revision, with the folder sentinel for folders
    pub fn rev(&self) -> Option<Revision> {
        match self {
            Metadata::File(md) => Some(md.rev.clone()),
            Metadata::Folder(_) => Some(Revision::folder()),
            Metadata::Deleted(_) => None,
        }
    }

    pub fn content_hash(&self) -> Option<&ContentHash> {
        match self {
            Metadata::File(md) => Some(&md.content_hash),
            _ => None,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Metadata::File(md) => Some(&md.id),
            Metadata::Folder(md) => Some(&md.id),
            Metadata::Deleted(_) => None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Metadata::Deleted(_))
    }
}
