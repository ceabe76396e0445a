//! Local filesystem helpers
//!
//! Thin async wrappers over `tokio::fs` used by the engine, plus the rules
//! for names the engine never syncs.
//!
//! ## Design Decisions
//!
//! - **Staging**: downloads land in `<root>/.skysync.cache/<uuid>` and are
//!   renamed into place, so a partial transfer never appears at its final
//!   path and the rename stays on one filesystem.
//! - **Case**: the remote is case-insensitive, so lookups for an existing
//!   local item compare directory entries case-insensitively.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Staging directory for downloads, below the sync root
pub const STAGING_DIR_NAME: &str = ".skysync.cache";

/// Prefix of the staging directory used by namespace migrations
pub const MIGRATION_DIR_PREFIX: &str = ".skysync-migration-";

/// Returns true for names that are never synced
pub fn is_internal_name(name: &str) -> bool {
    name == STAGING_DIR_NAME
        || name.starts_with(MIGRATION_DIR_PREFIX)
        || name == ".DS_Store"
        || name.starts_with("~$")
        || name.ends_with(".tmp")
}

/// Returns true if any component of `path` below `root` is internal
pub fn is_internal_path(root: &Path, path: &Path) -> bool {
    match path.strip_prefix(root) {
        Ok(relative) => relative
            .components()
            .any(|c| is_internal_name(&c.as_os_str().to_string_lossy())),
        Err(_) => false,
    }
}

/// Modification time in nanoseconds since the Unix epoch
pub fn mtime_ns(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Metadata of a path without following symlinks, `None` if missing
pub async fn stat(path: &Path) -> Result<Option<std::fs::Metadata>> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path.display())),
    }
}

/// A fresh path in the download staging directory
pub async fn new_staging_path(root: &Path) -> Result<PathBuf> {
    let dir = root.join(STAGING_DIR_NAME);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create staging directory {}", dir.display()))?;
    Ok(dir.join(Uuid::new_v4().to_string()))
}

/// Removes leftovers of interrupted downloads
pub async fn clean_staging(root: &Path) -> Result<()> {
    remove_item(&root.join(STAGING_DIR_NAME)).await.map(|_| ())
}

/// Finds an existing item whose path matches `path` case-insensitively
///
/// Only the last component is compared case-insensitively; the parent must
/// exist as given.
pub async fn find_case_insensitive(path: &Path) -> Result<Option<PathBuf>> {
    if stat(path).await?.is_some() {
        return Ok(Some(path.to_path_buf()));
    }
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return Ok(None);
    };
    let wanted = name.to_string_lossy().to_lowercase();

    let mut entries = match tokio::fs::read_dir(parent).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {}", parent.display())),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().to_lowercase() == wanted {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

/// Deletes a file or a directory tree, returning false if nothing was there
#[instrument(fields(path = %path.display()))]
pub async fn remove_item(path: &Path) -> Result<bool> {
    let Some(meta) = stat(path).await? else {
        return Ok(false);
    };
    let result = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => {
            debug!("Removed local item");
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
    }
}

/// Renames an item, creating the destination's parent if needed
#[instrument(fields(src = %src.display(), dest = %dest.display()))]
pub async fn move_item(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::rename(src, dest)
        .await
        .with_context(|| format!("Failed to move {} to {}", src.display(), dest.display()))?;
    debug!("Moved local item");
    Ok(())
}

/// Creates a directory and its parents
pub async fn ensure_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create directory {}", path.display()))
}

/// Direct children of `dir`, skipping internal names
pub async fn read_children(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut reader = match tokio::fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
    };
    let mut children = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        if !is_internal_name(&entry.file_name().to_string_lossy()) {
            children.push(entry.path());
        }
    }
    children.sort();
    Ok(children)
}

/// One item found by [`walk`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub path: PathBuf,
    pub is_dir: bool,
    pub mtime_ns: i64,
    pub size: u64,
}

/// Lists everything below `dir`, parents before children, skipping
/// internal names and symlinks
pub async fn walk(root: &Path, dir: &Path) -> Result<Vec<LocalEntry>> {
    let mut entries = Vec::new();
    walk_into(root, dir, &mut entries).await?;
    Ok(entries)
}

fn walk_into<'a>(
    root: &'a Path,
    dir: &'a Path,
    out: &'a mut Vec<LocalEntry>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let mut reader = match tokio::fs::read_dir(dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read directory: {}", dir.display()))
            }
        };

        let mut children = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let path = entry.path();
            if is_internal_path(root, &path) {
                continue;
            }
            let meta = match tokio::fs::symlink_metadata(&path).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if meta.file_type().is_symlink() {
                debug!(path = %path.display(), "Skipping symlink");
                continue;
            }
            children.push(LocalEntry {
                path,
                is_dir: meta.is_dir(),
                mtime_ns: mtime_ns(&meta),
                size: meta.len(),
            });
        }
        children.sort_by(|a, b| a.path.cmp(&b.path));

        for child in children {
            let subdir = child.is_dir.then(|| child.path.clone());
            out.push(child);
            if let Some(subdir) = subdir {
                walk_into(root, &subdir, out).await?;
            }
        }
        Ok(())
    })
}
