//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for remote paths, revisions, content hashes and
//! cursors. Each newtype ensures data validity at construction time.
//!
//! Remote paths are case-insensitive on the server. [`RemotePath`] keeps the
//! display casing and exposes [`RemotePath::lower`] as the identity key.

use std::fmt::{self, Display, Formatter};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

// ============================================================================
// Path helpers
// ============================================================================

/// Returns the case-insensitive identity key of a remote path
#[must_use]
pub fn path_key(path: &str) -> String {
    path.to_lowercase()
}

/// Returns true if `child` lies strictly below `parent` (both lower-cased)
#[must_use]
pub fn is_child(child: &str, parent: &str) -> bool {
    if parent == "/" {
        return child.len() > 1 && child.starts_with('/');
    }
    child.len() > parent.len() + 1
        && child.starts_with(parent)
        && child.as_bytes()[parent.len()] == b'/'
}

/// Returns true if `path` equals `parent` or lies below it (both lower-cased)
#[must_use]
pub fn is_equal_or_child(path: &str, parent: &str) -> bool {
    path == parent || is_child(path, parent)
}

// ============================================================================
// RemotePath
// ============================================================================

/// A display-cased path on the remote replica
///
/// Always absolute, `/` separated, with no empty or traversal components.
/// The root is `/`. Equality is case-sensitive; use [`RemotePath::lower`]
/// for identity comparisons.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemotePath(String);

impl RemotePath {
    /// Create a new RemotePath
    ///
    /// # Errors
    /// Returns error if the path is not absolute, contains empty components
    /// or contains `.`/`..` components
    pub fn new(path: String) -> Result<Self, DomainError> {
        if !path.starts_with('/') {
            return Err(DomainError::InvalidRemotePath(format!(
                "Remote path must start with '/': {path}"
            )));
        }

        if path == "/" {
            return Ok(Self(path));
        }

        if path.ends_with('/') {
            return Err(DomainError::InvalidRemotePath(format!(
                "Remote path must not end with '/': {path}"
            )));
        }

        for component in path[1..].split('/') {
            if component.is_empty() {
                return Err(DomainError::InvalidRemotePath(format!(
                    "Remote path contains invalid double slashes: {path}"
                )));
            }
            if component == "." || component == ".." {
                return Err(DomainError::InvalidRemotePath(format!(
                    "Remote path contains invalid traversal: {path}"
                )));
            }
        }

        Ok(Self(path))
    }

    /// Create the root path "/"
    #[must_use]
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lower-cased identity key
    #[must_use]
    pub fn lower(&self) -> String {
        path_key(&self.0)
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Number of components below the root (`/` is 0, `/a/b` is 2)
    #[must_use]
    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.0.matches('/').count()
        }
    }

    /// Join a path component
    ///
    /// # Errors
    /// Returns error if component is invalid
    pub fn join(&self, component: &str) -> Result<Self, DomainError> {
        if component.is_empty() || component.contains('/') || component == ".." {
            return Err(DomainError::InvalidRemotePath(format!(
                "Invalid path component: {component}"
            )));
        }

        let new_path = if self.is_root() {
            format!("/{component}")
        } else {
            format!("{}/{component}", self.0)
        };

        Self::new(new_path)
    }

    /// Get the parent path
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }

        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Get the file name component
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }

        self.0.rsplit('/').next()
    }

    /// Returns a sibling path with the given file name
    ///
    /// # Errors
    /// Returns error for the root path or an invalid name
    pub fn with_file_name(&self, name: &str) -> Result<Self, DomainError> {
        let parent = self.parent().ok_or_else(|| {
            DomainError::InvalidRemotePath("The root has no file name".to_string())
        })?;
        parent.join(name)
    }

    /// Case-insensitive check whether `self` lies strictly below `ancestor`
    #[must_use]
    pub fn is_descendant_of(&self, ancestor: &RemotePath) -> bool {
        is_child(&self.lower(), &ancestor.lower())
    }

    /// Replaces a case-insensitive `old` prefix with `new`
    ///
    /// Returns `None` if `self` is neither `old` nor below it.
    #[must_use]
    pub fn replace_prefix(&self, old: &RemotePath, new: &RemotePath) -> Option<RemotePath> {
        let lower = self.lower();
        let old_lower = old.lower();
        if lower == old_lower {
            return Some(new.clone());
        }
        if !is_child(&lower, &old_lower) {
            return None;
        }
        let rest = self.0[1..]
            .split('/')
            .skip(old.depth())
            .collect::<Vec<_>>()
            .join("/");
        if new.is_root() {
            Some(Self(format!("/{rest}")))
        } else {
            Some(Self(format!("{}/{rest}", new.0)))
        }
    }

    /// Builds the remote path mirrored by a local path under `root`
    ///
    /// # Errors
    /// Returns `DomainError::PathNotInSyncRoot` if `local` is outside `root`
    /// and `DomainError::InvalidPath` for non-UTF-8 components
    pub fn from_local(root: &Path, local: &Path) -> Result<Self, DomainError> {
        let relative = local
            .strip_prefix(root)
            .map_err(|_| DomainError::PathNotInSyncRoot(local.display().to_string()))?;

        let mut path = String::new();
        for component in relative.components() {
            match component {
                Component::Normal(name) => {
                    let name = name.to_str().ok_or_else(|| {
                        DomainError::InvalidPath(format!(
                            "Path is not valid UTF-8: {}",
                            local.display()
                        ))
                    })?;
                    path.push('/');
                    path.push_str(name);
                }
                Component::CurDir => {}
                _ => {
                    return Err(DomainError::InvalidPath(format!(
                        "Unexpected path component in {}",
                        local.display()
                    )))
                }
            }
        }

        if path.is_empty() {
            return Ok(Self::root());
        }
        Self::new(path)
    }

    /// Local path for this remote path under `root`
    #[must_use]
    pub fn to_local(&self, root: &Path) -> PathBuf {
        if self.is_root() {
            return root.to_path_buf();
        }
        self.0[1..]
            .split('/')
            .fold(root.to_path_buf(), |acc, part| acc.join(part))
    }
}

impl Display for RemotePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RemotePath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for RemotePath {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RemotePath> for String {
    fn from(path: RemotePath) -> Self {
        path.0
    }
}

// ============================================================================
// ContentHash
// ============================================================================

/// Remote-compatible content fingerprint
///
/// Format: 64 lower-case hex characters (SHA-256 over the concatenated
/// SHA-256 digests of 4 MiB blocks).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Create a new ContentHash
    ///
    /// # Errors
    /// Returns error if the string is not 64 hex characters
    pub fn new(hash: String) -> Result<Self, DomainError> {
        if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DomainError::InvalidHash(format!(
                "Expected 64 hex characters: {hash}"
            )));
        }
        Ok(Self(hash.to_ascii_lowercase()))
    }

    /// Wraps a raw SHA-256 digest
    #[must_use]
    pub fn from_digest(digest: &[u8; 32]) -> Self {
        Self(hex::encode(digest))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContentHash {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for ContentHash {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

// ============================================================================
// Revision
// ============================================================================

/// Opaque remote revision identifier
///
/// Folders have no server revision and use the [`Revision::FOLDER`] sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision(String);

impl Revision {
    /// Sentinel revision stored for folders
    pub const FOLDER: &'static str = "folder";

    /// # Errors
    /// Returns error if the revision is empty
    pub fn new(rev: String) -> Result<Self, DomainError> {
        if rev.trim().is_empty() {
            return Err(DomainError::InvalidRevision(
                "Revision cannot be empty".to_string(),
            ));
        }
        Ok(Self(rev))
    }

    #[must_use]
    pub fn folder() -> Self {
        Self(Self::FOLDER.to_string())
    }

    #[must_use]
    pub fn is_folder(&self) -> bool {
        self.0 == Self::FOLDER
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Revision {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for Revision {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<Revision> for String {
    fn from(rev: Revision) -> Self {
        rev.0
    }
}

// ============================================================================
// Cursor
// ============================================================================

/// Opaque token for "all remote changes observed so far"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cursor(String);

impl Cursor {
    /// # Errors
    /// Returns error if the cursor is empty
    pub fn new(cursor: String) -> Result<Self, DomainError> {
        if cursor.is_empty() {
            return Err(DomainError::InvalidCursor(
                "Cursor cannot be empty".to_string(),
            ));
        }
        Ok(Self(cursor))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Cursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Cursor {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<Cursor> for String {
    fn from(cursor: Cursor) -> Self {
        cursor.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod helper_tests {
        use super::*;

        #[test]
        fn test_is_child() {
            assert!(is_child("/a/b", "/a"));
            assert!(is_child("/a", "/"));
            assert!(!is_child("/ab", "/a"));
            assert!(!is_child("/a", "/a"));
            assert!(!is_child("/", "/"));
        }

        #[test]
        fn test_is_equal_or_child() {
            assert!(is_equal_or_child("/a", "/a"));
            assert!(is_equal_or_child("/a/b/c", "/a"));
            assert!(!is_equal_or_child("/b", "/a"));
        }
    }

    mod remote_path_tests {
        use super::*;

        #[test]
        fn test_new_valid() {
            let path = RemotePath::new("/Documents/file.txt".to_string()).unwrap();
            assert_eq!(path.as_str(), "/Documents/file.txt");
            assert_eq!(path.lower(), "/documents/file.txt");
        }

        #[test]
        fn test_invalid_paths() {
            assert!(RemotePath::new("Documents".to_string()).is_err());
            assert!(RemotePath::new("/Documents//file.txt".to_string()).is_err());
            assert!(RemotePath::new("/Documents/../file.txt".to_string()).is_err());
            assert!(RemotePath::new("/Documents/".to_string()).is_err());
        }

        #[test]
        fn test_dotted_names_are_allowed() {
            let path = RemotePath::new("/notes..old/a.txt".to_string()).unwrap();
            assert_eq!(path.depth(), 2);
        }

        #[test]
        fn test_parent_and_depth() {
            let path = RemotePath::new("/A/b/c.txt".to_string()).unwrap();
            assert_eq!(path.depth(), 3);
            assert_eq!(path.parent().unwrap().as_str(), "/A/b");
            assert_eq!(RemotePath::root().depth(), 0);
            assert!(RemotePath::root().parent().is_none());
        }

        #[test]
        fn test_descendant_is_case_insensitive() {
            let child = RemotePath::new("/Photos/2024/img.jpg".to_string()).unwrap();
            let parent = RemotePath::new("/photos".to_string()).unwrap();
            assert!(child.is_descendant_of(&parent));
            assert!(!parent.is_descendant_of(&parent));
        }

        #[test]
        fn test_replace_prefix() {
            let path = RemotePath::new("/Work/report.txt".to_string()).unwrap();
            let old = RemotePath::new("/work".to_string()).unwrap();
            let new = RemotePath::new("/Team/Work".to_string()).unwrap();
            assert_eq!(
                path.replace_prefix(&old, &new).unwrap().as_str(),
                "/Team/Work/report.txt"
            );

            let moved = path
                .replace_prefix(&RemotePath::root(), &RemotePath::new("/Home".to_string()).unwrap())
                .unwrap();
            assert_eq!(moved.as_str(), "/Home/Work/report.txt");

            let other = RemotePath::new("/Other".to_string()).unwrap();
            assert!(other.replace_prefix(&old, &new).is_none());
        }

        #[test]
        fn test_local_round_trip() {
            let root = Path::new("/home/user/Sky");
            let local = Path::new("/home/user/Sky/Docs/a b.txt");
            let remote = RemotePath::from_local(root, local).unwrap();
            assert_eq!(remote.as_str(), "/Docs/a b.txt");
            assert_eq!(remote.to_local(root), local);

            assert!(RemotePath::from_local(root, root).unwrap().is_root());
            assert!(RemotePath::from_local(root, Path::new("/tmp/x")).is_err());
        }
    }

    mod content_hash_tests {
        use super::*;

        #[test]
        fn test_valid_hash_is_lowercased() {
            let raw = "E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855";
            let hash = ContentHash::new(raw.to_string()).unwrap();
            assert_eq!(hash.as_str(), raw.to_ascii_lowercase());
        }

        #[test]
        fn test_invalid_hash() {
            assert!(ContentHash::new("abc".to_string()).is_err());
            assert!(ContentHash::new("z".repeat(64)).is_err());
        }
    }

    mod revision_tests {
        use super::*;

        #[test]
        fn test_folder_sentinel() {
            assert!(Revision::folder().is_folder());
            assert!(!Revision::new("015f".to_string()).unwrap().is_folder());
            assert!(Revision::new(" ".to_string()).is_err());
        }

        #[test]
        fn test_cursor_rejects_empty() {
            assert!(Cursor::new(String::new()).is_err());
            assert_eq!(Cursor::new("c1".to_string()).unwrap().as_str(), "c1");
        }
    }
}
