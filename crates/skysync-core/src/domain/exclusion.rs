//! Selective-sync exclusion tree
//!
//! Holds the set of remote subtrees excluded from sync. Paths are stored
//! lower-cased and the set is kept minimal: an entry never lies below
//! another entry.
//!
//! Including a path below an excluded folder re-includes every folder on
//! the way down and excludes their other children explicitly, so siblings
//! of the included path stay excluded.

use std::collections::BTreeSet;

use super::errors::DomainError;
use super::newtypes::{is_child, is_equal_or_child, path_key, RemotePath};

/// Set of excluded remote subtrees
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionTree {
    excluded: BTreeSet<String>,
}

impl ExclusionTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a tree from persisted paths, dropping redundant entries
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tree = Self::new();
        for path in paths {
            let key = path_key(path.as_ref());
            if key != "/" && !key.is_empty() {
                tree.insert_minimal(key);
            }
        }
        tree
    }

    /// Excluded paths in sorted order
    pub fn paths(&self) -> Vec<String> {
        self.excluded.iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.excluded.is_empty()
    }

    /// Returns true if `path` or one of its ancestors is excluded
    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded_ancestor(path).is_some()
    }

    /// The excluded entry covering `path`, if any
    pub fn excluded_ancestor(&self, path: &str) -> Option<&str> {
        let key = path_key(path);
        self.excluded
            .iter()
            .find(|entry| is_equal_or_child(&key, entry))
            .map(String::as_str)
    }

    /// Excludes `path` and everything below it
    ///
    /// Returns false if the path was already excluded.
    ///
    /// # Errors
    /// Returns `DomainError::RootExclusion` for the root path.
    pub fn exclude(&mut self, path: &RemotePath) -> Result<bool, DomainError> {
        if path.is_root() {
            return Err(DomainError::RootExclusion);
        }
        let key = path.lower();
        if self.is_excluded(&key) {
            return Ok(false);
        }
        self.insert_minimal(key);
        Ok(true)
    }

    /// Folders whose children must be known to include `path`
    ///
    /// These are the folders from the excluded ancestor of `path` down to
    /// the parent of `path`. Empty when `path` is not covered by an
    /// excluded ancestor.
    pub fn folders_to_expand(&self, path: &RemotePath) -> Vec<String> {
        let key = path.lower();
        let Some(ancestor) = self.excluded_ancestor(&key).map(str::to_string) else {
            return Vec::new();
        };
        if ancestor == key {
            return Vec::new();
        }

        let mut folders = Vec::new();
        let mut current = path.parent();
        while let Some(folder) = current {
            let folder_key = folder.lower();
            if !is_equal_or_child(&folder_key, &ancestor) {
                break;
            }
            folders.push(folder_key);
            current = folder.parent();
        }
        folders.reverse();
        folders
    }

    /// Includes `path` and everything below it
    ///
    /// `children_of` returns the lower-cased paths of the direct children of
    /// a remote folder. It is called for each folder returned by
    /// [`folders_to_expand`](Self::folders_to_expand). Returns the paths that
    /// became included and must be downloaded.
    ///
    /// # Errors
    /// Returns `DomainError::RootExclusion` when asked to include the root
    /// while it is implied by an entry, which cannot happen for a valid tree.
    pub fn include<F>(&mut self, path: &RemotePath, mut children_of: F) -> Result<Vec<String>, DomainError>
    where
        F: FnMut(&str) -> Vec<String>,
    {
        let key = path.lower();
        let mut included = Vec::new();

        // Excluded descendants become included with the path itself.
        let below: Vec<String> = self
            .excluded
            .iter()
            .filter(|entry| is_child(entry, &key))
            .cloned()
            .collect();
        for entry in below {
            self.excluded.remove(&entry);
            included.push(entry);
        }

        if self.excluded.remove(&key) {
            included.push(key.clone());
        } else if let Some(ancestor) = self.excluded_ancestor(&key).map(str::to_string) {
            if ancestor == "/" {
                return Err(DomainError::RootExclusion);
            }
            let chain = self.folders_to_expand(path);
            self.excluded.remove(&ancestor);
            for (idx, folder) in chain.iter().enumerate() {
                let next = chain.get(idx + 1).cloned().unwrap_or_else(|| key.clone());
                for child in children_of(folder) {
                    let child = path_key(&child);
                    if child != next && is_child(&child, folder) {
                        self.excluded.insert(child);
                    }
                }
            }
            included.push(key);
        }

        included.sort();
        included.dedup();
        // Descendants of the included path are covered by the path itself.
        if included.iter().any(|p| *p == path.lower()) {
            included.retain(|p| *p == path.lower());
        }
        Ok(included)
    }

    /// Drops entries at or below a remotely deleted path
    ///
    /// Returns true if any entry was removed.
    pub fn remove_deleted(&mut self, path: &str) -> bool {
        let key = path_key(path);
        let before = self.excluded.len();
        self.excluded.retain(|entry| !is_equal_or_child(entry, &key));
        before != self.excluded.len()
    }

    /// Rewrites entries below `old` to lie below `new`
    ///
    /// Entries outside `old` are dropped when `keep_others` is false.
    pub fn rewrite_prefix(&mut self, old: &RemotePath, new: &RemotePath, keep_others: bool) {
        let old_key = old.lower();
        let new_key = new.lower();
        let rewritten: BTreeSet<String> = self
            .excluded
            .iter()
            .filter_map(|entry| {
                if old_key == "/" {
                    let joined = if new_key == "/" {
                        entry.clone()
                    } else {
                        format!("{new_key}{entry}")
                    };
                    return Some(joined);
                }
                if entry == &old_key {
                    return Some(new_key.clone());
                }
                if is_child(entry, &old_key) {
                    let rest = &entry[old_key.len()..];
                    return Some(if new_key == "/" {
                        rest.to_string()
                    } else {
                        format!("{new_key}{rest}")
                    });
                }
                keep_others.then(|| entry.clone())
            })
            .filter(|entry| entry != "/")
            .collect();
        self.excluded = BTreeSet::new();
        for entry in rewritten {
            self.insert_minimal(entry);
        }
    }

    fn insert_minimal(&mut self, key: String) {
        if self.excluded.iter().any(|entry| is_equal_or_child(&key, entry)) {
            return;
        }
        self.excluded.retain(|entry| !is_child(entry, &key));
        self.excluded.insert(key);
    }
}
