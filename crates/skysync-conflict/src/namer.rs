//! Conflict naming
//!
//! Generates names for renamed copies, following the pattern
//! `stem (conflicting copy).ext`, then `stem (conflicting copy 1).ext` and so
//! on until a name is free. Existence is always checked case-insensitively,
//! since the remote treats paths that differ only in case as the same item.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::ConflictError;

/// Upper bound on numbered candidates
const MAX_ATTEMPTS: u32 = 1000;

/// Why an item is being renamed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictSuffix {
    /// Local and remote changes to the same item diverged
    ConflictingCopy,
    /// A local item was created at a path excluded from sync
    SelectiveSyncConflict,
}

impl ConflictSuffix {
    pub fn label(&self) -> &'static str {
        match self {
            ConflictSuffix::ConflictingCopy => "conflicting copy",
            ConflictSuffix::SelectiveSyncConflict => "selective sync conflict",
        }
    }
}

/// Generates unique conflict names
pub struct ConflictNamer;

impl ConflictNamer {
    /// Splits a file name into stem and extension (with its dot)
    ///
    /// Folders and dot-files without a further dot have no extension.
    pub fn split_name(name: &str, is_dir: bool) -> (&str, &str) {
        if is_dir {
            return (name, "");
        }
        match name.rfind('.') {
            Some(0) | None => (name, ""),
            Some(dot_pos) => (&name[..dot_pos], &name[dot_pos..]),
        }
    }

    /// The `attempt`-th candidate; 0 has no number
    ///
    /// Given "report.docx", attempt 0 gives "report (conflicting copy).docx"
    /// and attempt 2 gives "report (conflicting copy 2).docx".
    pub fn candidate(name: &str, is_dir: bool, suffix: ConflictSuffix, attempt: u32) -> String {
        let (stem, ext) = Self::split_name(name, is_dir);
        let label = suffix.label();
        if attempt == 0 {
            format!("{stem} ({label}){ext}")
        } else {
            format!("{stem} ({label} {attempt}){ext}")
        }
    }

    /// First candidate for which `exists` returns false
    ///
    /// `exists` receives each candidate name and must compare
    /// case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns `ConflictError::NamesExhausted` if every candidate is taken.
    pub fn generate_unique<F>(
        name: &str,
        is_dir: bool,
        suffix: ConflictSuffix,
        mut exists: F,
    ) -> Result<String, ConflictError>
    where
        F: FnMut(&str) -> bool,
    {
        Self::generate_unique_from(name, is_dir, suffix, 0, &mut exists)
    }

    /// Like [`generate_unique`](Self::generate_unique), skipping the first
    /// `first_attempt` candidates
    ///
    /// Used to retry after the remote rejected a candidate that looked free.
    pub fn generate_unique_from<F>(
        name: &str,
        is_dir: bool,
        suffix: ConflictSuffix,
        first_attempt: u32,
        mut exists: F,
    ) -> Result<String, ConflictError>
    where
        F: FnMut(&str) -> bool,
    {
        for attempt in first_attempt..MAX_ATTEMPTS {
            let candidate = Self::candidate(name, is_dir, suffix, attempt);
            if !exists(&candidate) {
                return Ok(candidate);
            }
        }
        Err(ConflictError::NamesExhausted {
            name: name.to_string(),
            attempts: MAX_ATTEMPTS,
        })
    }

    /// Unused sibling path of a local item, checked against the directory
    /// listing case-insensitively
    ///
    /// # Errors
    ///
    /// Fails if `path` has no parent or name, the parent cannot be listed,
    /// or every candidate is taken.
    pub fn unique_local_path(
        path: &Path,
        is_dir: bool,
        suffix: ConflictSuffix,
    ) -> Result<PathBuf, ConflictError> {
        let (parent, name) = match (path.parent(), path.file_name().and_then(|n| n.to_str())) {
            (Some(parent), Some(name)) => (parent, name),
            _ => return Err(ConflictError::NoFileName(path.display().to_string())),
        };

        let taken: HashSet<String> = std::fs::read_dir(parent)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_lowercase())
            .collect();

        let unique = Self::generate_unique(name, is_dir, suffix, |candidate| {
            taken.contains(&candidate.to_lowercase())
        })?;

        tracing::debug!(
            original = %path.display(),
            renamed = %unique,
            "Generated conflict name"
        );
        Ok(parent.join(unique))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_with_extension() {
        assert_eq!(
            ConflictNamer::candidate("a.txt", false, ConflictSuffix::ConflictingCopy, 0),
            "a (conflicting copy).txt"
        );
        assert_eq!(
            ConflictNamer::candidate("a.txt", false, ConflictSuffix::ConflictingCopy, 3),
            "a (conflicting copy 3).txt"
        );
    }

    #[test]
    fn test_candidate_without_extension() {
        assert_eq!(
            ConflictNamer::candidate("Makefile", false, ConflictSuffix::ConflictingCopy, 0),
            "Makefile (conflicting copy)"
        );
        assert_eq!(
            ConflictNamer::candidate(".bashrc", false, ConflictSuffix::ConflictingCopy, 0),
            ".bashrc (conflicting copy)"
        );
    }

    #[test]
    fn test_candidate_with_multiple_dots() {
        assert_eq!(
            ConflictNamer::candidate("archive.tar.gz", false, ConflictSuffix::ConflictingCopy, 0),
            "archive.tar (conflicting copy).gz"
        );
    }

    #[test]
    fn test_folders_keep_dots_in_name() {
        assert_eq!(
            ConflictNamer::candidate("v1.2", true, ConflictSuffix::SelectiveSyncConflict, 1),
            "v1.2 (selective sync conflict 1)"
        );
    }

    #[test]
    fn test_generate_unique_skips_taken_names_case_insensitively() {
        let taken: HashSet<String> = ["A (Conflicting Copy).TXT", "a (conflicting copy 1).txt"]
            .iter()
            .map(|s| s.to_lowercase())
            .collect();
        let name = ConflictNamer::generate_unique("a.txt", false, ConflictSuffix::ConflictingCopy, |c| {
            taken.contains(&c.to_lowercase())
        })
        .unwrap();
        assert_eq!(name, "a (conflicting copy 2).txt");
    }

    #[test]
    fn test_generate_unique_from_skips_rejected_candidates() {
        let name = ConflictNamer::generate_unique_from(
            "a.txt",
            false,
            ConflictSuffix::ConflictingCopy,
            1,
            |_| false,
        )
        .unwrap();
        assert_eq!(name, "a (conflicting copy 1).txt");
    }

    #[test]
    fn test_generate_unique_gives_up() {
        let err = ConflictNamer::generate_unique("a.txt", false, ConflictSuffix::ConflictingCopy, |_| true)
            .unwrap_err();
        assert!(matches!(err, ConflictError::NamesExhausted { .. }));
    }

    #[test]
    fn test_unique_local_path_checks_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.md"), b"x").unwrap();
        std::fs::write(dir.path().join("NOTES (conflicting copy).md"), b"y").unwrap();

        let path = ConflictNamer::unique_local_path(
            &dir.path().join("notes.md"),
            false,
            ConflictSuffix::ConflictingCopy,
        )
        .unwrap();
        assert_eq!(path, dir.path().join("notes (conflicting copy 1).md"));
        assert!(!path.exists());
    }
}
