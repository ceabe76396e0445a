//! Error types for conflict handling

use thiserror::Error;

/// Errors that can occur while resolving a conflict
#[derive(Debug, Error)]
pub enum ConflictError {
    /// Every numbered candidate name is taken
    #[error("no free conflict name for {name} after {attempts} attempts")]
    NamesExhausted { name: String, attempts: u32 },

    /// The item to rename has no file name
    #[error("cannot derive a conflict name for {0}")]
    NoFileName(String),

    /// Listing the parent directory failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
