//! SkySync Conflict - Conflict detection and conflict-copy naming
//!
//! Provides:
//! - The decision whether a remote change can be applied over the local item
//! - Collision-free names for conflicting copies and selective sync conflicts

pub mod detector;
pub mod error;
pub mod namer;

pub use detector::{ConflictDetector, DetectionResult};
pub use error::ConflictError;
pub use namer::{ConflictNamer, ConflictSuffix};
