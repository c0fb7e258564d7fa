//! Scanner Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A scanner error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for scanner operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A home storage refused creation at its root: the scan is most likely
    /// running as the wrong user. Carries the mount point.
    #[display("not allowed to scan {}: storage is not writable by this user", _0.display())]
    Forbidden(#[error(not(source))] PathBuf),
    /// The requested logical path is not absolute or escapes the root.
    #[display("invalid path: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    #[display("storage error")]
    Storage,
    #[display("cache error")]
    Cache,
    /// Writing the changes of a scan up the tree failed; nothing was written.
    #[display("change propagation failed")]
    Propagation,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage | Self::Cache | Self::Propagation)
    }
}
