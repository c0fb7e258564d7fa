//! Events emitted while scanning.

use derive_more::Display;
use std::path::{Path, PathBuf};

/// Something the scanner did, or found, at a path.
///
/// A storage scanner emits events with storage-relative paths; once they pass
/// through the [`EventBridge`](crate::EventBridge) they carry logical paths.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash)]
pub enum ScanEvent {
    /// A file was visited.
    #[display("scan file {}", _0.display())]
    ScanFile(PathBuf),
    /// A directory was visited.
    #[display("scan folder {}", _0.display())]
    ScanFolder(PathBuf),
    /// An entry was added to the cache, or its cached metadata changed.
    #[display("add to cache {}", _0.display())]
    AddToCache(PathBuf),
    /// An entry (and everything below it) was removed from the cache.
    #[display("remove from cache {}", _0.display())]
    RemoveFromCache(PathBuf),
}
impl ScanEvent {
    pub fn path(&self) -> &Path {
        match self {
            Self::ScanFile(path) | Self::ScanFolder(path) | Self::AddToCache(path) | Self::RemoveFromCache(path) => path,
        }
    }

    /// Whether the event records a change to the cache (as opposed to
    /// progress).
    pub fn is_change(&self) -> bool {
        matches!(self, Self::AddToCache(_) | Self::RemoveFromCache(_))
    }

    /// The same event at a different path.
    pub fn map_path(self, f: impl FnOnce(PathBuf) -> PathBuf) -> Self {
        match self {
            Self::ScanFile(path) => Self::ScanFile(f(path)),
            Self::ScanFolder(path) => Self::ScanFolder(f(path)),
            Self::AddToCache(path) => Self::AddToCache(f(path)),
            Self::RemoveFromCache(path) => Self::RemoveFromCache(f(path)),
        }
    }
}
