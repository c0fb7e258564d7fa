//! Entry metadata as reported by storage backends.

use derive_more::Display;
use std::path::PathBuf;
use std::str::FromStr;
use time::OffsetDateTime;

use crate::error::{Error, ErrorKind};

/// Whether an entry is a plain file or a directory.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum EntryKind {
    #[display("file")]
    File,
    #[display("directory")]
    Directory,
}
impl EntryKind {
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Directory)
    }
}
impl FromStr for EntryKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "directory" => Ok(Self::Directory),
            _ => exn::bail!(ErrorKind::BackendError(format!("unknown entry kind `{s}`"))),
        }
    }
}

/// Metadata for a single file or directory in storage.
///
/// This is what a backend knows *right now*; the cache remembers what was
/// known at the last scan, and the scanner compares the two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Relative path from storage root (empty for the root)
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Size in bytes (always zero for directories; the cache aggregates them)
    pub size: u64,
    /// Last modified timestamp, as reported by the backend
    pub modified: OffsetDateTime,
    /// Consistency token supplied natively by the backend, if it has one
    pub etag: Option<String>,
}
impl EntryInfo {
    pub fn file(path: impl Into<PathBuf>, size: u64, modified: OffsetDateTime) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            size,
            modified,
            etag: None,
        }
    }

    pub fn directory(path: impl Into<PathBuf>, modified: OffsetDateTime) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Directory,
            size: 0,
            modified,
            etag: None,
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }
}
