use crate::error::{Error, ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use std::path::{Path, PathBuf};
use tidemark_storage::EntryKind;
use time::OffsetDateTime;

/// What the cache knows about one file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub fileid: i64,
    /// Identifier of the storage the entry lives on.
    pub storage: String,
    /// Path relative to the storage root (empty for the root).
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Size in bytes. For directories this is the sum of the subtree, or
    /// `None` while the directory hasn't been fully scanned.
    pub size: Option<u64>,
    /// Modification time as seen by clients; propagation moves it forward.
    pub mtime: OffsetDateTime,
    /// Modification time reported by the storage at the last scan.
    pub storage_mtime: OffsetDateTime,
    pub etag: String,
}
impl CacheEntry {
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// A directory whose contents haven't been fully scanned yet.
    pub fn is_incomplete(&self) -> bool {
        self.is_dir() && self.size.is_none()
    }
}

/// A partial set of fields to write with [`Cache::put()`](crate::Cache::put).
///
/// Fields left as `None` keep their stored value. When the entry doesn't exist
/// yet, they fall back to an incomplete directory at the Unix epoch with an
/// empty etag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheUpdate {
    pub kind: Option<EntryKind>,
    pub size: Option<Option<u64>>,
    pub mtime: Option<OffsetDateTime>,
    pub storage_mtime: Option<OffsetDateTime>,
    pub etag: Option<String>,
}
impl CacheUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: EntryKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn size(mut self, size: Option<u64>) -> Self {
        self.size = Some(size);
        self
    }

    pub fn mtime(mut self, mtime: OffsetDateTime) -> Self {
        self.mtime = Some(mtime);
        self
    }

    pub fn storage_mtime(mut self, storage_mtime: OffsetDateTime) -> Self {
        self.storage_mtime = Some(storage_mtime);
        self
    }

    pub fn etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

pub(crate) fn path_to_text(path: &Path) -> Result<String> {
    Ok(path.to_str().ok_or_raise(|| ErrorKind::InvalidData("path"))?.to_string())
}

pub(crate) fn size_to_row(size: Option<u64>) -> Result<Option<i64>> {
    size.map(|size| i64::try_from(size).or_raise(|| ErrorKind::InvalidData("size"))).transpose()
}

#[derive(sqlx::FromRow)]
pub(crate) struct EntryRow {
    fileid: i64,
    storage: String,
    path: String,
    kind: String,
    size: Option<i64>,
    mtime: i64,
    storage_mtime: i64,
    etag: String,
}
impl TryFrom<EntryRow> for CacheEntry {
    type Error = Error;
    fn try_from(row: EntryRow) -> Result<Self> {
        Ok(Self {
            fileid: row.fileid,
            storage: row.storage,
            path: PathBuf::from(row.path),
            kind: row.kind.parse::<EntryKind>().or_raise(|| ErrorKind::InvalidData("entry kind"))?,
            size: row
                .size
                .map(|size| u64::try_from(size).or_raise(|| ErrorKind::InvalidData("size")))
                .transpose()?,
            mtime: OffsetDateTime::from_unix_timestamp(row.mtime).or_raise(|| ErrorKind::InvalidData("mtime"))?,
            storage_mtime: OffsetDateTime::from_unix_timestamp(row.storage_mtime)
                .or_raise(|| ErrorKind::InvalidData("storage mtime"))?,
            etag: row.etag,
        })
    }
}

/// Column values for inserting a brand new entry.
pub(crate) struct NewEntryRow {
    pub(crate) storage: String,
    pub(crate) path: String,
    pub(crate) parent: Option<String>,
    pub(crate) name: String,
    pub(crate) kind: String,
    pub(crate) size: Option<i64>,
    pub(crate) mtime: i64,
    pub(crate) storage_mtime: i64,
    pub(crate) etag: String,
}
impl NewEntryRow {
    pub(crate) fn new(storage: &str, path: &Path, update: &CacheUpdate) -> Result<Self> {
        let mtime = update.mtime.or(update.storage_mtime).unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let storage_mtime = update.storage_mtime.unwrap_or(mtime);
        Ok(Self {
            storage: storage.to_string(),
            path: path_to_text(path)?,
            parent: path.parent().map(path_to_text).transpose()?,
            name: match path.file_name() {
                Some(name) => name.to_str().ok_or_raise(|| ErrorKind::InvalidData("name"))?.to_string(),
                None => String::new(),
            },
            kind: update.kind.unwrap_or(EntryKind::Directory).to_string(),
            size: size_to_row(update.size.flatten())?,
            mtime: mtime.unix_timestamp(),
            storage_mtime: storage_mtime.unix_timestamp(),
            etag: update.etag.clone().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn test_row_to_model() {
        let now = OffsetDateTime::now_utc();
        let row = EntryRow {
            fileid: 7,
            storage: "local::/srv/data".to_string(),
            path: "folder/bar.txt".to_string(),
            kind: "file".to_string(),
            size: Some(6),
            mtime: now.unix_timestamp(),
            storage_mtime: now.unix_timestamp(),
            etag: "5d41402abc4b2a76b9719d911017c592".to_string(),
        };
        let entry = CacheEntry::try_from(row).unwrap();
        assert_eq!(entry.kind, EntryKind::File);
        assert_eq!(entry.path, PathBuf::from("folder/bar.txt"));
        // Converting to a Unix timestamp (measured in seconds) inherently strips the nanoseconds component.
        assert_eq!(entry.mtime, now.replace_nanosecond(0).unwrap());
        assert!(!entry.is_incomplete());
    }

    #[test]
    fn test_row_rejects_unknown_kind() {
        let row = EntryRow {
            fileid: 1,
            storage: "memory::memory".to_string(),
            path: String::new(),
            kind: "symlink".to_string(),
            size: None,
            mtime: 0,
            storage_mtime: 0,
            etag: String::new(),
        };
        assert!(CacheEntry::try_from(row).is_err());
    }

    #[test]
    fn test_new_row_for_root_has_no_parent() {
        let row = NewEntryRow::new("memory::memory", Path::new(""), &CacheUpdate::new()).unwrap();
        assert_eq!(row.parent, None);
        assert_eq!(row.name, "");
        assert_eq!(row.kind, "directory");
        assert_eq!(row.size, None);
        assert_eq!(row.mtime, 0);
    }

    #[test]
    fn test_new_row_defaults_mtime_to_storage_mtime() {
        let when = OffsetDateTime::UNIX_EPOCH + Duration::days(2);
        let update = CacheUpdate::new().kind(EntryKind::File).size(Some(3)).storage_mtime(when);
        let row = NewEntryRow::new("memory::memory", Path::new("a/b.txt"), &update).unwrap();
        assert_eq!(row.parent.as_deref(), Some("a"));
        assert_eq!(row.name, "b.txt");
        assert_eq!(row.mtime, when.unix_timestamp());
        assert_eq!(row.storage_mtime, when.unix_timestamp());
        assert_eq!(row.size, Some(3));
    }

    #[test]
    fn test_empty_update() {
        assert!(CacheUpdate::new().is_empty());
        assert!(!CacheUpdate::new().etag("x").is_empty());
    }
}
