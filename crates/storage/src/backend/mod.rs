//! Storage backend trait and implementations.
//!
//! This module defines the `StorageBackend` trait, which provides a unified
//! read-only view over different backends (local filesystem, in-memory trees,
//! and decorators that change how a backend is treated).
//!

mod home;
mod local;
#[cfg(feature = "mock")]
mod memory;
mod ro;

pub use self::home::HomeBackend;
pub use self::local::LocalBackend;
#[cfg(feature = "mock")]
pub use self::memory::MemoryBackend;
pub use self::ro::ReadOnlyBackend;
use crate::entry::EntryInfo;
use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use derive_more::Display;
use futures::{Stream, TryStreamExt};
use std::path::Path;
use std::pin::Pin;

pub type EntryStream<'a> = Pin<Box<dyn Stream<Item = Result<EntryInfo>> + Send + 'a>>;

/// How far below a directory a listing reaches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Depth {
    /// Direct children only.
    Shallow,
    /// The whole subtree.
    #[default]
    Recursive,
}

/// The class of a storage backend.
///
/// Decorators report their own kind but still answer
/// [`instance_of()`](StorageBackend::instance_of) for the kinds they wrap.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum StorageKind {
    #[display("local")]
    Local,
    #[display("memory")]
    Memory,
    #[display("read-only")]
    ReadOnly,
    #[display("home")]
    Home,
}

/// Unified interface for storage backends.
///
/// Backends only need to describe their tree: the scanner never reads file
/// contents. All operations are asynchronous so that remote backends can be
/// slotted in without blocking the runtime.
///
/// # Path Handling
/// All paths are relative to the storage root and must be validated using
/// [`validate_path`](crate::validate_path) before use. The empty path is the
/// storage root. Implementations should enforce this validation.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use tidemark_storage::{Depth, StorageBackend, error::Result};
///
/// async fn count_files(backend: &dyn StorageBackend) -> Result<usize> {
///     let entries = backend.list(Path::new(""), Depth::Recursive).await?;
///     Ok(entries.iter().filter(|entry| !entry.is_dir()).count())
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Unique identifier of the storage. The cache keys every entry by this
    /// identifier, so two backends with the same identifier share (and fight
    /// over) the same cache entries.
    fn id(&self) -> &str;

    /// Human-readable name of the configured backend (used for logging only).
    fn name(&self) -> &str;

    /// The class of this backend.
    fn kind(&self) -> StorageKind;

    /// Whether this backend is, or wraps, a backend of the given kind.
    fn instance_of(&self, kind: StorageKind) -> bool {
        self.kind() == kind
    }

    /// Get entry metadata without reading contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if nothing
    /// exists at `path`. The root (empty path) always exists.
    async fn stat(&self, path: &Path) -> Result<EntryInfo>;

    /// Check if an entry exists.
    async fn exists(&self, path: &Path) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(err) if matches!(&*err, ErrorKind::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Stream metadata for every entry below `dir` (not including `dir`).
    ///
    /// Directories are yielded as entries too. Listing a directory that
    /// doesn't exist results in an empty stream, not an error. Entries are
    /// produced lazily; the stream is finite and cannot be restarted.
    ///
    /// # Examples
    ///
    /// ```
    /// use futures::TryStreamExt;
    /// use std::path::Path;
    /// # use tidemark_storage::{Depth, StorageBackend, error::Result};
    /// # async fn example(backend: &dyn StorageBackend) -> Result<()> {
    /// let mut stream = backend.list_stream(Path::new("folder"), Depth::Shallow);
    /// while let Some(info) = stream.try_next().await? {
    ///     println!("{} ({})", info.path.display(), info.kind);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    fn list_stream<'a>(&'a self, dir: &'a Path, depth: Depth) -> EntryStream<'a>;

    /// Collect [`list_stream()`](Self::list_stream) into a [`Vec`].
    async fn list(&self, dir: &Path, depth: Depth) -> Result<Vec<EntryInfo>> {
        self.list_stream(dir, depth).try_collect().await
    }

    /// Whether new entries may be created inside `path`.
    ///
    /// Returns `false` (rather than an error) when `path` doesn't exist.
    async fn is_creatable(&self, path: &Path) -> Result<bool>;
}
