//! In-memory storage backend for testing.

use super::{Depth, EntryStream, StorageKind};
use crate::entry::{EntryInfo, EntryKind};
use crate::error::{ErrorKind, Result};
use crate::path::validate as validate_path;
use async_stream::stream;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::StorageBackend;

#[derive(Debug, Clone)]
struct Node {
    kind: EntryKind,
    modified: OffsetDateTime,
    data: Vec<u8>,
}
impl Node {
    fn directory(modified: OffsetDateTime) -> Self {
        Self { kind: EntryKind::Directory, modified, data: Vec::new() }
    }

    fn info(&self, path: &Path) -> EntryInfo {
        match self.kind {
            EntryKind::Directory => EntryInfo::directory(path, self.modified),
            EntryKind::File => EntryInfo::file(path, self.data.len() as u64, self.modified),
        }
    }
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<PathBuf, Node>,
    writable: bool,
    poisoned: BTreeSet<PathBuf>,
}
impl Tree {
    /// Make sure every ancestor of `path` exists as a directory, bumping the
    /// modification time of any directory that gains a new entry.
    fn ensure_parents(&mut self, path: &Path, now: OffsetDateTime) -> Result<()> {
        let Some(parent) = path.parent() else { return Ok(()) };
        match self.nodes.get(parent).map(|node| node.kind) {
            Some(EntryKind::Directory) => {},
            Some(EntryKind::File) => exn::bail!(ErrorKind::BackendError(format!(
                "`{}` is a file, not a directory",
                parent.display()
            ))),
            None => {
                self.ensure_parents(parent, now)?;
                self.nodes.insert(parent.to_path_buf(), Node::directory(now));
            },
        }
        Ok(())
    }

    fn touch_parent(&mut self, path: &Path, now: OffsetDateTime) {
        if let Some(node) = path.parent().and_then(|parent| self.nodes.get_mut(parent)) {
            node.modified = now;
        }
    }
}

/// In-memory storage backend for testing.
///
/// The tree is stored in a `BTreeMap` behind a [`RwLock`], so all trait
/// methods can operate on `&self` without external synchronisation. It
/// behaves like a POSIX filesystem where it matters to the scanner: a
/// directory's modification time changes when an entry is added to or removed
/// from it, but not when an existing file is rewritten.
///
/// # Examples
///
/// ```
/// use tidemark_storage::backend::MemoryBackend;
/// use tidemark_storage::StorageBackend;
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MemoryBackend::with_files([
///     ("folder/bar.txt", b"qwerty"),
/// ]);
/// assert!(backend.exists(Path::new("folder")).await?);
///
/// backend.write(Path::new("foo.txt"), b"qwerty").await?;
/// assert!(backend.exists(Path::new("foo.txt")).await?);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryBackend {
    id: String,
    name: String,
    tree: RwLock<Tree>,
}

impl MemoryBackend {
    /// Create a memory backend pre-populated with files.
    ///
    /// Panics if any path fails validation (e.g. path traversal). If test
    /// setup is wrong, then test should not pass.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let now = OffsetDateTime::now_utc();
        let mut tree = Tree {
            nodes: BTreeMap::from([(PathBuf::new(), Node::directory(now))]),
            writable: true,
            poisoned: BTreeSet::new(),
        };
        for (path, data) in files {
            let path = path.into();
            let validated = match validate_path(&path) {
                Ok(validated) if !validated.as_os_str().is_empty() => validated,
                // The panic here is DELIBERATE. MemoryBackend is intended to be
                // used in tests; panics are expected. There is no error result.
                _ => panic!("MemoryBackend::with_files: invalid path {}", path.display()),
            };
            if tree.ensure_parents(&validated, now).is_err() {
                panic!("MemoryBackend::with_files: parent of {} is a file", path.display());
            }
            tree.nodes.insert(validated, Node { kind: EntryKind::File, modified: now, data: data.into() });
        }
        let name = "memory".to_string();
        Self { id: format!("memory::{name}"), name, tree: RwLock::new(tree) }
    }

    /// Change the name (and therefore the identifier) of the backend.
    ///
    /// Two memory backends sharing a cache need different names.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self.id = format!("memory::{}", self.name);
        self
    }

    /// Create or overwrite a file, creating parent directories as needed.
    pub async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.write_at(path, data, OffsetDateTime::now_utc()).await
    }

    /// Create or overwrite a file with an explicit modification time.
    pub async fn write_at(&self, path: &Path, data: &[u8], modified: OffsetDateTime) -> Result<()> {
        let path = Self::entry_path(path)?;
        let mut tree = self.tree.write().await;
        tree.ensure_parents(&path, modified)?;
        match tree.nodes.get_mut(&path) {
            Some(node) if node.kind.is_dir() => {
                exn::bail!(ErrorKind::BackendError(format!("`{}` is a directory", path.display())))
            },
            Some(node) => {
                node.data = data.to_vec();
                node.modified = modified;
            },
            None => {
                tree.nodes.insert(path.clone(), Node { kind: EntryKind::File, modified, data: data.to_vec() });
                tree.touch_parent(&path, modified);
            },
        }
        Ok(())
    }

    /// Create a directory (and any missing parents).
    pub async fn mkdir(&self, path: &Path) -> Result<()> {
        let path = Self::entry_path(path)?;
        let now = OffsetDateTime::now_utc();
        let mut tree = self.tree.write().await;
        if tree.nodes.contains_key(&path) {
            return Ok(());
        }
        tree.ensure_parents(&path, now)?;
        tree.nodes.insert(path.clone(), Node::directory(now));
        tree.touch_parent(&path, now);
        Ok(())
    }

    /// Set the modification time of an existing entry.
    pub async fn touch(&self, path: &Path, modified: OffsetDateTime) -> Result<()> {
        let path = validate_path(path)?;
        let mut tree = self.tree.write().await;
        let node = tree.nodes.get_mut(&path).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.clone())))?;
        node.modified = modified;
        Ok(())
    }

    /// Delete an entry and everything below it.
    pub async fn delete(&self, path: &Path) -> Result<()> {
        let path = Self::entry_path(path)?;
        let now = OffsetDateTime::now_utc();
        let mut tree = self.tree.write().await;
        if tree.nodes.remove(&path).is_none() {
            exn::bail!(ErrorKind::NotFound(path));
        }
        tree.nodes.retain(|candidate, _| !candidate.starts_with(&path));
        tree.touch_parent(&path, now);
        Ok(())
    }

    /// Toggle whether [`is_creatable()`](StorageBackend::is_creatable) succeeds.
    pub async fn set_writable(&self, writable: bool) {
        self.tree.write().await.writable = writable;
    }

    /// Make any listing that reaches `path` fail with a backend error, to
    /// simulate a storage that breaks halfway through a scan.
    pub async fn poison(&self, path: &Path) -> Result<()> {
        let path = validate_path(path)?;
        self.tree.write().await.poisoned.insert(path);
        Ok(())
    }

    fn entry_path(path: &Path) -> Result<PathBuf> {
        let validated = validate_path(path)?;
        if validated.as_os_str().is_empty() {
            exn::bail!(ErrorKind::InvalidPath(path.to_path_buf()));
        }
        Ok(validated)
    }
}
impl Default for MemoryBackend {
    fn default() -> Self {
        let files: [(&str, &str); 0] = [];
        Self::with_files(files)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Memory
    }

    async fn stat(&self, path: &Path) -> Result<EntryInfo> {
        let path = validate_path(path)?;
        let tree = self.tree.read().await;
        if tree.poisoned.contains(&path) {
            exn::bail!(ErrorKind::BackendError(format!("poisoned path `{}`", path.display())));
        }
        let node = tree.nodes.get(&path).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.clone())))?;
        Ok(node.info(&path))
    }

    fn list_stream<'a>(&'a self, dir: &'a Path, depth: Depth) -> EntryStream<'a> {
        let dir = match validate_path(dir) {
            Ok(dir) => dir,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };

        Box::pin(stream! {
            // Snapshot matching entries under the read lock, then drop it
            // before yielding to avoid holding the lock across yield points.
            let (entries, poisoned) = {
                let tree = self.tree.read().await;
                let entries: Vec<(PathBuf, Node)> = tree
                    .nodes
                    .iter()
                    .filter(|(path, _)| *path != &dir && path.starts_with(&dir))
                    .filter(|(path, _)| depth == Depth::Recursive || path.parent() == Some(dir.as_path()))
                    .map(|(path, node)| (path.clone(), node.clone()))
                    .collect();
                (entries, tree.poisoned.clone())
            };
            for (path, node) in entries {
                if poisoned.contains(&path) {
                    yield Err(exn::Exn::from(ErrorKind::BackendError(format!("poisoned path `{}`", path.display()))));
                    continue;
                }
                yield Ok(node.info(&path));
            }
        })
    }

    async fn is_creatable(&self, path: &Path) -> Result<bool> {
        let path = validate_path(path)?;
        let tree = self.tree.read().await;
        Ok(tree.writable && tree.nodes.get(&path).is_some_and(|node| node.kind.is_dir()))
    }
}
