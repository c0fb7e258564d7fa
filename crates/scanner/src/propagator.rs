//! Propagation of changes up the logical tree.
//!
//! Scanning only touches the entries that changed. Every ancestor of a
//! changed entry, across mount boundaries, then gets a new etag (and its
//! mtime moved forward) so that a single comparison at the top of a tree is
//! enough to tell that something beneath it changed.

use exn::ResultExt;
use std::collections::{BTreeSet, HashSet};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tidemark_cache::{Cache, CacheUpdate};
use tidemark_storage::EntryKind;
use time::OffsetDateTime;
use tracing::instrument;

use crate::error::{ErrorKind, Result};
use crate::etag;
use crate::logical;
use crate::mount::MountTable;

/// Logical paths reported as added, modified or removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changed: HashSet<PathBuf>,
}

impl ChangeSet {
    /// Record a change. Returns `false` if it was already recorded.
    pub fn add_change(&mut self, path: impl Into<PathBuf>) -> bool {
        self.changed.insert(path.into())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.changed.contains(path)
    }

    /// The changed paths, sorted.
    pub fn changes(&self) -> BTreeSet<PathBuf> {
        self.changed.iter().cloned().collect()
    }

    /// Every strict ancestor of every changed path, sorted (`/` first).
    pub fn all_parents(&self) -> BTreeSet<PathBuf> {
        self.changed
            .iter()
            .flat_map(|path| logical::parents(path))
            .map(Path::to_path_buf)
            .collect()
    }

    /// Merge another set into this one.
    pub fn absorb(&mut self, other: ChangeSet) {
        self.changed.extend(other.changed);
    }

    pub fn len(&self) -> usize {
        self.changed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }
}

/// Collects the changes of one operation and writes them up the tree.
pub struct ChangePropagator {
    mounts: Arc<MountTable>,
    cache: Cache,
    changes: ChangeSet,
}

impl ChangePropagator {
    pub fn new(mounts: Arc<MountTable>, cache: Cache) -> Self {
        Self { mounts, cache, changes: ChangeSet::default() }
    }

    pub fn add_change(&mut self, path: impl Into<PathBuf>) {
        self.changes.add_change(path);
    }

    pub fn get_changes(&self) -> BTreeSet<PathBuf> {
        self.changes.changes()
    }

    pub fn get_all_parents(&self) -> BTreeSet<PathBuf> {
        self.changes.all_parents()
    }

    /// Take over changes staged elsewhere (one mount's scan).
    pub fn absorb(&mut self, staged: ChangeSet) {
        self.changes.absorb(staged);
    }

    /// Give every parent of every recorded change a new etag, and an mtime of
    /// at least `timestamp`. Returns the logical paths that were written.
    ///
    /// The recorded changes are consumed even if writing fails. Parents
    /// outside any mount, or on a mount without a storage, are skipped.
    /// All writes happen in a single transaction.
    #[instrument(skip(self), fields(changes = self.changes.len()))]
    pub async fn propagate_changes(&mut self, timestamp: OffsetDateTime) -> Result<Vec<PathBuf>> {
        let changes = mem::take(&mut self.changes);
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        let tx = self.cache.begin().await.or_raise(|| ErrorKind::Cache)?;
        match self.write_parents(&tx, changes.all_parents(), timestamp).await {
            Ok(written) => {
                tx.commit().await.or_raise(|| ErrorKind::Cache)?;
                tracing::debug!(parents = written.len(), "Propagated changes");
                Ok(written)
            },
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "Failed to roll back change propagation");
                }
                Err(err)
            },
        }
    }

    async fn write_parents(&self, tx: &Cache, parents: BTreeSet<PathBuf>, timestamp: OffsetDateTime) -> Result<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(parents.len());
        for parent in parents {
            let Some((mount, internal)) = self.mounts.resolve_path(&parent) else {
                tracing::trace!(path = %parent.display(), "No mount covers parent; skipping");
                continue;
            };
            let Some(storage) = mount.storage() else {
                tracing::trace!(path = %parent.display(), "Parent is on an unavailable storage; skipping");
                continue;
            };
            let update = match tx.get(storage.id(), &internal).await.or_raise(|| ErrorKind::Cache)? {
                Some(entry) => CacheUpdate::new()
                    .mtime(entry.mtime.max(timestamp))
                    .etag(etag::mint(&entry.etag, &parent, timestamp)),
                None => CacheUpdate::new()
                    .kind(EntryKind::Directory)
                    .size(None)
                    .mtime(timestamp)
                    .storage_mtime(timestamp)
                    .etag(etag::mint("", &parent, timestamp)),
            };
            tx.put(storage.id(), &internal, &update).await.or_raise(|| ErrorKind::Cache)?;
            written.push(parent);
        }
        Ok(written)
    }
}
