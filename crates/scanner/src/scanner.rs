//! Scanning across every mount beneath a directory.

use exn::ResultExt;
use futures::TryStreamExt;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tidemark_cache::Cache;
use tidemark_storage::{Depth, StorageKind};
use time::OffsetDateTime;
use tokio::sync::mpsc::Sender;
use tracing::instrument;

use crate::bridge::EventBridge;
use crate::error::{ErrorKind, Result};
use crate::event::ScanEvent;
use crate::logical;
use crate::mount::{Mount, MountTable};
use crate::propagator::{ChangePropagator, ChangeSet};
use crate::storage::{Reuse, StorageScanner};

/// What a scan changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Number of mounts scanned successfully.
    pub mounts: usize,
    /// Logical paths that were added, modified or removed.
    pub changes: BTreeSet<PathBuf>,
    /// Every ancestor of the changed paths.
    pub parents: BTreeSet<PathBuf>,
    /// Ancestors whose cache entries got a new etag (those covered by a
    /// mount with a storage).
    pub propagated: Vec<PathBuf>,
    /// Timestamp the new etags of `propagated` were minted with, if any.
    pub propagated_at: Option<OffsetDateTime>,
}
impl ScanSummary {
    pub fn is_unchanged(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Brings the cache of every storage beneath a logical directory up to date
/// and propagates what changed up the tree.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use tidemark_cache::{Cache, Database};
/// use tidemark_scanner::{MountTable, Scanner};
/// use tidemark_storage::backend::MemoryBackend;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let db = Database::connect_in_memory().await?;
/// let mut mounts = MountTable::new();
/// mounts.mount("/foo", Some(Arc::new(MemoryBackend::with_files([("foo.txt", b"foo")]))))?;
///
/// let scanner = Scanner::new(Arc::new(mounts), Cache::from(&db));
/// let summary = scanner.scan("/").await?;
/// assert!(summary.changes.contains(std::path::Path::new("/foo/foo.txt")));
/// # Ok(())
/// # }
/// ```
pub struct Scanner {
    mounts: Arc<MountTable>,
    cache: Cache,
    progress: Option<Sender<ScanEvent>>,
    depth: Depth,
    background_limit: Option<usize>,
}

impl Scanner {
    pub fn new(mounts: Arc<MountTable>, cache: Cache) -> Self {
        Self { mounts, cache, progress: None, depth: Depth::Recursive, background_limit: None }
    }

    /// Receive events (with logical paths) as they happen.
    ///
    /// The scan never waits for the listener: events that find the channel
    /// full are dropped, so size it for how far the listener may lag behind.
    pub fn with_progress(mut self, progress: Sender<ScanEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// How far below the requested directory [`scan()`](Self::scan) reaches.
    pub fn with_depth(mut self, depth: Depth) -> Self {
        self.depth = depth;
        self
    }

    /// Maximum number of incomplete directories a
    /// [`background_scan()`](Self::background_scan) completes per storage.
    pub fn with_background_limit(mut self, limit: Option<usize>) -> Self {
        self.background_limit = limit;
        self
    }

    /// Scan every mount that covers `dir`.
    ///
    /// Each mount is scanned in its own transaction; a failing mount is
    /// rolled back and skipped without affecting the others. Home storages
    /// that cannot be written to are not scanned at all (see
    /// [`ErrorKind::Forbidden`]). Once all mounts were visited, the changes
    /// of the successful ones are propagated in one go, after which the first
    /// mount error (if any) is returned.
    #[instrument(skip(self, dir), fields(dir = %dir.as_ref().display()))]
    pub async fn scan(&self, dir: impl AsRef<Path>) -> Result<ScanSummary> {
        let dir = logical::normalize(dir)?;
        let mut propagator = ChangePropagator::new(self.mounts.clone(), self.cache.clone());
        let mut errors = Vec::new();
        let mut scanned = 0;
        for mount in self.mounts.resolve(&dir) {
            match self.scan_mount(&mount, &dir).await {
                Ok(staged) => {
                    tracing::info!(mount = %mount.mount_point().display(), changes = staged.len(), "Mount scanned");
                    propagator.absorb(staged);
                    scanned += 1;
                },
                Err(err) => {
                    tracing::warn!(mount = %mount.mount_point().display(), error = %err, "Mount scan failed");
                    errors.push(err);
                },
            }
        }
        let summary = Self::flush(propagator, scanned).await?;
        let mut errors = errors.into_iter();
        match errors.next() {
            Some(first) => {
                for err in errors {
                    tracing::error!(error = ?err, "Additional mount scan failure");
                }
                Err(first)
            },
            None => Ok(summary),
        }
    }

    async fn scan_mount(&self, mount: &Mount, dir: &Path) -> Result<ChangeSet> {
        let Some(storage) = mount.storage() else {
            return Ok(ChangeSet::default());
        };
        // A nested mount is scanned from its root.
        let internal = mount.internal_path(dir).unwrap_or_default();
        if storage.instance_of(StorageKind::Home)
            && !storage.is_creatable(Path::new("")).await.or_raise(|| ErrorKind::Storage)?
        {
            exn::bail!(ErrorKind::Forbidden(mount.mount_point().to_path_buf()));
        }

        let tx = self.cache.begin().await.or_raise(|| ErrorKind::Cache)?;
        let scanner = StorageScanner::new(storage.clone(), tx.clone()).with_transactions(false);
        let mut bridge = EventBridge::new(mount.mount_point(), self.progress.clone());
        let result: Result<()> = async {
            let mut events = scanner.scan(&internal, self.depth, Reuse::ALL);
            while let Some(event) = events.try_next().await? {
                bridge.forward(event);
            }
            Ok(())
        }
        .await;
        match result {
            Ok(()) => {
                tx.commit().await.or_raise(|| ErrorKind::Cache)?;
                if bridge.dropped() > 0 {
                    tracing::debug!(mount = %mount.mount_point().display(), dropped = bridge.dropped(), "Progress listener fell behind");
                }
                Ok(bridge.into_changes())
            },
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "Failed to roll back mount scan");
                }
                Err(err)
            },
        }
    }

    /// Complete the incomplete directories of every storage beneath `dir`.
    ///
    /// Runs without transactions: what was written before a failure stays
    /// written, and is propagated. Failing mounts are logged and skipped; only
    /// a failure to propagate is returned.
    #[instrument(skip(self, dir), fields(dir = %dir.as_ref().display()))]
    pub async fn background_scan(&self, dir: impl AsRef<Path>) -> Result<ScanSummary> {
        let dir = logical::normalize(dir)?;
        let mut propagator = ChangePropagator::new(self.mounts.clone(), self.cache.clone());
        let mut scanned = 0;
        for mount in self.mounts.resolve(&dir) {
            let Some(storage) = mount.storage() else { continue };
            let scanner = StorageScanner::new(storage.clone(), self.cache.clone()).with_transactions(false);
            let mut bridge = EventBridge::new(mount.mount_point(), self.progress.clone());
            let mut events = scanner.background_scan(self.background_limit);
            loop {
                match events.try_next().await {
                    Ok(Some(event)) => {
                        bridge.forward(event);
                    },
                    Ok(None) => {
                        scanned += 1;
                        break;
                    },
                    Err(err) => {
                        tracing::warn!(mount = %mount.mount_point().display(), error = %err, "Background scan failed");
                        break;
                    },
                }
            }
            propagator.absorb(bridge.into_changes());
        }
        Self::flush(propagator, scanned).await
    }

    async fn flush(mut propagator: ChangePropagator, scanned: usize) -> Result<ScanSummary> {
        let changes = propagator.get_changes();
        let parents = propagator.get_all_parents();
        let timestamp = OffsetDateTime::now_utc();
        let propagated = propagator.propagate_changes(timestamp).await.or_raise(|| ErrorKind::Propagation)?;
        let propagated_at = (!propagated.is_empty()).then_some(timestamp);
        Ok(ScanSummary { mounts: scanned, changes, parents, propagated, propagated_at })
    }
}
