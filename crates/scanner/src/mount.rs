//! Mount table with longest-prefix resolution.
//!
//! Maps logical paths onto the storages mounted beneath them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tidemark_storage::BackendHandle;

use crate::error::Result;
use crate::logical;

/// A storage attached to the logical tree at `mount_point`.
///
/// The storage is `None` when the backend could not be set up; such mounts
/// still shadow their mount point but are never scanned.
#[derive(Clone)]
pub struct Mount {
    mount_point: PathBuf,
    storage: Option<BackendHandle>,
}
impl fmt::Debug for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("mount_point", &self.mount_point)
            .field("storage", &self.storage.as_ref().map(|storage| storage.id()))
            .finish()
    }
}
impl Mount {
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn storage(&self) -> Option<&BackendHandle> {
        self.storage.as_ref()
    }

    /// Translate a logical path into a path relative to this mount's storage.
    ///
    /// Returns `None` if `logical` is outside this mount. The mount point
    /// itself maps onto the empty path (the storage root).
    pub fn internal_path(&self, logical: &Path) -> Option<PathBuf> {
        logical.strip_prefix(&self.mount_point).ok().map(Path::to_path_buf)
    }

    fn depth(&self) -> usize {
        self.mount_point.components().count()
    }
}

/// The set of mounts making up the logical tree.
///
/// Mount points are matched by longest prefix, component-wise: with `/` and
/// `/foo` both mounted, `/foo/bar.txt` belongs to `/foo` while `/foobar` still
/// belongs to `/`.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    mounts: BTreeMap<PathBuf, Mount>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `storage` at `mount_point`, returning the mount it replaced.
    pub fn mount(&mut self, mount_point: impl AsRef<Path>, storage: Option<BackendHandle>) -> Result<Option<Mount>> {
        let mount_point = logical::normalize(mount_point)?;
        let mount = Mount { mount_point: mount_point.clone(), storage };
        Ok(self.mounts.insert(mount_point, mount))
    }

    /// Detach whatever is mounted at `mount_point`.
    ///
    /// Returns `true` if a mount was removed.
    pub fn unmount(&mut self, mount_point: impl AsRef<Path>) -> bool {
        match logical::normalize(mount_point) {
            Ok(mount_point) => self.mounts.remove(&mount_point).is_some(),
            Err(_) => false,
        }
    }

    /// All mounts, ordered by mount point.
    pub fn mounts(&self) -> impl Iterator<Item = &Mount> {
        self.mounts.values()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// The mount that most specifically contains `path`.
    pub fn find(&self, path: &Path) -> Option<&Mount> {
        self.mounts
            .values()
            .filter(|mount| path.starts_with(&mount.mount_point))
            .max_by_key(|mount| mount.depth())
    }

    /// Mounts whose mount point lies strictly beneath `dir`.
    pub fn find_in(&self, dir: &Path) -> Vec<&Mount> {
        self.mounts
            .values()
            .filter(|mount| mount.mount_point != dir && mount.mount_point.starts_with(dir))
            .collect()
    }

    /// Every mount that has to be visited to scan `dir`.
    ///
    /// The mount containing `dir` comes first, followed by the mounts nested
    /// beneath `dir`, deepest mount point first. Mounts without a storage
    /// are left out.
    pub fn resolve(&self, dir: &Path) -> Vec<Mount> {
        let mut nested = self.find_in(dir);
        nested.sort_by(|a, b| b.depth().cmp(&a.depth()).then_with(|| a.mount_point.cmp(&b.mount_point)));
        self.find(dir)
            .into_iter()
            .chain(nested)
            .filter(|mount| {
                if mount.storage.is_none() {
                    tracing::debug!(mount = %mount.mount_point.display(), "Skipping mount without storage");
                }
                mount.storage.is_some()
            })
            .cloned()
            .collect()
    }

    /// The mount containing `path`, and `path` relative to its storage.
    pub fn resolve_path(&self, path: &Path) -> Option<(&Mount, PathBuf)> {
        let mount = self.find(path)?;
        let internal = mount.internal_path(path)?;
        Some((mount, internal))
    }
}
