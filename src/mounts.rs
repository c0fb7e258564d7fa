//! Assembling the logical tree from configuration.

use exn::ResultExt;
use std::sync::Arc;
use tidemark_config::{Config, MountConfig};
use tidemark_scanner::MountTable;
use tidemark_storage::BackendHandle;
use tidemark_storage::backend::{HomeBackend, LocalBackend, ReadOnlyBackend};

use crate::error::{ErrorKind, Result};

/// Mount every configured storage.
///
/// A storage that cannot be set up is still mounted, without a backend, so
/// that its mount point keeps shadowing whatever lies beneath it.
pub fn build(config: &Config) -> Result<MountTable> {
    let mut table = MountTable::new();
    for (name, mount) in &config.mounts {
        let storage = match backend(name, mount) {
            Ok(storage) => Some(storage),
            Err(err) => {
                tracing::warn!(mount = name, root = %mount.root.display(), error = ?err, "Storage unavailable");
                None
            },
        };
        table.mount(&mount.mount_point, storage).or_raise(|| ErrorKind::Config)?;
    }
    Ok(table)
}

fn backend(name: &str, mount: &MountConfig) -> tidemark_storage::error::Result<BackendHandle> {
    let mut storage: BackendHandle = Arc::new(LocalBackend::new(name, &mount.root)?);
    if mount.read_only {
        storage = Arc::new(ReadOnlyBackend::new(storage));
    }
    if let Some(owner) = &mount.home {
        storage = Arc::new(HomeBackend::new(storage, owner.as_str()));
    }
    Ok(storage)
}
