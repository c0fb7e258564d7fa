//! Home storage decorator.
//!
//! A home storage belongs to a single user. Scanning one requires permission
//! to create entries at its root, which is how a scan run as the wrong user
//! gets caught before it writes anything to the cache.

use async_trait::async_trait;
use std::path::Path;

use super::{Depth, EntryStream, StorageKind};
use crate::{BackendHandle, StorageBackend, entry::EntryInfo, error::Result};

/// Marks a backend as the home storage of `owner`.
#[derive(Clone)]
pub struct HomeBackend {
    id: String,
    owner: String,
    inner: BackendHandle,
}
impl HomeBackend {
    pub fn new(inner: BackendHandle, owner: impl Into<String>) -> Self {
        let owner = owner.into();
        Self { id: format!("home::{owner}"), owner, inner }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

#[async_trait]
impl StorageBackend for HomeBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Home
    }

    fn instance_of(&self, kind: StorageKind) -> bool {
        kind == StorageKind::Home || self.inner.instance_of(kind)
    }

    async fn stat(&self, path: &Path) -> Result<EntryInfo> {
        self.inner.stat(path).await
    }

    fn list_stream<'a>(&'a self, dir: &'a Path, depth: Depth) -> EntryStream<'a> {
        self.inner.list_stream(dir, depth)
    }

    async fn is_creatable(&self, path: &Path) -> Result<bool> {
        self.inner.is_creatable(path).await
    }
}
