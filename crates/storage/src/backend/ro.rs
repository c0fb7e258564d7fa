//! Read-only storage decorator.
//!
//! Wraps another backend and reports that nothing may be created inside it,
//! while leaving the view of its tree untouched.

use async_trait::async_trait;
use std::path::Path;

use super::{Depth, EntryStream, StorageKind};
use crate::{BackendHandle, StorageBackend, entry::EntryInfo, error::Result};

/// Read-only storage backend.
///
/// The identifier is the inner backend's, so wrapping a storage doesn't
/// invalidate what the cache already knows about it.
#[derive(Clone)]
pub struct ReadOnlyBackend {
    inner: BackendHandle,
}
impl ReadOnlyBackend {
    pub fn new(inner: BackendHandle) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl StorageBackend for ReadOnlyBackend {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> StorageKind {
        StorageKind::ReadOnly
    }

    fn instance_of(&self, kind: StorageKind) -> bool {
        kind == StorageKind::ReadOnly || self.inner.instance_of(kind)
    }

    async fn stat(&self, path: &Path) -> Result<EntryInfo> {
        self.inner.stat(path).await
    }

    fn list_stream<'a>(&'a self, dir: &'a Path, depth: Depth) -> EntryStream<'a> {
        self.inner.list_stream(dir, depth)
    }

    async fn is_creatable(&self, path: &Path) -> Result<bool> {
        tracing::debug!(path = %path.display(), storage = self.id(), "Refusing creation on read-only storage");
        Ok(false)
    }
}
