//! Storage backends for the tidemark metadata scanner.
//!
//! Every backend exposes one tree of files and directories through the
//! [`StorageBackend`] trait. Paths handed to a backend are always relative to
//! that backend's root; the empty path is the root itself. Mapping backends
//! into one logical tree (mounting) happens further up, in the scanner.

pub mod backend;
mod entry;
pub mod error;
mod path;

pub use crate::backend::{Depth, StorageBackend, StorageKind};
pub use crate::entry::{EntryInfo, EntryKind};
pub use crate::path::validate as validate_path;
use std::sync::Arc;

pub type BackendHandle = Arc<dyn StorageBackend + Send + Sync>;
