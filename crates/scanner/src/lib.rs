//! Scanning of a mounted, multi-storage tree into the metadata cache.
//!
//! Storages are attached to a logical tree through a [`MountTable`]. The
//! [`Scanner`] walks every storage beneath a logical directory, reconciles
//! each with the cache (one [`StorageScanner`] per storage), translates what
//! happened into logical [`ScanEvent`]s, and finally propagates the changes
//! to every ancestor directory so that their etags reflect their subtrees.
//!
//! # Flow
//! ```text
//! Scanner::scan("/foo")
//!   └─ MountTable::resolve       mounts covering /foo, nested ones deepest-first
//!       └─ StorageScanner::scan  per mount, inside one cache transaction
//!           └─ EventBridge       storage paths → logical paths, staged changes
//!   └─ ChangePropagator          one flush: new etags for every ancestor
//! ```

mod bridge;
pub mod error;
pub mod etag;
mod event;
pub mod logical;
mod mount;
mod propagator;
mod scanner;
mod storage;

pub use crate::bridge::EventBridge;
pub use crate::event::ScanEvent;
pub use crate::mount::{Mount, MountTable};
pub use crate::propagator::{ChangePropagator, ChangeSet};
pub use crate::scanner::{ScanSummary, Scanner};
pub use crate::storage::{EventStream, Reuse, StorageScanner};
