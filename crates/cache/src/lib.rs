//! SQLite metadata cache for the tidemark scanner.
//!
//! The cache remembers what the scanner last saw on every storage: one row per
//! file or directory, keyed by the storage identifier and the path relative
//! to that storage's root. The storages are the source of truth; if the
//! database is deleted, it can be rebuilt by scanning again.
//!
//! # Consistency tokens
//! Every entry carries an etag. A directory's etag changes whenever anything
//! in its subtree changes, which lets clients detect changes by comparing a
//! single value at the top of a tree. Leaf etags are written by the scanner,
//! ancestor etags by the change propagator.

mod cache;
mod db;
pub mod error;
mod models;

pub use crate::cache::Cache;
pub use crate::db::Database;
pub use crate::models::{CacheEntry, CacheUpdate};
