//! Storage-relative paths.
//!
//! A storage path never leaves its storage root: `..` may not climb past it,
//! Windows prefixes and null bytes are rejected. Leading separators are
//! ignored, so `/folder` and `folder` name the same entry, and the empty
//! path names the root.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Normalise a storage path, or fail with
/// [`InvalidPath`](crate::error::ErrorKind::InvalidPath).
///
/// Only components are looked at: backslashes and non-UTF-8 names pass
/// through untouched.
///
/// ```
/// use std::path::Path;
/// use tidemark_storage::validate_path;
///
/// assert_eq!(validate_path("folder/./bar.txt/").unwrap(), Path::new("folder/bar.txt"));
/// assert_eq!(validate_path("/").unwrap(), Path::new(""));
/// assert!(validate_path("folder/../../etc").is_err());
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let original = path.as_ref();
    let invalid = || ErrorKind::InvalidPath(original.to_path_buf());
    let mut normal = Vec::new();
    for component in original.components() {
        match component {
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir => {
                normal.pop().ok_or_else(invalid)?;
            },
            // Would truncate the path once it reaches a syscall.
            Component::Normal(name) if name.as_encoded_bytes().contains(&0) => exn::bail!(invalid()),
            Component::Normal(name) => normal.push(name),
            Component::Prefix(_) => exn::bail!(invalid()),
        }
    }
    Ok(normal.into_iter().collect())
}
