//! Logical (mount-absolute) paths.
//!
//! Logical paths are absolute and normalised: `/`, `/foo`, `/foo/bar.txt`.
//! Storage paths are relative to a storage root, the empty path being the
//! root itself.

use exn::ResultExt;
use std::path::{Path, PathBuf};
use tidemark_storage::validate_path;

use crate::error::{ErrorKind, Result};

/// Normalise `path` into an absolute logical path.
///
/// Relative paths are taken relative to `/`. `..` components that would
/// escape the root are rejected.
pub fn normalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let relative = validate_path(path).or_raise(|| ErrorKind::InvalidPath(path.to_path_buf()))?;
    Ok(Path::new("/").join(relative))
}

/// Join a storage-relative path onto a mount point.
///
/// The empty path maps onto the mount point itself (no trailing separator).
pub fn join(mount_point: &Path, relative: &Path) -> PathBuf {
    if relative.as_os_str().is_empty() {
        mount_point.to_path_buf()
    } else {
        mount_point.join(relative)
    }
}

/// Every strict ancestor of `path`, up to and including `/`.
pub fn parents(path: &Path) -> impl Iterator<Item = &Path> {
    path.ancestors().skip(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/", "/")]
    #[case("", "/")]
    #[case("/foo/", "/foo")]
    #[case("foo/bar", "/foo/bar")]
    #[case("/foo//./bar", "/foo/bar")]
    #[case("/foo/../bar", "/bar")]
    fn test_normalize(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize(input).unwrap(), Path::new(expected));
    }

    #[rstest]
    #[case("/..")]
    #[case("/foo/../../etc")]
    #[case("/a\0b")]
    fn test_normalize_rejects(#[case] input: &str) {
        let err = normalize(input).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPath(_)));
    }

    #[test]
    fn test_join() {
        assert_eq!(join(Path::new("/foo"), Path::new("")), Path::new("/foo"));
        assert_eq!(join(Path::new("/foo"), Path::new("folder/bar.txt")), Path::new("/foo/folder/bar.txt"));
        assert_eq!(join(Path::new("/"), Path::new("")), Path::new("/"));
        assert_eq!(join(Path::new("/"), Path::new("foo.txt")), Path::new("/foo.txt"));
    }

    #[test]
    fn test_parents() {
        let parents: Vec<_> = parents(Path::new("/foo/folder/bar.txt")).collect();
        assert_eq!(parents, vec![Path::new("/foo/folder"), Path::new("/foo"), Path::new("/")]);
        assert_eq!(super::parents(Path::new("/")).count(), 0);
    }
}
