//! A directory on the local filesystem, read through `tokio::fs`.

use crate::backend::{Depth, EntryStream, StorageKind};
use crate::error::ErrorKind;
use crate::{EntryInfo, StorageBackend, error::Result, path::validate as validate_path};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use std::fs::{Metadata, create_dir_all as sync_create_dir};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs::{self, DirEntry};

/// One directory entry met while walking, before it is yielded.
enum Visited {
    File(EntryInfo),
    /// Also carries the absolute path, to descend into.
    Directory(EntryInfo, PathBuf),
    /// Symlinks, sockets, devices: never scanned.
    Other,
}

/// Storage backed by a local directory.
///
/// Its id is derived from the root, so two mounts of the same directory share
/// their cache entries. Symlinks and special files are invisible.
///
/// # Examples
///
/// ```no_run
/// use tidemark_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("local", "/path/to/data")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocalBackend {
    id: String,
    name: String,
    root: PathBuf,
}
impl LocalBackend {
    /// Use the directory at `root`, creating it when missing.
    ///
    /// Fails with [`InvalidPath`](ErrorKind::InvalidPath) when `root` is
    /// relative or is not a directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }

        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root));
            }
        } else {
            // Blocking, but only ever run while the mount table is assembled.
            sync_create_dir(&root).map_err(|e| Self::io_error(e, &root))?;
        }

        let id = format!("local::{}", root.display());
        Ok(Self { id, name: name.into(), root })
    }

    fn absolute_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_path(path.as_ref())?;
        Ok(self.root.join(validated))
    }

    fn relative_path(&self, absolute: impl AsRef<Path>) -> Result<PathBuf> {
        let absolute = absolute.as_ref();
        if !absolute.is_absolute() {
            exn::bail!(ErrorKind::BackendError(format!(
                "`{}` is not absolute",
                absolute.display()
            )))
        }
        let relative = absolute.strip_prefix(&self.root).or_raise(|| {
            ErrorKind::BackendError(format!("`{}` is outside of `{}`", absolute.display(), self.root.display()))
        })?;
        validate_path(relative)
    }

    fn entry_info(path: &Path, metadata: &Metadata) -> Result<EntryInfo> {
        let modified: OffsetDateTime = metadata.modified().map_err(ErrorKind::Io)?.into();
        if metadata.is_dir() {
            Ok(EntryInfo::directory(path, modified))
        } else {
            Ok(EntryInfo::file(path, metadata.len(), modified))
        }
    }

    fn io_error(e: std::io::Error, path: &Path) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
            _ => ErrorKind::Io(e),
        }
    }

    /// The fallible part of handling one directory entry; the walk yields
    /// the error and carries on with the next entry.
    async fn visit(&self, entry: DirEntry) -> Result<Visited> {
        let absolute = entry.path();
        // `DirEntry::metadata` does not follow symlinks.
        let metadata = entry.metadata().await.map_err(|e| Self::io_error(e, &absolute))?;
        let relative = self.relative_path(&absolute)?;
        Ok(if metadata.is_dir() {
            Visited::Directory(Self::entry_info(&relative, &metadata)?, absolute)
        } else if metadata.is_file() {
            Visited::File(Self::entry_info(&relative, &metadata)?)
        } else {
            Visited::Other
        })
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Local
    }

    async fn stat(&self, path: &Path) -> Result<EntryInfo> {
        let abs_path = self.absolute_path(path)?;
        let relative = validate_path(path)?;
        let metadata = fs::metadata(&abs_path).await.map_err(|e| Self::io_error(e, path))?;
        Self::entry_info(&relative, &metadata)
    }

    fn list_stream<'a>(&'a self, dir: &'a Path, depth: Depth) -> EntryStream<'a> {
        let start_dir = match self.absolute_path(dir) {
            Ok(start) => start,
            Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
        };
        let mut stack = vec![start_dir];

        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // A directory that vanished (or never was one) has no
                    // entries.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) if err.kind() == std::io::ErrorKind::NotADirectory => continue,
                    Err(err) => {
                        yield Err(exn::Exn::from(Self::io_error(err, &current)));
                        continue 'dirs;
                    }
                };

                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => { yield Err(exn::Exn::from(Self::io_error(e, &current))); continue 'entries; },
                    };
                    match self.visit(entry).await {
                        Ok(Visited::File(info)) => yield Ok(info),
                        Ok(Visited::Directory(info, absolute)) => {
                            if depth == Depth::Recursive {
                                stack.push(absolute);
                            }
                            yield Ok(info);
                        },
                        Ok(Visited::Other) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }

    async fn is_creatable(&self, path: &Path) -> Result<bool> {
        let abs_path = self.absolute_path(path)?;
        let metadata = match fs::metadata(&abs_path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(exn::Exn::from(Self::io_error(err, path))),
        };
        if !metadata.is_dir() || metadata.permissions().readonly() {
            return Ok(false);
        }
        writable_by_process(&abs_path).map_err(|err| exn::Exn::from(Self::io_error(err, path)))
    }
}

/// Whether the effective user and group of this process may create entries
/// in `dir`. Write bits alone don't say whose they are.
#[cfg(unix)]
fn writable_by_process(dir: &Path) -> std::io::Result<bool> {
    use rustix::fs::{Access, AtFlags, CWD, accessat};
    use rustix::io::Errno;

    match accessat(CWD, dir, Access::WRITE_OK | Access::EXEC_OK, AtFlags::EACCESS) {
        Ok(()) => Ok(true),
        Err(errno) if [Errno::ACCESS, Errno::PERM, Errno::ROFS].contains(&errno) => Ok(false),
        Err(errno) => Err(errno.into()),
    }
}

#[cfg(not(unix))]
fn writable_by_process(_dir: &Path) -> std::io::Result<bool> {
    Ok(true)
}
