//! Storage Error Types

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// A storage error, carrying the location it was raised at.
pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

/// What went wrong while looking at a storage.
///
/// The scanner only tells [`NotFound`](Self::NotFound) apart (the entry
/// vanished and leaves the cache); everything else fails the scan of the
/// storage.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("no such entry: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    #[display("access to {} denied", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    #[display("I/O failure: {_0}")]
    Io(IoError),
    /// Not relative to the storage root, or escaping it.
    #[display("path not valid within a storage: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    #[display("storage failure: {_0}")]
    BackendError(#[error(not(source))] String),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Whether scanning the storage again later might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::BackendError(_))
    }
}
