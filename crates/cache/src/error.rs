//! Cache Error Types

use derive_more::{Display, Error};

/// A cache error, carrying the location it was raised at.
pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// SQLite refused a query (busy, locked, I/O, constraint).
    #[display("cache database failure")]
    Database,
    #[display("could not bring the cache schema up to date")]
    Migration,
    /// A row holds something that cannot be a cache entry.
    #[display("corrupt cache row: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
    /// The transaction behind this handle was committed or rolled back
    /// already.
    #[display("cache transaction is no longer open")]
    TransactionClosed,
    #[display("cache handle is already inside a transaction")]
    NestedTransaction,
}

impl ErrorKind {
    /// Only a busy or locked database is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database)
    }
}
