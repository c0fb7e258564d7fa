//! Configuration Error Types

use derive_more::{Display, Error};

/// A configuration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A configuration source could not be read or did not match the
    /// expected shape.
    #[display("failed to load configuration")]
    Load,
    /// The configuration was read but describes an impossible setup.
    #[display("invalid configuration for `{key}`: {reason}")]
    Invalid { key: String, reason: &'static str },
}

impl ErrorKind {
    pub(crate) fn invalid(key: impl Into<String>, reason: &'static str) -> Self {
        Self::Invalid { key: key.into(), reason }
    }
}
