//! Crate-wide error taxonomy.
//!
//! Every public operation returns [`Result<T>`]. `CompareFailed` never escapes this boundary:
//! it is caught and retried by [`crate::store::FsMetaStore::atomic_modify`] and by
//! [`crate::chain::ChainEngine`]. The ABORT-retry signal used internally by `File::sync` is a
//! *different* type ([`crate::chain::EngineSignal`]) so it can never be confused with a
//! user-visible error.

use thiserror::Error;

/// Stable boundary tag for an [`Error`], used by callers that want to match on error kind
/// without matching the full enum (and by adapters, e.g. a FUSE layer, mapping to errno).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotExist,
    Exists,
    NotDir,
    IsDir,
    Invalid,
    IsSymlink,
    NoLease,
    Again,
    Codec,
    Io,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("path or chain does not exist")]
    NotExist,
    #[error("already exists")]
    Exists,
    #[error("not a directory")]
    NotDir,
    #[error("is a directory")]
    IsDir,
    #[error("invalid operation: {0}")]
    Invalid(String),
    #[error("operation not valid on a symlink")]
    IsSymlink,
    #[error("claim attempted without an active lease")]
    NoLease,
    #[error("transient failure, retry at the operation level")]
    Again,
    #[error("malformed on-disk record: {0}")]
    Codec(String),
    #[error("underlying KV or block-store failure: {0}")]
    Io(String),

    /// Internal-only: a compare-and-swap precondition failed. Always retried by
    /// [`crate::store::FsMetaStore::atomic_modify`] and the chain engine's CAS loop; a bug if it
    /// is ever observed by a caller outside this crate.
    #[error("compare-and-swap precondition failed")]
    CompareFailed,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotExist => ErrorKind::NotExist,
            Error::Exists => ErrorKind::Exists,
            Error::NotDir => ErrorKind::NotDir,
            Error::IsDir => ErrorKind::IsDir,
            Error::Invalid(_) => ErrorKind::Invalid,
            Error::IsSymlink => ErrorKind::IsSymlink,
            Error::NoLease => ErrorKind::NoLease,
            Error::Again => ErrorKind::Again,
            Error::Codec(_) => ErrorKind::Codec,
            Error::Io(_) | Error::CompareFailed => ErrorKind::Io,
        }
    }

    pub fn is_compare_failed(&self) -> bool {
        matches!(self, Error::CompareFailed)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
