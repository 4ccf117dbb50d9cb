//! Errors for the artifact storage layer.

use std::{error::Error, fmt, io};

use snafu::{Backtrace, prelude::*};

/// Failure reported by the filesystem beneath a [`StorageError`].
#[derive(Debug)]
pub enum BackendError {
    /// Error from the local filesystem.
    Local(io::Error),
}

impl BackendError {
    /// The wrapped I/O error kind.
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            BackendError::Local(e) => e.kind(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Local(e) => write!(f, "filesystem: {e}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BackendError::Local(e) => Some(e),
        }
    }
}

/// Errors reading or writing labels, tables, caches and bookkeeping files.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// The artifact is not on disk.
    #[snafu(display("No such artifact: {path}"))]
    NotFound {
        /// Absolute path that was looked up.
        path: String,
        /// Filesystem error.
        source: BackendError,
        /// Where the lookup failed.
        backtrace: Backtrace,
    },

    /// Any other filesystem failure (permissions, full disk, rename across
    /// devices).
    #[snafu(display("I/O failure on {path}: {source}"))]
    OtherIo {
        /// Absolute path being read or written.
        path: String,
        /// Filesystem error.
        source: BackendError,
        /// Where the failure happened.
        backtrace: Backtrace,
    },
}

impl StorageError {
    /// Whether the artifact is simply absent. Callers treat this as "fetch or
    /// rebuild" rather than as a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    /// Path the failure refers to.
    pub fn path(&self) -> &str {
        match self {
            StorageError::NotFound { path, .. } | StorageError::OtherIo { path, .. } => path,
        }
    }
}
