//! Errors surfaced by the index facade.

use snafu::prelude::*;

use crate::{
    decode::DecodeError,
    http::FetchError,
    key::IndexKey,
    label::LabelError,
    ledger::LedgerError,
    materialize::CacheError,
    remote::RemoteError,
    storage::StorageError,
};

/// Errors from [`crate::index::PdsIndex`] operations.
///
/// None of these invalidate an existing cache: a failed refresh leaves the
/// previous cache readable.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IndexError {
    /// The remote could not say where the index lives.
    #[snafu(display("No URL available for {key}"))]
    NoUrlAvailable {
        /// Index key.
        key: IndexKey,
    },

    /// The resolved label URL does not end in `.lbl`/`.LBL`, so the table
    /// URL cannot be derived.
    #[snafu(display("Cannot derive table URL for {key} from {url}"))]
    UnsupportedUrl {
        /// Index key.
        key: IndexKey,
        /// Resolved label URL.
        url: String,
    },

    /// The archive could not be reached during an explicit download.
    #[snafu(display("Network unavailable while downloading {key}: {source}"))]
    NetworkUnavailable {
        /// Index key.
        key: IndexKey,
        /// Transport error.
        source: FetchError,
    },

    /// The archive answered, but the download failed.
    #[snafu(display("Download of {url} failed: {source}"))]
    Download {
        /// URL being downloaded.
        url: String,
        /// Underlying fetch error.
        source: FetchError,
    },

    /// The label has no usable table pointer or column layout.
    #[snafu(display("Malformed label for {key}: {source}"))]
    MalformedLabel {
        /// Index key.
        key: IndexKey,
        /// Label error.
        source: LabelError,
    },

    /// The local table could not be decoded.
    #[snafu(display("Decoding {key} failed: {source}"))]
    Decode {
        /// Index key.
        key: IndexKey,
        /// Decode error.
        source: DecodeError,
    },

    /// Writing or reading the columnar cache failed.
    #[snafu(display("Cache error for {key}: {source}"))]
    Cache {
        /// Index key.
        key: IndexKey,
        /// Cache error.
        source: CacheError,
    },

    /// Local artifact inspection failed.
    #[snafu(display("Storage error for {key}: {source}"))]
    Storage {
        /// Index key.
        key: IndexKey,
        /// Storage error.
        source: StorageError,
    },

    /// The HTTP client could not be built.
    #[snafu(display("HTTP client unavailable: {source}"))]
    Client {
        /// Builder failure.
        source: FetchError,
    },

    /// The freshness ledger could not be read or written.
    #[snafu(display("Ledger error: {source}"))]
    Ledger {
        /// Ledger error.
        source: LedgerError,
    },

    /// URL resolution or freshness checking failed.
    #[snafu(display("Remote error for {key}: {source}"))]
    Remote {
        /// Index key.
        key: IndexKey,
        /// Remote error.
        source: RemoteError,
    },
}

impl IndexError {
    /// Classify a cache failure for `key`, surfacing label and decode
    /// problems as their own variants.
    pub(crate) fn from_cache(key: &IndexKey, err: CacheError) -> Self {
        match err {
            CacheError::Decode {
                source: DecodeError::Label { source },
            } => match source {
                LabelError::MalformedLabel { .. }
                | LabelError::MissingTable { .. }
                | LabelError::InvalidColumn { .. }
                | LabelError::Syntax { .. } => IndexError::MalformedLabel {
                    key: key.clone(),
                    source,
                },
                other => IndexError::Decode {
                    key: key.clone(),
                    source: DecodeError::Label { source: other },
                },
            },
            CacheError::Decode { source } => IndexError::Decode {
                key: key.clone(),
                source,
            },
            other => IndexError::Cache {
                key: key.clone(),
                source: other,
            },
        }
    }

    /// Classify a failed fetch of `url`.
    pub(crate) fn from_fetch(key: &IndexKey, url: &str, err: FetchError) -> Self {
        if err.is_network() {
            IndexError::NetworkUnavailable {
                key: key.clone(),
                source: err,
            }
        } else {
            IndexError::Download {
                url: url.to_string(),
                source: err,
            }
        }
    }

    /// Whether the failure was a missing network connection.
    pub fn is_network(&self) -> bool {
        matches!(self, IndexError::NetworkUnavailable { .. })
    }
}

/// Result alias for facade operations.
pub type IndexResult<T> = Result<T, IndexError>;
