//! Remote resolution: where an index lives and whether it changed.
//!
//! Two strategies implement the [`Remote`] contract:
//!
//! - [`StaticRemote`]: the label URL comes from the shared
//!   [`StaticUrlTable`]; freshness is the target file's `Last-Modified`.
//! - [`DynamicRemote`]: the label URL is discovered by scraping an
//!   [`ArchiveListing`]; freshness is "a different URL was found".
//!
//! Both consult the [`Ledger`] before touching the network, so at most one
//! probe per key happens per 24 hour window. Which strategy serves a key is
//! decided once by [`RemoteRegistry::remote_for`]: keys whose
//! `mission.instrument` has a registered listing are dynamic, all others
//! static. New archives are added by registering a listing.

mod dynamic_remote;
mod listing;
mod static_remote;
mod static_urls;

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use snafu::prelude::*;

use crate::{
    http::RemoteClient,
    key::IndexKey,
    ledger::{Ledger, LedgerError},
    storage::StorageError,
};

pub use dynamic_remote::DynamicRemote;
pub use listing::{ArchiveListing, ReleaseFolder, builtin_listings};
pub use static_remote::StaticRemote;
pub use static_urls::{STATIC_CONFIG_KEY, StaticUrlTable};

/// Errors raised by remote strategies.
///
/// Network failures during probes are not errors (they degrade to "no
/// update"); what remains here is bookkeeping and configuration trouble.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RemoteError {
    /// The ledger could not be read or updated.
    #[snafu(display("Ledger update failed: {source}"))]
    Ledger {
        /// Underlying ledger error.
        source: LedgerError,
    },

    /// Reading or writing the static URL document failed.
    #[snafu(display("Static URL document storage error at {path}: {source}"))]
    UrlStorage {
        /// Document path.
        path: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// The static URL document is not valid TOML.
    #[snafu(display("Static URL document {path} is not valid TOML: {source}"))]
    UrlConfig {
        /// Document path or source URL.
        path: String,
        /// TOML parse error.
        source: toml::de::Error,
    },

    /// The static URL document could not be serialized.
    #[snafu(display("Failed to serialize static URL document: {source}"))]
    UrlSerialize {
        /// TOML serialization error.
        source: toml::ser::Error,
    },
}

/// Result alias for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Which strategy a remote uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    /// Configured URL, timestamp freshness.
    Static,
    /// Scraped URL, URL-change freshness.
    Dynamic,
}

impl fmt::Display for RemoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteKind::Static => f.write_str("static"),
            RemoteKind::Dynamic => f.write_str("dynamic"),
        }
    }
}

/// Contract shared by all remote strategies.
#[async_trait]
pub trait Remote: fmt::Debug + Send + Sync {
    /// Strategy of this remote.
    fn kind(&self) -> RemoteKind;

    /// Key this remote resolves.
    fn key(&self) -> &IndexKey;

    /// Label URL to download from, if one can be resolved.
    async fn url(&self) -> RemoteResult<Option<String>>;

    /// Whether a newer copy than the local one exists.
    ///
    /// A stored `true` is returned as is. Otherwise the network is consulted
    /// only when the 24 hour window has elapsed; offline probes yield `false`.
    async fn update_available(&self) -> RemoteResult<bool>;

    /// Probe now, ignoring the 24 hour window.
    async fn refresh(&self) -> RemoteResult<bool>;

    /// Bookkeeping after `url` was downloaded and cached successfully.
    async fn acknowledge_download(&self, url: &str) -> RemoteResult<()>;
}

/// Shared collaborators handed to every remote.
#[derive(Debug, Clone)]
pub struct RemoteContext {
    /// Freshness ledger.
    pub ledger: Arc<Ledger>,
    /// Network client.
    pub client: Arc<dyn RemoteClient>,
    /// Static URL table.
    pub static_urls: Arc<StaticUrlTable>,
}

/// Instrument-key → listing registry selecting the strategy per index.
#[derive(Debug, Clone, Default)]
pub struct RemoteRegistry {
    listings: HashMap<String, ArchiveListing>,
}

impl RemoteRegistry {
    /// An empty registry: every key resolves statically.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in archive listings.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        for (instrument_key, listing) in builtin_listings() {
            reg.register(instrument_key, listing);
        }
        reg
    }

    /// Register (or replace) the listing for `mission.instrument`.
    pub fn register(&mut self, instrument_key: impl Into<String>, listing: ArchiveListing) {
        self.listings.insert(instrument_key.into(), listing);
    }

    /// Listing registered for `key`'s instrument, if any.
    pub fn listing_for(&self, key: &IndexKey) -> Option<&ArchiveListing> {
        self.listings.get(&key.instrument_key())
    }

    /// Strategy that serves `key`.
    pub fn kind_for(&self, key: &IndexKey) -> RemoteKind {
        if self.listing_for(key).is_some() {
            RemoteKind::Dynamic
        } else {
            RemoteKind::Static
        }
    }

    /// Build the remote for `key`.
    pub fn remote_for(&self, key: &IndexKey, ctx: &RemoteContext) -> Arc<dyn Remote> {
        match self.listing_for(key) {
            Some(listing) => Arc::new(DynamicRemote::new(
                key.clone(),
                listing.clone(),
                ctx.ledger.clone(),
                ctx.client.clone(),
            )),
            None => Arc::new(StaticRemote::new(
                key.clone(),
                ctx.static_urls.clone(),
                ctx.ledger.clone(),
                ctx.client.clone(),
            )),
        }
    }
}
