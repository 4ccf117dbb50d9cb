//! Process-wide owner of the shared collaborators.
//!
//! An [`IndexCatalog`] holds the ledger, static URL table, strategy and
//! fix-up registries and HTTP client, and hands out one [`PdsIndex`] per key.
//! Handing out the same facade for repeated requests is what serialises
//! access per key; [`IndexCatalog::ensure_all`] fans independent keys out
//! concurrently.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
};

use futures::stream::{self, StreamExt};
use log::{info, warn};
use snafu::prelude::*;

use crate::{
    clock::{Clock, SystemClock},
    error::{ClientSnafu, IndexResult, LedgerSnafu},
    fixups::FixupRegistry,
    http::{HttpClient, RemoteClient},
    index::{CacheState, IndexContext, PdsIndex},
    key::IndexKey,
    ledger::Ledger,
    materialize::{IndexKind, Materializer},
    remote::{RemoteContext, RemoteRegistry, StaticUrlTable},
    settings::IndexSettings,
    storage::StorageLocation,
};

/// Builder for an [`IndexCatalog`] with injectable collaborators.
#[derive(Debug)]
pub struct CatalogBuilder {
    settings: IndexSettings,
    client: Option<Arc<dyn RemoteClient>>,
    clock: Option<Arc<dyn Clock>>,
    remotes: RemoteRegistry,
    fixups: FixupRegistry,
    inventory_keys: HashSet<IndexKey>,
}

impl CatalogBuilder {
    /// Builder with built-in listings and fix-ups, a real HTTP client and the
    /// system clock.
    pub fn new(settings: IndexSettings) -> Self {
        Self {
            settings,
            client: None,
            clock: None,
            remotes: RemoteRegistry::with_builtins(),
            fixups: FixupRegistry::with_builtins(),
            inventory_keys: HashSet::new(),
        }
    }

    /// Use `client` for all network access.
    pub fn client(mut self, client: Arc<dyn RemoteClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Use `clock` for ledger timestamps.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replace the strategy registry.
    pub fn remotes(mut self, remotes: RemoteRegistry) -> Self {
        self.remotes = remotes;
        self
    }

    /// Replace the fix-up registry.
    pub fn fixups(mut self, fixups: FixupRegistry) -> Self {
        self.fixups = fixups;
        self
    }

    /// Treat `key` as an inventory index regardless of its name.
    pub fn inventory(mut self, key: IndexKey) -> Self {
        self.inventory_keys.insert(key);
        self
    }

    /// Open the ledger and assemble the catalog.
    pub async fn build(self) -> IndexResult<IndexCatalog> {
        let settings = self.settings;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let client = match self.client {
            Some(client) => client,
            None => Arc::new(HttpClient::new(settings.probe_timeout).context(ClientSnafu)?)
                as Arc<dyn RemoteClient>,
        };

        let ledger = Arc::new(
            Ledger::open(&settings.ledger_path, clock)
                .await
                .context(LedgerSnafu)?,
        );
        let static_urls = Arc::new(StaticUrlTable::new(
            &settings.static_urls_path,
            settings.static_urls_source.clone(),
            ledger.clone(),
            client.clone(),
        ));
        let ctx = IndexContext {
            storage_root: StorageLocation::local(&settings.storage_root),
            remote: RemoteContext {
                ledger,
                client,
                static_urls,
            },
            remotes: Arc::new(self.remotes),
            materializer: Arc::new(Materializer::new(&settings, Arc::new(self.fixups))),
        };

        info!(
            "index catalog at {} (ledger {})",
            settings.storage_root.display(),
            settings.ledger_path.display()
        );
        Ok(IndexCatalog {
            settings,
            ctx,
            inventory_keys: self.inventory_keys,
            indexes: Mutex::new(HashMap::new()),
        })
    }
}

/// Shared collaborators plus one facade per key.
#[derive(Debug)]
pub struct IndexCatalog {
    settings: IndexSettings,
    ctx: IndexContext,
    inventory_keys: HashSet<IndexKey>,
    indexes: Mutex<HashMap<IndexKey, Arc<PdsIndex>>>,
}

impl IndexCatalog {
    /// Catalog with default collaborators for `settings`.
    pub async fn open(settings: IndexSettings) -> IndexResult<Self> {
        CatalogBuilder::new(settings).build().await
    }

    /// Builder for injecting collaborators.
    pub fn builder(settings: IndexSettings) -> CatalogBuilder {
        CatalogBuilder::new(settings)
    }

    /// Settings this catalog was built with.
    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    /// The freshness ledger.
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ctx.remote.ledger
    }

    /// The static URL table.
    pub fn static_urls(&self) -> &Arc<StaticUrlTable> {
        &self.ctx.remote.static_urls
    }

    /// Strategy registry.
    pub fn remotes(&self) -> &RemoteRegistry {
        &self.ctx.remotes
    }

    /// Table format used for `key`.
    pub fn kind_for(&self, key: &IndexKey) -> IndexKind {
        if self.inventory_keys.contains(key) {
            IndexKind::Inventory
        } else {
            IndexKind::for_key(key)
        }
    }

    /// The facade for `key`; the same instance for every call.
    pub fn index(&self, key: &IndexKey) -> Arc<PdsIndex> {
        let mut map = self.indexes.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(key.clone())
            .or_insert_with(|| Arc::new(PdsIndex::new(key.clone(), self.kind_for(key), &self.ctx)))
            .clone()
    }

    /// Ensure caches for `keys`, at most `concurrency` keys at a time.
    ///
    /// Each key's pipeline stays sequential. Results come back in input
    /// order; failures are logged and returned, never fatal to other keys.
    pub async fn ensure_all(
        &self,
        keys: &[IndexKey],
        concurrency: usize,
    ) -> Vec<(IndexKey, IndexResult<CacheState>)> {
        let mut results: Vec<(usize, IndexKey, IndexResult<CacheState>)> =
            stream::iter(keys.iter().cloned().enumerate())
                .map(|(i, key)| async move {
                    let res = self.index(&key).ensure_cache(false).await;
                    if let Err(e) = &res {
                        warn!("{key}: {e}");
                    }
                    (i, key, res)
                })
                .buffer_unordered(concurrency.max(1))
                .collect()
                .await;
        results.sort_by_key(|(i, _, _)| *i);
        results.into_iter().map(|(_, k, r)| (k, r)).collect()
    }
}
