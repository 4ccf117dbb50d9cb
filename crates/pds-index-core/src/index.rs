//! Per-key entry point: "give me current data", "is an update available",
//! "force a refresh".
//!
//! A [`PdsIndex`] owns the artifacts of one [`IndexKey`]. All operations that
//! touch those artifacts take the facade's operation lock, so download,
//! decode and cache write for one key never interleave. Different keys are
//! independent.
//!
//! State moves `Uncached → Downloading → Decoding → Cached`. Staleness is
//! orthogonal and comes from the ledger's stored flag.

use std::{
    fmt,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use arrow::record_batch::RecordBatch;
use log::{debug, error, info, warn};
use snafu::prelude::*;
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    error::{
        IndexError, IndexResult, NoUrlAvailableSnafu, RemoteSnafu, StorageSnafu,
        UnsupportedUrlSnafu,
    },
    http::RemoteClient,
    inventory,
    key::IndexKey,
    layout::{self, CacheArtifact},
    ledger::Ledger,
    materialize::{self, CacheReport, IndexKind, Materializer},
    remote::{Remote, RemoteContext, RemoteKind, RemoteRegistry},
    storage::{OutputSink, StorageLocation, open_output_sink},
};

/// Where an index is in its acquisition lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// No columnar cache on disk.
    Uncached,
    /// Label and table are being fetched.
    Downloading,
    /// The local table is being decoded into the cache.
    Decoding,
    /// A columnar cache is on disk.
    Cached,
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CacheState::Uncached => "uncached",
            CacheState::Downloading => "downloading",
            CacheState::Decoding => "decoding",
            CacheState::Cached => "cached",
        };
        f.write_str(s)
    }
}

/// Snapshot of [`PdsIndex::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStatus {
    /// Lifecycle state.
    pub state: CacheState,
    /// Whether the ledger flags a newer remote version.
    pub stale: bool,
}

/// Summary returned by [`PdsIndex::info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    /// Index key.
    pub key: IndexKey,
    /// Table format.
    pub kind: IndexKind,
    /// Resolution strategy.
    pub remote: RemoteKind,
    /// Label URL, when known.
    pub url: Option<String>,
    /// Local artifact paths, when anything is on disk.
    pub artifact: Option<CacheArtifact>,
    /// Lifecycle state and staleness.
    pub status: IndexStatus,
}

/// Collaborators shared by every facade.
#[derive(Debug, Clone)]
pub struct IndexContext {
    /// Root of the cache tree.
    pub storage_root: StorageLocation,
    /// Ledger, client and static URL table.
    pub remote: RemoteContext,
    /// Strategy selection.
    pub remotes: Arc<RemoteRegistry>,
    /// Decode and cache pipeline.
    pub materializer: Arc<Materializer>,
}

/// Facade over one index key.
pub struct PdsIndex {
    key: IndexKey,
    kind: IndexKind,
    storage_root: StorageLocation,
    remote: Arc<dyn Remote>,
    ledger: Arc<Ledger>,
    client: Arc<dyn RemoteClient>,
    materializer: Arc<Materializer>,
    op_lock: AsyncMutex<()>,
    state: Mutex<CacheState>,
}

impl fmt::Debug for PdsIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PdsIndex")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("remote", &self.remote.kind())
            .field("state", &self.state())
            .finish()
    }
}

impl PdsIndex {
    /// Facade for `key`, with the remote strategy picked from `ctx`.
    pub fn new(key: IndexKey, kind: IndexKind, ctx: &IndexContext) -> Self {
        let remote = ctx.remotes.remote_for(&key, &ctx.remote);
        Self::with_remote(key, kind, ctx, remote)
    }

    /// Facade for `key` using an explicit remote.
    pub fn with_remote(key: IndexKey, kind: IndexKind, ctx: &IndexContext, remote: Arc<dyn Remote>) -> Self {
        Self {
            key,
            kind,
            storage_root: ctx.storage_root.clone(),
            remote,
            ledger: ctx.remote.ledger.clone(),
            client: ctx.remote.client.clone(),
            materializer: ctx.materializer.clone(),
            op_lock: AsyncMutex::new(()),
            state: Mutex::new(CacheState::Uncached),
        }
    }

    /// Index key.
    pub fn key(&self) -> &IndexKey {
        &self.key
    }

    /// Table format.
    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    /// Remote strategy serving this key.
    pub fn remote(&self) -> &Arc<dyn Remote> {
        &self.remote
    }

    fn state(&self) -> CacheState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: CacheState) {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *guard != state {
            debug!("{}: {} -> {state}", self.key, *guard);
            *guard = state;
        }
    }

    /// Artifact paths for whatever is on disk.
    pub async fn local_artifact(&self) -> IndexResult<Option<CacheArtifact>> {
        let current_url = self.ledger.entry(&self.key).await.current_url;
        let found = CacheArtifact::discover(&self.storage_root, &self.key, current_url.as_deref())
            .await
            .context(StorageSnafu { key: self.key.clone() })?;
        Ok(found.map(|a| a.with_table_ext(self.kind.table_ext())))
    }

    async fn has(&self, artifact: &CacheArtifact, what: Component) -> IndexResult<bool> {
        let res = match what {
            Component::Label => artifact.has_label().await,
            Component::Table => artifact.has_table().await,
            Component::Cache => artifact.has_cache().await,
        };
        res.context(StorageSnafu { key: self.key.clone() })
    }

    /// Lifecycle state and staleness. Never touches the network.
    pub async fn status(&self) -> IndexResult<IndexStatus> {
        let mut state = self.state();
        if matches!(state, CacheState::Uncached | CacheState::Cached) {
            state = match self.local_artifact().await? {
                Some(a) if self.has(&a, Component::Cache).await? => CacheState::Cached,
                _ => CacheState::Uncached,
            };
            self.set_state(state);
        }
        let stale = self.ledger.entry(&self.key).await.update_available == Some(true);
        Ok(IndexStatus { state, stale })
    }

    /// Whether a newer remote version is known.
    ///
    /// Returns the ledger's stored flag when it is raised; otherwise probes
    /// only if the 24 hour window has elapsed. Offline means `false`.
    pub async fn update_available(&self) -> IndexResult<bool> {
        self.remote
            .update_available()
            .await
            .context(RemoteSnafu { key: self.key.clone() })
    }

    /// Probe the remote now, regardless of the 24 hour window.
    pub async fn refresh(&self) -> IndexResult<bool> {
        self.remote
            .refresh()
            .await
            .context(RemoteSnafu { key: self.key.clone() })
    }

    /// Make sure the columnar cache exists.
    ///
    /// With `force`, or when the cache is missing, the cache is rebuilt from
    /// the local label and table if both are present, and only downloaded
    /// otherwise.
    pub async fn ensure_cache(&self, force: bool) -> IndexResult<CacheState> {
        let _op = self.op_lock.lock().await;
        let local = self.local_artifact().await?;

        if let Some(artifact) = &local {
            if !force && self.has(artifact, Component::Cache).await? {
                self.set_state(CacheState::Cached);
                return Ok(CacheState::Cached);
            }
            if self.has(artifact, Component::Label).await? && self.has(artifact, Component::Table).await? {
                info!("{}: rebuilding cache from local files", self.key);
                self.materialize(artifact).await?;
                return Ok(CacheState::Cached);
            }
        }

        self.download_locked().await?;
        Ok(CacheState::Cached)
    }

    /// Fetch label and table from the resolved URL and rebuild the cache.
    ///
    /// Failures are logged and returned; whatever cache existed before stays
    /// readable.
    pub async fn download(&self) -> IndexResult<CacheReport> {
        let _op = self.op_lock.lock().await;
        self.download_locked().await
    }

    async fn download_locked(&self) -> IndexResult<CacheReport> {
        let result = self.try_download().await;
        if let Err(e) = &result {
            error!("{}: download failed: {e}", self.key);
            let fallback = match self.local_artifact().await {
                Ok(Some(a)) if a.has_cache().await.unwrap_or(false) => CacheState::Cached,
                _ => CacheState::Uncached,
            };
            self.set_state(fallback);
        }
        result
    }

    async fn try_download(&self) -> IndexResult<CacheReport> {
        let label_url = self
            .remote
            .url()
            .await
            .context(RemoteSnafu { key: self.key.clone() })?
            .context(NoUrlAvailableSnafu { key: self.key.clone() })?;
        let table_url = layout::table_url_with_ext(&label_url, self.kind.table_ext()).context(
            UnsupportedUrlSnafu {
                key: self.key.clone(),
                url: label_url.clone(),
            },
        )?;
        let artifact = CacheArtifact::for_url(&self.storage_root, &self.key, &label_url)
            .with_table_ext(self.kind.table_ext());

        self.set_state(CacheState::Downloading);
        let label = self.fetch(&label_url, &artifact, artifact.label_rel()).await?;
        let table = self.fetch(&table_url, &artifact, artifact.table_rel()).await?;
        // Commit both only once both transfers completed.
        for sink in [label, table] {
            sink.finish()
                .await
                .context(StorageSnafu { key: self.key.clone() })?;
        }

        let report = self.materialize(&artifact).await?;
        self.remote
            .acknowledge_download(&label_url)
            .await
            .context(RemoteSnafu { key: self.key.clone() })?;
        info!("{}: downloaded {label_url}", self.key);
        Ok(report)
    }

    async fn fetch(
        &self,
        url: &str,
        artifact: &CacheArtifact,
        rel: PathBuf,
    ) -> IndexResult<OutputSink> {
        let mut sink = open_output_sink(artifact.location(), &rel)
            .await
            .context(StorageSnafu { key: self.key.clone() })?;
        self.client
            .download(url, &mut sink)
            .await
            .map_err(|e| IndexError::from_fetch(&self.key, url, e))?;
        Ok(sink)
    }

    async fn materialize(&self, artifact: &CacheArtifact) -> IndexResult<CacheReport> {
        self.set_state(CacheState::Decoding);
        match self.materializer.build(&self.key, artifact, self.kind).await {
            Ok(report) => {
                self.set_state(CacheState::Cached);
                Ok(report)
            }
            Err(e) => {
                let had_cache = artifact.has_cache().await.unwrap_or(false);
                self.set_state(if had_cache {
                    CacheState::Cached
                } else {
                    CacheState::Uncached
                });
                Err(IndexError::from_cache(&self.key, e))
            }
        }
    }

    /// The cached dataset. Downloads first when no cache exists.
    pub async fn data(&self) -> IndexResult<RecordBatch> {
        if let Some(artifact) = self.local_artifact().await?
            && self.has(&artifact, Component::Cache).await?
        {
            return self.read(&artifact).await;
        }
        self.ensure_cache(false).await?;
        let artifact = self
            .local_artifact()
            .await?
            .context(NoUrlAvailableSnafu { key: self.key.clone() })?;
        self.read(&artifact).await
    }

    async fn read(&self, artifact: &CacheArtifact) -> IndexResult<RecordBatch> {
        materialize::read_cache(artifact)
            .await
            .map_err(|e| IndexError::from_cache(&self.key, e))
    }

    /// Convenience read with optional refresh.
    ///
    /// Downloads when nothing is local; re-downloads when `force`, or when
    /// `refresh` is set and an update is available. A failed re-download is
    /// logged and the existing cache is served.
    pub async fn get(&self, refresh: bool, force: bool) -> IndexResult<RecordBatch> {
        let has_label = match self.local_artifact().await? {
            Some(a) => self.has(&a, Component::Label).await?,
            None => false,
        };

        if !has_label {
            self.download().await?;
        } else if force || (refresh && self.update_available().await?) {
            if let Err(e) = self.download().await {
                warn!("{}: serving existing cache after failed refresh: {e}", self.key);
            }
        }
        self.data().await
    }

    /// Inventory rows regrouped by observation id.
    pub async fn targets_per_observation(&self) -> IndexResult<RecordBatch> {
        let expanded = self.data().await?;
        inventory::group_by_observation(&expanded).map_err(|source| IndexError::Cache {
            key: self.key.clone(),
            source: materialize::CacheError::Arrow { source },
        })
    }

    /// Paths, remote strategy and URL for this key.
    pub async fn info(&self) -> IndexResult<IndexInfo> {
        let url = self
            .remote
            .url()
            .await
            .context(RemoteSnafu { key: self.key.clone() })?;
        Ok(IndexInfo {
            key: self.key.clone(),
            kind: self.kind,
            remote: self.remote.kind(),
            url,
            artifact: self.local_artifact().await?,
            status: self.status().await?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Component {
    Label,
    Table,
    Cache,
}
