//! Runtime settings shared by every collaborator of the index engine.
//!
//! Settings are plain data. They are resolved once (usually through
//! [`IndexSettings::from_env`]) and handed to [`crate::catalog::IndexCatalog`],
//! which passes the relevant parts down; nothing reads environment variables
//! after construction.

use std::{path::PathBuf, time::Duration};

use log::warn;

/// Environment variable overriding the cache root directory.
pub const ENV_STORAGE_ROOT: &str = "PDS_INDEX_STORAGE_ROOT";
/// Environment variable overriding the freshness ledger path.
pub const ENV_LEDGER: &str = "PDS_INDEX_LEDGER";
/// Environment variable overriding the local static URL document path.
pub const ENV_URLS: &str = "PDS_INDEX_URLS";

/// Canonical network location of the community-maintained static URL table.
pub const DEFAULT_STATIC_URLS_SOURCE: &str = "https://raw.githubusercontent.com/planetarypy/planetarypy_configs/refs/heads/main/planetarypy_index_urls.toml";

const DEFAULT_ROOT_DIR: &str = "pds_index_data";
const DEFAULT_LEDGER_NAME: &str = ".pds_index_ledger.toml";
const DEFAULT_URLS_NAME: &str = ".pds_index_urls.toml";

/// Settings for locating artifacts and tuning the acquisition pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSettings {
    /// Root of the local cache tree (`{root}/{mission}/{instrument}/indexes/{name}/`).
    pub storage_root: PathBuf,
    /// Freshness ledger file.
    pub ledger_path: PathBuf,
    /// Local copy of the static URL document.
    pub static_urls_path: PathBuf,
    /// Where the static URL document is fetched from.
    pub static_urls_source: String,
    /// Timeout for staleness probes (HEAD requests, listing pages).
    pub probe_timeout: Duration,
    /// Rows between decoder progress reports.
    pub chunk_rows: usize,
    /// Lines between progress log messages.
    pub progress_every: usize,
    /// Keep columns with mixed numeric/text content as text.
    pub coerce_mixed_to_text: bool,
}

impl IndexSettings {
    /// Settings with every artifact placed under `root`.
    ///
    /// The ledger and static URL document live directly in `root`, the cache
    /// tree below it. Mostly useful for tests and sandboxed runs.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            ledger_path: root.join(DEFAULT_LEDGER_NAME),
            static_urls_path: root.join(DEFAULT_URLS_NAME),
            storage_root: root,
            static_urls_source: DEFAULT_STATIC_URLS_SOURCE.to_string(),
            probe_timeout: Duration::from_secs(15),
            chunk_rows: 65_536,
            progress_every: 100_000,
            coerce_mixed_to_text: true,
        }
    }

    /// Resolve settings from the user's home directory and the `PDS_INDEX_*`
    /// environment overrides.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let home = dirs_next::home_dir().unwrap_or_else(|| {
            warn!("could not determine home directory; using the current directory");
            PathBuf::from(".")
        });

        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mut settings = Self::with_root(home.join(DEFAULT_ROOT_DIR));
        settings.ledger_path = non_empty(ENV_LEDGER)
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(DEFAULT_LEDGER_NAME));
        settings.static_urls_path = non_empty(ENV_URLS)
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(DEFAULT_URLS_NAME));
        if let Some(root) = non_empty(ENV_STORAGE_ROOT) {
            settings.storage_root = PathBuf::from(root);
        }
        settings
    }

    /// Override the static URL source location.
    pub fn with_static_urls_source(mut self, source: impl Into<String>) -> Self {
        self.static_urls_source = source.into();
        self
    }

    /// Override the probe timeout.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Override the decoder reporting interval. Zero is clamped to one.
    pub fn with_chunk_rows(mut self, rows: usize) -> Self {
        self.chunk_rows = rows.max(1);
        self
    }

    /// Override the mixed-type policy.
    pub fn with_coerce_mixed_to_text(mut self, coerce: bool) -> Self {
        self.coerce_mixed_to_text = coerce;
        self
    }
}
