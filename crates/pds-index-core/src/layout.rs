//! On-disk layout of cached index artifacts.
//!
//! For each [`IndexKey`] all files live in one directory under the storage
//! root:
//!
//! ```text
//! {storage_root}/{mission}/{instrument}/indexes/{indexname}/
//!     <name>.lbl | <name>.LBL     label, as published
//!     <name>.tab | <name>.TAB     table, as published
//!     <name>.parq                 columnar cache
//! ```
//!
//! `<name>` is the file stem of the label URL. The archive's own casing is
//! kept so that the table URL can be derived from the label URL by a
//! case-sensitive extension swap.

use std::path::{Path, PathBuf};

use crate::{
    key::IndexKey,
    storage::{self, StorageLocation, StorageResult},
};

/// Name of the per-instrument directory that holds index subdirectories.
pub const INDEXES_DIR_NAME: &str = "indexes";

/// Extension of the columnar cache file.
pub const CACHE_EXT: &str = "parq";

/// Extension of fixed-width tables.
pub const TABLE_EXT: &str = "tab";

/// Extension of inventory-style CSV tables.
pub const INVENTORY_TABLE_EXT: &str = "csv";

/// Relative path: `{mission}/{instrument}/indexes/{indexname}/`
pub fn index_rel_dir(key: &IndexKey) -> PathBuf {
    PathBuf::from(key.mission())
        .join(key.instrument())
        .join(INDEXES_DIR_NAME)
        .join(key.indexname())
}

/// Final path segment of a URL, ignoring any query or fragment.
pub fn url_file_name(url: &str) -> Option<&str> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
}

/// Table URL for a label URL: `.lbl` becomes `.tab`, `.LBL` becomes `.TAB`.
///
/// Returns `None` when the URL does not end in a label extension of either
/// casing. Mixed casing such as `.Lbl` is not an archive convention and is
/// rejected rather than guessed.
pub fn table_url_for_label_url(label_url: &str) -> Option<String> {
    swap_label_ext(label_url, TABLE_EXT)
}

/// Like [`table_url_for_label_url`] with a different table extension.
pub fn table_url_with_ext(label_url: &str, ext: &str) -> Option<String> {
    swap_label_ext(label_url, ext)
}

fn swap_label_ext(name: &str, ext: &str) -> Option<String> {
    if let Some(stem) = name.strip_suffix(".lbl") {
        Some(format!("{stem}.{}", ext.to_ascii_lowercase()))
    } else {
        name.strip_suffix(".LBL")
            .map(|stem| format!("{stem}.{}", ext.to_ascii_uppercase()))
    }
}

fn is_label_name(name: &str) -> bool {
    name.ends_with(".lbl") || name.ends_with(".LBL")
}

/// Paths of the label, table and cache files for one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheArtifact {
    location: StorageLocation,
    rel_dir: PathBuf,
    label_name: String,
    table_ext: String,
}

impl CacheArtifact {
    /// Layout for a label whose file name is `label_name`.
    ///
    /// A name without a label extension is treated as a stem and gets `.lbl`.
    pub fn new(storage_root: &StorageLocation, key: &IndexKey, label_name: &str) -> Self {
        let label_name = if is_label_name(label_name) {
            label_name.to_string()
        } else {
            format!("{label_name}.lbl")
        };
        Self {
            location: storage_root.clone(),
            rel_dir: index_rel_dir(key),
            label_name,
            table_ext: TABLE_EXT.to_string(),
        }
    }

    /// Use `ext` (e.g. [`INVENTORY_TABLE_EXT`]) for the table file.
    pub fn with_table_ext(mut self, ext: &str) -> Self {
        self.table_ext = ext.to_string();
        self
    }

    /// Layout derived from a resolved label URL.
    pub fn for_url(storage_root: &StorageLocation, key: &IndexKey, label_url: &str) -> Self {
        let name = url_file_name(label_url).unwrap_or(key.indexname());
        Self::new(storage_root, key, name)
    }

    /// Layout recovered from what is already on disk.
    ///
    /// When `current_url` (the last downloaded label URL) names a label or
    /// cache present in the directory, that layout wins, so a label left over
    /// from an earlier file name cannot shadow it. Otherwise prefers any label
    /// file; failing that, a cache file (whose stem implies a lowercase
    /// label). Returns `None` when the directory holds neither.
    pub async fn discover(
        storage_root: &StorageLocation,
        key: &IndexKey,
        current_url: Option<&str>,
    ) -> StorageResult<Option<Self>> {
        let rel_dir = index_rel_dir(key);
        let names = storage::list_file_names(storage_root, &rel_dir).await?;

        if let Some(name) = current_url.and_then(url_file_name).filter(|n| is_label_name(n)) {
            let known = Self::new(storage_root, key, name);
            let cache_name = format!("{}.{CACHE_EXT}", known.stem());
            if names.iter().any(|n| n == name || *n == cache_name) {
                return Ok(Some(known));
            }
        }

        if let Some(label) = names.iter().find(|n| is_label_name(n)) {
            return Ok(Some(Self::new(storage_root, key, label)));
        }

        let cache_suffix = format!(".{CACHE_EXT}");
        Ok(names
            .iter()
            .find_map(|n| n.strip_suffix(&cache_suffix))
            .map(|stem| Self::new(storage_root, key, stem)))
    }

    /// Storage location all relative paths resolve against.
    pub fn location(&self) -> &StorageLocation {
        &self.location
    }

    /// Relative directory of this index.
    pub fn rel_dir(&self) -> &Path {
        &self.rel_dir
    }

    /// Label file name, e.g. `cumindex.lbl`.
    pub fn label_name(&self) -> &str {
        &self.label_name
    }

    fn stem(&self) -> &str {
        self.label_name
            .strip_suffix(".lbl")
            .or_else(|| self.label_name.strip_suffix(".LBL"))
            .unwrap_or(&self.label_name)
    }

    /// Relative path of the label file.
    pub fn label_rel(&self) -> PathBuf {
        self.rel_dir.join(&self.label_name)
    }

    /// Relative path of the table file, using the label's extension casing.
    pub fn table_rel(&self) -> PathBuf {
        let name = swap_label_ext(&self.label_name, &self.table_ext)
            .unwrap_or_else(|| format!("{}.{}", self.stem(), self.table_ext));
        self.rel_dir.join(name)
    }

    /// Relative path of the columnar cache file.
    pub fn cache_rel(&self) -> PathBuf {
        self.rel_dir.join(format!("{}.{CACHE_EXT}", self.stem()))
    }

    /// Absolute label path.
    pub fn label_path(&self) -> PathBuf {
        self.location.join(&self.label_rel())
    }

    /// Absolute table path.
    pub fn table_path(&self) -> PathBuf {
        self.location.join(&self.table_rel())
    }

    /// Absolute cache path.
    pub fn cache_path(&self) -> PathBuf {
        self.location.join(&self.cache_rel())
    }

    /// Whether the label file exists locally.
    pub async fn has_label(&self) -> StorageResult<bool> {
        storage::file_exists(&self.location, &self.label_rel()).await
    }

    /// Whether the table file exists locally.
    pub async fn has_table(&self) -> StorageResult<bool> {
        storage::file_exists(&self.location, &self.table_rel()).await
    }

    /// Whether the columnar cache exists locally.
    pub async fn has_cache(&self) -> StorageResult<bool> {
        storage::file_exists(&self.location, &self.cache_rel()).await
    }
}
