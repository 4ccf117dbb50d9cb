//! The shared key → URL table for statically located indexes.
//!
//! The table is a community-maintained TOML document:
//!
//! ```toml
//! [missions.go.ssi]
//! index = "https://pds-imaging.jpl.nasa.gov/data/go/ssi/.../index.lbl"
//! ```
//!
//! The top-level `missions` table is optional, and a flat
//! `["mission.instrument"]` section is accepted as well. A local copy is kept
//! at a configurable path. It is downloaded on first use and compared against
//! the canonical source at most once per 24 hours, with the ledger entry
//! [`STATIC_CONFIG_KEY`] recording when.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info, warn};
use snafu::prelude::*;
use tokio::sync::Mutex;
use toml::{Table, Value};

use crate::{
    http::RemoteClient,
    key::IndexKey,
    ledger::Ledger,
    remote::{
        LedgerSnafu, RemoteResult, UrlConfigSnafu, UrlSerializeSnafu, UrlStorageSnafu,
    },
    storage::{self, StorageLocation},
};

/// Ledger key under which the static document's own freshness is tracked.
pub const STATIC_CONFIG_KEY: &str = "indexes.static.config";

const MISSIONS_TABLE: &str = "missions";

fn config_key() -> IndexKey {
    IndexKey::from_static("indexes", "static", "config")
}

/// Local, self-refreshing copy of the static URL document.
#[derive(Debug)]
pub struct StaticUrlTable {
    location: StorageLocation,
    rel_path: PathBuf,
    source: String,
    ledger: Arc<Ledger>,
    client: Arc<dyn RemoteClient>,
    doc: Mutex<Option<Table>>,
}

impl StaticUrlTable {
    /// A table backed by `path`, fetched from `source` when needed.
    ///
    /// Nothing is read until the first lookup.
    pub fn new(
        path: &Path,
        source: impl Into<String>,
        ledger: Arc<Ledger>,
        client: Arc<dyn RemoteClient>,
    ) -> Self {
        let (location, rel_path) = StorageLocation::for_file(path);
        Self {
            location,
            rel_path,
            source: source.into(),
            ledger,
            client,
            doc: Mutex::new(None),
        }
    }

    /// Path of the local copy.
    pub fn path(&self) -> PathBuf {
        self.location.join(&self.rel_path)
    }

    fn path_str(&self) -> String {
        self.path().display().to_string()
    }

    /// URL configured for `key`, refreshing the document first when due.
    ///
    /// Absent and empty entries both yield `None`.
    pub async fn url_for(&self, key: &IndexKey) -> RemoteResult<Option<String>> {
        self.refresh_if_due().await?;
        let doc = self.doc.lock().await;
        let url = doc.as_ref().and_then(|d| lookup(d, key));
        if url.is_none() {
            warn!("no static URL configured for {key}");
        }
        Ok(url)
    }

    /// Set the URL for `key` and persist the document.
    pub async fn set_url(&self, key: &IndexKey, url: &str) -> RemoteResult<()> {
        let mut doc = self.doc.lock().await;
        let mut next = match doc.take() {
            Some(d) => d,
            None => self.read_local().await?.unwrap_or_default(),
        };

        insert_url(&mut next, key, url);

        let text = toml::to_string_pretty(&next).context(UrlSerializeSnafu);
        let text = match text {
            Ok(t) => t,
            Err(e) => {
                *doc = Some(next);
                return Err(e);
            }
        };
        let res = storage::write_atomic(&self.location, &self.rel_path, text.as_bytes())
            .await
            .context(UrlStorageSnafu {
                path: self.path_str(),
            });
        *doc = Some(next);
        res
    }

    /// Mission names in the document.
    pub async fn list_missions(&self) -> RemoteResult<Vec<String>> {
        self.ensure_loaded().await?;
        let doc = self.doc.lock().await;
        Ok(doc
            .as_ref()
            .map(|d| all_keys(d).into_iter().map(|k| k.mission().to_string()).collect::<BTreeSet<_>>())
            .unwrap_or_default()
            .into_iter()
            .collect())
    }

    /// Instrument names configured for `mission`.
    pub async fn list_instruments(&self, mission: &str) -> RemoteResult<Vec<String>> {
        self.ensure_loaded().await?;
        let doc = self.doc.lock().await;
        Ok(doc
            .as_ref()
            .map(|d| {
                all_keys(d)
                    .into_iter()
                    .filter(|k| k.mission() == mission)
                    .map(|k| k.instrument().to_string())
                    .collect::<BTreeSet<_>>()
            })
            .unwrap_or_default()
            .into_iter()
            .collect())
    }

    /// Index names configured for `mission.instrument`.
    pub async fn list_indexes(&self, mission: &str, instrument: &str) -> RemoteResult<Vec<String>> {
        self.ensure_loaded().await?;
        let doc = self.doc.lock().await;
        Ok(doc
            .as_ref()
            .map(|d| {
                all_keys(d)
                    .into_iter()
                    .filter(|k| k.mission() == mission && k.instrument() == instrument)
                    .map(|k| k.indexname().to_string())
                    .collect::<BTreeSet<_>>()
            })
            .unwrap_or_default()
            .into_iter()
            .collect())
    }

    /// Every key with a configured URL.
    pub async fn keys(&self) -> RemoteResult<Vec<IndexKey>> {
        self.ensure_loaded().await?;
        let doc = self.doc.lock().await;
        Ok(doc.as_ref().map(all_keys).unwrap_or_default())
    }

    async fn read_local(&self) -> RemoteResult<Option<Table>> {
        match storage::read_to_string(&self.location, &self.rel_path).await {
            Ok(text) => {
                let table = toml::from_str::<Table>(&text).context(UrlConfigSnafu {
                    path: self.path_str(),
                })?;
                Ok(Some(table))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(source) => Err(source).context(UrlStorageSnafu {
                path: self.path_str(),
            }),
        }
    }

    async fn fetch_remote(&self) -> Option<(String, Table)> {
        let text = match self.client.get_text(&self.source).await {
            Ok(t) => t,
            Err(e) => {
                warn!("could not fetch static URL document from {}: {e}", self.source);
                return None;
            }
        };
        match toml::from_str::<Table>(&text) {
            Ok(table) => Some((text, table)),
            Err(e) => {
                warn!("static URL document at {} is not valid TOML: {e}", self.source);
                None
            }
        }
    }

    async fn write_local(&self, text: &str) -> RemoteResult<()> {
        storage::write_atomic(&self.location, &self.rel_path, text.as_bytes())
            .await
            .context(UrlStorageSnafu {
                path: self.path_str(),
            })
    }

    /// Load the local copy, downloading it when missing. Offline with no
    /// local copy leaves the table empty.
    async fn ensure_loaded(&self) -> RemoteResult<()> {
        let mut doc = self.doc.lock().await;
        if doc.is_some() {
            return Ok(());
        }

        if let Some(local) = self.read_local().await? {
            debug!("read static URL document from {}", self.path_str());
            *doc = Some(local);
            return Ok(());
        }

        info!("downloading static URL document from {}", self.source);
        match self.fetch_remote().await {
            Some((text, table)) => {
                self.write_local(&text).await?;
                self.ledger
                    .record_update(&config_key())
                    .await
                    .context(LedgerSnafu)?;
                self.ledger
                    .record_check(&config_key())
                    .await
                    .context(LedgerSnafu)?;
                *doc = Some(table);
            }
            None => {
                self.ledger
                    .record_check(&config_key())
                    .await
                    .context(LedgerSnafu)?;
                *doc = Some(Table::new());
            }
        }
        Ok(())
    }

    /// Compare against the canonical source if the 24 hour window elapsed.
    ///
    /// Returns whether the local copy was replaced.
    pub async fn refresh_if_due(&self) -> RemoteResult<bool> {
        self.ensure_loaded().await?;
        if !self.ledger.should_check(&config_key()).await {
            return Ok(false);
        }
        self.refresh().await
    }

    /// Compare against the canonical source now.
    pub async fn refresh(&self) -> RemoteResult<bool> {
        self.ensure_loaded().await?;
        let key = config_key();
        let fetched = self.fetch_remote().await;
        self.ledger.record_check(&key).await.context(LedgerSnafu)?;

        let Some((text, remote)) = fetched else {
            return Ok(false);
        };

        let mut doc = self.doc.lock().await;
        let local = doc.clone().unwrap_or_default();
        if local == remote {
            debug!("static URL document is up to date");
            return Ok(false);
        }

        let before: BTreeSet<IndexKey> = all_keys(&local).into_iter().collect();
        let added: Vec<String> = all_keys(&remote)
            .into_iter()
            .filter(|k| !before.contains(k))
            .map(|k| k.to_string())
            .collect();
        if added.is_empty() {
            info!("static URL document changed; updating local copy");
        } else {
            info!("static URL document adds: {}", added.join(", "));
        }

        self.write_local(&text).await?;
        self.ledger.record_update(&key).await.context(LedgerSnafu)?;
        *doc = Some(remote);
        Ok(true)
    }
}

/// `table[name]` as a table, detached. A missing or non-table value yields an
/// empty table.
fn take_table(table: &mut Table, name: &str) -> Table {
    match table.remove(name) {
        Some(Value::Table(t)) => t,
        _ => Table::new(),
    }
}

fn insert_url(doc: &mut Table, key: &IndexKey, url: &str) {
    let nested = doc.contains_key(MISSIONS_TABLE);
    let mut root = if nested {
        take_table(doc, MISSIONS_TABLE)
    } else {
        std::mem::take(doc)
    };

    let mut mission = take_table(&mut root, key.mission());
    let mut instrument = take_table(&mut mission, key.instrument());
    instrument.insert(key.indexname().to_string(), Value::String(url.to_string()));
    mission.insert(key.instrument().to_string(), Value::Table(instrument));
    root.insert(key.mission().to_string(), Value::Table(mission));

    if nested {
        doc.insert(MISSIONS_TABLE.to_string(), Value::Table(root));
    } else {
        *doc = root;
    }
}

fn root_of(doc: &Table) -> &Table {
    match doc.get(MISSIONS_TABLE) {
        Some(Value::Table(t)) => t,
        _ => doc,
    }
}

fn non_empty(v: Option<&Value>) -> Option<String> {
    v.and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn lookup(doc: &Table, key: &IndexKey) -> Option<String> {
    let root = root_of(doc);

    let nested = root
        .get(key.mission())
        .and_then(Value::as_table)
        .and_then(|m| m.get(key.instrument()))
        .and_then(Value::as_table)
        .and_then(|i| i.get(key.indexname()));
    if let Some(url) = non_empty(nested) {
        return Some(url);
    }

    let flat = root
        .get(&key.instrument_key())
        .and_then(Value::as_table)
        .and_then(|i| i.get(key.indexname()));
    non_empty(flat)
}

fn all_keys(doc: &Table) -> Vec<IndexKey> {
    let mut out = BTreeSet::new();
    for (mission, v) in root_of(doc) {
        let Some(instruments) = v.as_table() else { continue };

        if let Some((m, i)) = mission.split_once('.') {
            for (name, url) in instruments {
                if non_empty(Some(url)).is_some()
                    && let Ok(k) = IndexKey::new(m, i, name)
                {
                    out.insert(k);
                }
            }
            continue;
        }

        for (instrument, names) in instruments {
            let Some(names) = names.as_table() else { continue };
            for (name, url) in names {
                if non_empty(Some(url)).is_some()
                    && let Ok(k) = IndexKey::new(mission, instrument, name)
                {
                    out.insert(k);
                }
            }
        }
    }
    out.into_iter().collect()
}
