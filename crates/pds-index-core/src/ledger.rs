//! Freshness ledger: per-index check/update bookkeeping.
//!
//! The ledger is a small TOML document, nested `mission → instrument →
//! indexname`, recording for each [`IndexKey`] when it was last probed, when
//! it was last downloaded, which URL the local copy came from and whether a
//! newer remote copy is known to exist.
//!
//! ```toml
//! [mro.ctx.edr]
//! last_checked = "2024-05-01T10:00:00Z"
//! last_updated = "2024-04-02T08:30:12Z"
//! current_url = "https://planetarydata.jpl.nasa.gov/img/data/mro/ctx/mrox_4000/index/cumindex.lbl"
//! update_available = false
//! ```
//!
//! Persistence rules:
//! - Every mutation rewrites the whole file with write-then-rename before the
//!   in-memory copy is changed. A failed write leaves both untouched.
//! - An unreadable or unparsable file is logged and treated as empty.
//! - Mutations within one process are serialized by an async mutex. Separate
//!   processes sharing one file are last-writer-wins.
//!
//! Entries also enforce the flag invariant: `update_available = true` implies
//! `available_url` is set and differs from `current_url`.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Duration, SubsecRound, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tokio::sync::Mutex;

use crate::{
    clock::Clock,
    key::IndexKey,
    storage::{self, StorageError, StorageLocation},
};

/// Length of the probe window.
pub const CHECK_INTERVAL_HOURS: i64 = 24;

/// Errors from loading or persisting the ledger.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LedgerError {
    /// Reading or writing the ledger file failed.
    #[snafu(display("Ledger storage error at {path}: {source}"))]
    Storage {
        /// Ledger file path.
        path: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// The ledger file exists but is not valid ledger TOML.
    #[snafu(display("Corrupt ledger file {path}: {source}"))]
    Corrupt {
        /// Ledger file path.
        path: String,
        /// TOML parse error.
        source: toml::de::Error,
    },

    /// The in-memory ledger could not be serialized.
    #[snafu(display("Failed to serialize ledger: {source}"))]
    Serialize {
        /// TOML serialization error.
        source: toml::ser::Error,
    },

    /// A value of the wrong kind was supplied for a field.
    #[snafu(display("Ledger field {field} expects a {expected} value"))]
    FieldType {
        /// Field being set.
        field: LedgerField,
        /// Kind of value the field holds.
        expected: &'static str,
    },

    /// The mutation would flag an update without a distinct available URL.
    #[snafu(display(
        "Ledger entry {key}: update_available requires an available_url different from current_url"
    ))]
    Invariant {
        /// Entry key.
        key: IndexKey,
    },
}

/// Convenience alias for ledger results.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// One index's bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// When the remote was last probed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    /// When the local copy was last downloaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    /// URL the local copy came from (dynamic remotes only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_url: Option<String>,
    /// URL of a newer copy, when one is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_url: Option<String>,
    /// `None` until the first probe decides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_available: Option<bool>,
    /// Last-modified time reported by the latest static probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_timestamp: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    fn satisfies_invariant(&self) -> bool {
        if self.update_available != Some(true) {
            return true;
        }
        match &self.available_url {
            Some(url) if !url.is_empty() => self.current_url.as_deref() != Some(url.as_str()),
            _ => false,
        }
    }
}

/// Addressable fields of a [`LedgerEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerField {
    /// `last_checked`
    LastChecked,
    /// `last_updated`
    LastUpdated,
    /// `current_url`
    CurrentUrl,
    /// `available_url`
    AvailableUrl,
    /// `update_available`
    UpdateAvailable,
    /// `remote_timestamp`
    RemoteTimestamp,
}

impl std::fmt::Display for LedgerField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LedgerField::LastChecked => "last_checked",
            LedgerField::LastUpdated => "last_updated",
            LedgerField::CurrentUrl => "current_url",
            LedgerField::AvailableUrl => "available_url",
            LedgerField::UpdateAvailable => "update_available",
            LedgerField::RemoteTimestamp => "remote_timestamp",
        };
        f.write_str(s)
    }
}

/// A field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerValue {
    /// A timestamp field.
    Time(DateTime<Utc>),
    /// A URL field.
    Url(String),
    /// The update flag.
    Flag(bool),
}

type LedgerDoc = BTreeMap<String, BTreeMap<String, BTreeMap<String, LedgerEntry>>>;

/// File-backed, process-shared freshness ledger.
#[derive(Debug)]
pub struct Ledger {
    location: StorageLocation,
    rel_path: PathBuf,
    clock: Arc<dyn Clock>,
    doc: Mutex<LedgerDoc>,
}

impl Ledger {
    /// Load the ledger at `path`, starting empty when the file is missing or
    /// corrupt.
    pub async fn open(path: &Path, clock: Arc<dyn Clock>) -> LedgerResult<Self> {
        let (location, rel_path) = StorageLocation::for_file(path);
        let doc = match Self::load(&location, &rel_path).await {
            Ok(doc) => doc,
            Err(LedgerError::Corrupt { path, source }) => {
                warn!("ledger {path} is unreadable, starting fresh: {source}");
                LedgerDoc::new()
            }
            Err(e) => return Err(e),
        };
        Ok(Self {
            location,
            rel_path,
            clock,
            doc: Mutex::new(doc),
        })
    }

    async fn load(location: &StorageLocation, rel_path: &Path) -> LedgerResult<LedgerDoc> {
        let path = location.join(rel_path).display().to_string();
        let text = match storage::read_to_string(location, rel_path).await {
            Ok(t) => t,
            Err(e) if e.is_not_found() => {
                debug!("no ledger at {path}; starting empty");
                return Ok(LedgerDoc::new());
            }
            Err(source) => return Err(LedgerError::Storage { path, source }),
        };
        toml::from_str(&text).context(CorruptSnafu { path })
    }

    /// Path of the ledger file.
    pub fn path(&self) -> PathBuf {
        self.location.join(&self.rel_path)
    }

    /// The ledger's time source.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(0)
    }

    /// Snapshot of the entry for `key` (default when untracked).
    pub async fn entry(&self, key: &IndexKey) -> LedgerEntry {
        let doc = self.doc.lock().await;
        doc.get(key.mission())
            .and_then(|m| m.get(key.instrument()))
            .and_then(|i| i.get(key.indexname()))
            .cloned()
            .unwrap_or_default()
    }

    /// All tracked keys, in sorted order.
    pub async fn keys(&self) -> Vec<IndexKey> {
        let doc = self.doc.lock().await;
        let mut out = Vec::new();
        for (mission, instruments) in doc.iter() {
            for (instrument, names) in instruments {
                for name in names.keys() {
                    if let Ok(k) = IndexKey::new(mission, instrument, name) {
                        out.push(k);
                    }
                }
            }
        }
        out
    }

    /// Read one field.
    pub async fn get(&self, key: &IndexKey, field: LedgerField) -> Option<LedgerValue> {
        let e = self.entry(key).await;
        match field {
            LedgerField::LastChecked => e.last_checked.map(LedgerValue::Time),
            LedgerField::LastUpdated => e.last_updated.map(LedgerValue::Time),
            LedgerField::RemoteTimestamp => e.remote_timestamp.map(LedgerValue::Time),
            LedgerField::CurrentUrl => e.current_url.map(LedgerValue::Url),
            LedgerField::AvailableUrl => e.available_url.map(LedgerValue::Url),
            LedgerField::UpdateAvailable => e.update_available.map(LedgerValue::Flag),
        }
    }

    /// Write one field (`None` clears it) and persist.
    pub async fn set(
        &self,
        key: &IndexKey,
        field: LedgerField,
        value: Option<LedgerValue>,
    ) -> LedgerResult<()> {
        let time = |v: Option<LedgerValue>| match v {
            None => Ok(None),
            Some(LedgerValue::Time(t)) => Ok(Some(t.trunc_subsecs(0))),
            Some(_) => FieldTypeSnafu {
                field,
                expected: "timestamp",
            }
            .fail(),
        };
        let url = |v: Option<LedgerValue>| match v {
            None => Ok(None),
            Some(LedgerValue::Url(u)) => Ok(Some(u)),
            Some(_) => FieldTypeSnafu {
                field,
                expected: "URL",
            }
            .fail(),
        };

        match field {
            LedgerField::LastChecked => {
                let v = time(value)?;
                self.mutate(key, |e| e.last_checked = v).await
            }
            LedgerField::LastUpdated => {
                let v = time(value)?;
                self.mutate(key, |e| e.last_updated = v).await
            }
            LedgerField::RemoteTimestamp => {
                let v = time(value)?;
                self.mutate(key, |e| e.remote_timestamp = v).await
            }
            LedgerField::CurrentUrl => {
                let v = url(value)?;
                self.mutate(key, |e| e.current_url = v).await
            }
            LedgerField::AvailableUrl => {
                let v = url(value)?;
                self.mutate(key, |e| e.available_url = v).await
            }
            LedgerField::UpdateAvailable => {
                let v = match value {
                    None => None,
                    Some(LedgerValue::Flag(b)) => Some(b),
                    Some(_) => {
                        return FieldTypeSnafu {
                            field,
                            expected: "boolean",
                        }
                        .fail();
                    }
                };
                self.mutate(key, |e| e.update_available = v).await
            }
        }
    }

    /// Whether a remote probe is due: never checked, or checked at least
    /// [`CHECK_INTERVAL_HOURS`] ago.
    pub async fn should_check(&self, key: &IndexKey) -> bool {
        match self.entry(key).await.last_checked {
            None => true,
            Some(t) => self.now() - t >= Duration::hours(CHECK_INTERVAL_HOURS),
        }
    }

    /// Record that a probe happened now.
    pub async fn record_check(&self, key: &IndexKey) -> LedgerResult<()> {
        let now = self.now();
        self.mutate(key, |e| e.last_checked = Some(now)).await
    }

    /// Record a probe outcome of "nothing new": stamps the check and stores a
    /// definite `false` flag.
    pub async fn record_no_update(&self, key: &IndexKey) -> LedgerResult<()> {
        let now = self.now();
        self.mutate(key, |e| {
            e.last_checked = Some(now);
            e.update_available = Some(false);
            e.available_url = None;
        })
        .await
    }

    /// Record a completed download: stamps `last_updated` and clears the
    /// update flag and `available_url`.
    pub async fn record_update(&self, key: &IndexKey) -> LedgerResult<()> {
        let now = self.now();
        self.mutate(key, |e| {
            e.last_updated = Some(now);
            e.update_available = Some(false);
            e.available_url = None;
        })
        .await
    }

    /// Like [`Ledger::record_update`], additionally making `url` the
    /// `current_url`, in a single write.
    pub async fn record_update_with_url(&self, key: &IndexKey, url: &str) -> LedgerResult<()> {
        let now = self.now();
        self.mutate(key, |e| {
            e.last_updated = Some(now);
            e.update_available = Some(false);
            e.available_url = None;
            e.current_url = Some(url.to_string());
        })
        .await
    }

    /// Record that `url` is where the freshest copy lives, stamping the check.
    ///
    /// Raises the flag only when `url` differs from `current_url`; otherwise
    /// the flag is set to `false`. Returns whether the flag was raised.
    pub async fn record_available_url(&self, key: &IndexKey, url: &str) -> LedgerResult<bool> {
        let now = self.now();
        let mut raised = false;
        self.mutate(key, |e| {
            e.last_checked = Some(now);
            if e.current_url.as_deref() == Some(url) {
                e.update_available = Some(false);
                e.available_url = None;
            } else {
                e.update_available = Some(true);
                e.available_url = Some(url.to_string());
                raised = true;
            }
        })
        .await?;
        Ok(raised)
    }

    /// Store the remote last-modified time from a static probe and stamp the
    /// check.
    pub async fn record_remote_timestamp(
        &self,
        key: &IndexKey,
        remote: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let now = self.now();
        let remote = remote.trunc_subsecs(0);
        self.mutate(key, |e| {
            e.last_checked = Some(now);
            e.remote_timestamp = Some(remote);
        })
        .await
    }

    /// Set or clear `current_url`.
    pub async fn set_current_url(&self, key: &IndexKey, url: Option<&str>) -> LedgerResult<()> {
        let url = url.map(str::to_string);
        self.mutate(key, |e| e.current_url = url).await
    }

    /// Set the tri-state flag directly. Raising it still has to satisfy the
    /// entry invariant.
    pub async fn set_update_available(
        &self,
        key: &IndexKey,
        flag: Option<bool>,
    ) -> LedgerResult<()> {
        self.mutate(key, |e| {
            e.update_available = flag;
            if flag != Some(true) {
                e.available_url = None;
            }
        })
        .await
    }

    /// Forget the last check so the next `should_check` is true.
    pub async fn force_recheck(&self, key: &IndexKey) -> LedgerResult<()> {
        self.mutate(key, |e| e.last_checked = None).await
    }

    /// Rewrite the file from the current in-memory state.
    pub async fn save(&self) -> LedgerResult<()> {
        let doc = self.doc.lock().await;
        self.persist(&doc).await
    }

    async fn persist(&self, doc: &LedgerDoc) -> LedgerResult<()> {
        let text = toml::to_string_pretty(doc).context(SerializeSnafu)?;
        storage::write_atomic(&self.location, &self.rel_path, text.as_bytes())
            .await
            .context(StorageSnafu {
                path: self.path().display().to_string(),
            })
    }

    async fn mutate(&self, key: &IndexKey, f: impl FnOnce(&mut LedgerEntry)) -> LedgerResult<()> {
        let mut doc = self.doc.lock().await;

        let mut next = doc.clone();
        let entry = next
            .entry(key.mission().to_string())
            .or_default()
            .entry(key.instrument().to_string())
            .or_default()
            .entry(key.indexname().to_string())
            .or_default();
        f(entry);

        ensure!(
            entry.satisfies_invariant(),
            InvariantSnafu { key: key.clone() }
        );

        self.persist(&next).await?;
        *doc = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn key() -> IndexKey {
        "mro.ctx.edr".parse().unwrap()
    }

    async fn open(tmp: &TempDir, clock: Arc<ManualClock>) -> Ledger {
        Ledger::open(&tmp.path().join("ledger.toml"), clock)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn should_check_is_gated_for_24_hours() -> TestResult {
        let tmp = TempDir::new()?;
        let clock = Arc::new(ManualClock::new(t0()));
        let ledger = open(&tmp, clock.clone()).await;

        assert!(ledger.should_check(&key()).await);
        ledger.record_check(&key()).await?;
        assert!(!ledger.should_check(&key()).await);

        clock.advance(Duration::hours(23) + Duration::minutes(59));
        assert!(!ledger.should_check(&key()).await);

        clock.advance(Duration::minutes(1));
        assert!(ledger.should_check(&key()).await);
        Ok(())
    }

    #[tokio::test]
    async fn mutations_persist_immediately() -> TestResult {
        let tmp = TempDir::new()?;
        let clock = Arc::new(ManualClock::new(t0()));
        let ledger = open(&tmp, clock.clone()).await;

        ledger.set_current_url(&key(), Some("https://a/v1/index.lbl")).await?;
        ledger.record_update(&key()).await?;

        let reopened = open(&tmp, clock).await;
        let entry = reopened.entry(&key()).await;
        assert_eq!(entry.current_url.as_deref(), Some("https://a/v1/index.lbl"));
        assert_eq!(entry.last_updated, Some(t0()));
        assert_eq!(entry.update_available, Some(false));

        let text = std::fs::read_to_string(tmp.path().join("ledger.toml"))?;
        assert!(text.contains("edr"), "{text}");
        assert!(text.contains("2024-05-01T10:00:00Z"), "{text}");
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() -> TestResult {
        let tmp = TempDir::new()?;
        std::fs::write(tmp.path().join("ledger.toml"), "this is = = not toml")?;
        let ledger = open(&tmp, Arc::new(ManualClock::new(t0()))).await;
        assert!(ledger.keys().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn available_url_only_raises_for_a_different_url() -> TestResult {
        let tmp = TempDir::new()?;
        let ledger = open(&tmp, Arc::new(ManualClock::new(t0()))).await;
        let k = key();

        ledger.set_current_url(&k, Some("https://a/v1.lbl")).await?;
        assert!(!ledger.record_available_url(&k, "https://a/v1.lbl").await?);
        assert_eq!(ledger.entry(&k).await.update_available, Some(false));

        assert!(ledger.record_available_url(&k, "https://a/v2.lbl").await?);
        let e = ledger.entry(&k).await;
        assert_eq!(e.update_available, Some(true));
        assert_eq!(e.available_url.as_deref(), Some("https://a/v2.lbl"));
        assert_eq!(e.last_checked, Some(t0()));
        Ok(())
    }

    #[tokio::test]
    async fn invariant_violations_are_rejected_and_not_persisted() -> TestResult {
        let tmp = TempDir::new()?;
        let ledger = open(&tmp, Arc::new(ManualClock::new(t0()))).await;
        let k = key();

        let err = ledger.set_update_available(&k, Some(true)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Invariant { .. }));
        assert_eq!(ledger.entry(&k).await, LedgerEntry::default());
        assert!(!tmp.path().join("ledger.toml").exists());
        Ok(())
    }

    #[tokio::test]
    async fn field_level_get_and_set() -> TestResult {
        let tmp = TempDir::new()?;
        let ledger = open(&tmp, Arc::new(ManualClock::new(t0()))).await;
        let k = key();

        ledger
            .set(&k, LedgerField::LastUpdated, Some(LedgerValue::Time(t0())))
            .await?;
        assert_eq!(
            ledger.get(&k, LedgerField::LastUpdated).await,
            Some(LedgerValue::Time(t0()))
        );

        let err = ledger
            .set(&k, LedgerField::CurrentUrl, Some(LedgerValue::Flag(true)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::FieldType { .. }));

        ledger.set(&k, LedgerField::LastUpdated, None).await?;
        assert_eq!(ledger.get(&k, LedgerField::LastUpdated).await, None);
        Ok(())
    }

    #[tokio::test]
    async fn force_recheck_reopens_the_window() -> TestResult {
        let tmp = TempDir::new()?;
        let ledger = open(&tmp, Arc::new(ManualClock::new(t0()))).await;
        ledger.record_check(&key()).await?;
        assert!(!ledger.should_check(&key()).await);
        ledger.force_recheck(&key()).await?;
        assert!(ledger.should_check(&key()).await);
        Ok(())
    }
}
