#![allow(dead_code)]

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pds_index_core::{
    catalog::IndexCatalog,
    clock::ManualClock,
    http::{FetchError, FetchResult, RemoteClient},
    remote::RemoteRegistry,
    settings::IndexSettings,
    storage::OutputSink,
};

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

pub const URLS_SOURCE: &str = "https://config.example/index_urls.toml";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
}

/// Label for a four-column fixed-width table stored in `table_file`.
pub fn label(table_file: &str) -> String {
    format!(
        r#"PDS_VERSION_ID = PDS3
RECORD_TYPE = FIXED_LENGTH
^INDEX_TABLE = "{table_file}"
OBJECT = INDEX_TABLE
  ROW_BYTES = 40
  OBJECT = COLUMN
    NAME = PRODUCT_ID
    START_BYTE = 2
    BYTES = 6
  END_OBJECT = COLUMN
  OBJECT = COLUMN
    NAME = START_TIME
    START_BYTE = 10
    BYTES = 20
  END_OBJECT = COLUMN
  OBJECT = COLUMN
    NAME = RELEASE_ID
    START_BYTE = 31
    BYTES = 4
  END_OBJECT = COLUMN
  OBJECT = COLUMN
    NAME = SCALE
    START_BYTE = 36
    BYTES = 3
  END_OBJECT = COLUMN
END_OBJECT = INDEX_TABLE
END
"#
    )
}

/// `rows` lines matching [`label`], CRLF-terminated.
pub fn table(rows: usize) -> String {
    (1..=rows)
        .map(|i| format!("\"P{i:05}\",2004-01-05T01:02:03Z,{i:04},1.5\r\n"))
        .collect()
}

#[derive(Debug, Default)]
struct FakeState {
    bodies: HashMap<String, Vec<u8>>,
    modified: HashMap<String, DateTime<Utc>>,
    offline: bool,
    calls: Vec<String>,
}

/// In-memory archive. Unknown URLs answer 404.
#[derive(Debug, Default)]
pub struct FakeClient {
    state: Mutex<FakeState>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    pub fn put(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.state
            .lock()
            .unwrap()
            .bodies
            .insert(url.to_string(), body.into());
    }

    pub fn set_modified(&self, url: &str, t: DateTime<Utc>) {
        self.state
            .lock()
            .unwrap()
            .modified
            .insert(url.to_string(), t);
    }

    pub fn count(&self, verb: &str, url: &str) -> usize {
        let needle = format!("{verb} {url}");
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| **c == needle)
            .count()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn lookup(&self, verb: &str, url: &str) -> FetchResult<Vec<u8>> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("{verb} {url}"));
        if st.offline {
            return Err(FetchError::NetworkUnavailable {
                url: url.to_string(),
                message: "offline".to_string(),
            });
        }
        st.bodies.get(url).cloned().ok_or(FetchError::HttpStatus {
            url: url.to_string(),
            status: 404,
        })
    }
}

#[async_trait]
impl RemoteClient for FakeClient {
    async fn last_modified(&self, url: &str) -> FetchResult<Option<DateTime<Utc>>> {
        self.lookup("HEAD", url)?;
        Ok(self.state.lock().unwrap().modified.get(url).copied())
    }

    async fn get_text(&self, url: &str) -> FetchResult<String> {
        let body = self.lookup("GET", url)?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    async fn download(&self, url: &str, sink: &mut OutputSink) -> FetchResult<u64> {
        let body = self.lookup("DOWNLOAD", url)?;
        sink.write_all(&body).map_err(|source| FetchError::Storage {
            url: url.to_string(),
            source,
        })?;
        Ok(body.len() as u64)
    }
}

pub struct Harness {
    pub client: Arc<FakeClient>,
    pub clock: Arc<ManualClock>,
    pub catalog: IndexCatalog,
}

/// Catalog rooted at `root` with a fake archive and a manual clock.
pub async fn harness(root: &Path, remotes: RemoteRegistry) -> TestResult<Harness> {
    let client = Arc::new(FakeClient::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let settings = IndexSettings::with_root(root).with_static_urls_source(URLS_SOURCE);
    let catalog = IndexCatalog::builder(settings)
        .client(client.clone())
        .clock(clock.clone())
        .remotes(remotes)
        .build()
        .await?;
    Ok(Harness {
        client,
        clock,
        catalog,
    })
}
