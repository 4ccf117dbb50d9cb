use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::{
    clock::ManualClock,
    http::{FetchError, FetchResult, RemoteClient},
    ledger::Ledger,
    storage::OutputSink,
};

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
}

pub async fn ledger_at(dir: &std::path::Path, clock: Arc<ManualClock>) -> Arc<Ledger> {
    Arc::new(
        Ledger::open(&dir.join("ledger.toml"), clock)
            .await
            .expect("open ledger"),
    )
}

#[derive(Debug, Default)]
struct FakeState {
    bodies: HashMap<String, Vec<u8>>,
    modified: HashMap<String, DateTime<Utc>>,
    offline: bool,
    calls: Vec<String>,
}

/// In-memory `RemoteClient`. Unknown URLs answer 404.
#[derive(Debug, Default)]
pub struct FakeClient {
    state: Mutex<FakeState>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offline() -> Self {
        let c = Self::default();
        c.set_offline(true);
        c
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
