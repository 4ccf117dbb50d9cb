use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use snafu::prelude::*;

use crate::{
    http::RemoteClient,
    key::IndexKey,
    ledger::Ledger,
    remote::{LedgerSnafu, Remote, RemoteKind, RemoteResult, StaticUrlTable},
};

/// Remote whose label URL is configured in the [`StaticUrlTable`].
///
/// The archive replaces files in place, so freshness is judged from the
/// target's `Last-Modified` header compared with the ledger's
/// `last_updated`. The probed timestamp is cached in the ledger so the
/// comparison can be repeated without another request inside the window.
#[derive(Debug)]
pub struct StaticRemote {
    key: IndexKey,
    urls: Arc<StaticUrlTable>,
    ledger: Arc<Ledger>,
    client: Arc<dyn RemoteClient>,
}

impl StaticRemote {
    /// Remote for `key`.
    pub fn new(
        key: IndexKey,
        urls: Arc<StaticUrlTable>,
        ledger: Arc<Ledger>,
        client: Arc<dyn RemoteClient>,
    ) -> Self {
        Self {
            key,
            urls,
            ledger,
            client,
        }
    }

    /// HEAD the label URL and cache its timestamp. Failures are logged and
    /// still count as a check.
    async fn probe(&self, url: &str) -> RemoteResult<()> {
        match self.client.last_modified(url).await {
            Ok(Some(stamp)) => {
                debug!("{}: remote last-modified {stamp}", self.key);
                self.ledger
                    .record_remote_timestamp(&self.key, stamp)
                    .await
                    .context(LedgerSnafu)
            }
            Ok(None) => {
                warn!("{}: {url} reports no last-modified time", self.key);
                self.ledger.record_check(&self.key).await.context(LedgerSnafu)
            }
            Err(e) => {
                warn!("{}: freshness probe failed, assuming no update: {e}", self.key);
                self.ledger.record_check(&self.key).await.context(LedgerSnafu)
            }
        }
    }

    /// Decide from the ledger alone whether the cached remote timestamp is
    /// newer than the local copy, and flag it.
    async fn evaluate(&self, url: &str) -> RemoteResult<bool> {
        let entry = self.ledger.entry(&self.key).await;
        let newer = match (entry.remote_timestamp, entry.last_updated) {
            (Some(remote), Some(local)) => remote > local,
            (Some(_), None) => true,
            (None, _) => false,
        };

        if newer {
            info!("{}: newer remote copy available at {url}", self.key);
            self.ledger
                .record_available_url(&self.key, url)
                .await
                .context(LedgerSnafu)
        } else {
            if entry.update_available != Some(false) {
                self.ledger
                    .set_update_available(&self.key, Some(false))
                    .await
                    .context(LedgerSnafu)?;
            }
            Ok(false)
        }
    }

    async fn check(&self, force: bool) -> RemoteResult<bool> {
        let entry = self.ledger.entry(&self.key).await;
        if !force && entry.update_available == Some(true) {
            return Ok(true);
        }
        if !force && !self.ledger.should_check(&self.key).await {
            return Ok(false);
        }

        let Some(url) = self.urls.url_for(&self.key).await? else {
            self.ledger.record_check(&self.key).await.context(LedgerSnafu)?;
            return Ok(false);
        };
        self.probe(&url).await?;
        self.evaluate(&url).await
    }
}

#[async_trait]
impl Remote for StaticRemote {
    fn kind(&self) -> RemoteKind {
        RemoteKind::Static
    }

    fn key(&self) -> &IndexKey {
        &self.key
    }

    async fn url(&self) -> RemoteResult<Option<String>> {
        self.urls.url_for(&self.key).await
    }

    async fn update_available(&self) -> RemoteResult<bool> {
        self.check(false).await
    }

    async fn refresh(&self) -> RemoteResult<bool> {
        self.check(true).await
    }

    async fn acknowledge_download(&self, url: &str) -> RemoteResult<()> {
        debug!("{}: downloaded {url}", self.key);
        self.ledger.record_update(&self.key).await.context(LedgerSnafu)
    }
}
