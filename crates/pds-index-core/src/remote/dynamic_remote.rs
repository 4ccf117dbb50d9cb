use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use snafu::prelude::*;

use crate::{
    http::RemoteClient,
    key::IndexKey,
    ledger::Ledger,
    remote::{ArchiveListing, LedgerSnafu, Remote, RemoteKind, RemoteResult},
};

/// Remote whose label URL is discovered from an [`ArchiveListing`].
///
/// Each release lives at a new URL, so "update available" means the newest
/// release URL differs from the ledger's `current_url`.
#[derive(Debug)]
pub struct DynamicRemote {
    key: IndexKey,
    listing: ArchiveListing,
    ledger: Arc<Ledger>,
    client: Arc<dyn RemoteClient>,
}

impl DynamicRemote {
    /// Remote for `key` scraping `listing`.
    pub fn new(
        key: IndexKey,
        listing: ArchiveListing,
        ledger: Arc<Ledger>,
        client: Arc<dyn RemoteClient>,
    ) -> Self {
        Self {
            key,
            listing,
            ledger,
            client,
        }
    }

    /// The listing this remote scrapes.
    pub fn listing(&self) -> &ArchiveListing {
        &self.listing
    }

    async fn discover(&self) -> Option<String> {
        match self.listing.discover(self.client.as_ref()).await {
            Ok(found) => found,
            Err(e) => {
                warn!("{}: release listing unavailable: {e}", self.key);
                None
            }
        }
    }

    /// Scrape and record the outcome. Returns whether the flag is raised.
    async fn probe(&self) -> RemoteResult<bool> {
        let Some(url) = self.discover().await else {
            self.ledger.record_check(&self.key).await.context(LedgerSnafu)?;
            return Ok(false);
        };

        let raised = self
            .ledger
            .record_available_url(&self.key, &url)
            .await
            .context(LedgerSnafu)?;
        if raised {
            info!("{}: new release at {url}", self.key);
        } else {
            debug!("{}: still at {url}", self.key);
        }
        Ok(raised)
    }

    async fn check(&self, force: bool) -> RemoteResult<bool> {
        if !force {
            if self.ledger.entry(&self.key).await.update_available == Some(true) {
                return Ok(true);
            }
            if !self.ledger.should_check(&self.key).await {
                return Ok(false);
            }
        }
        self.probe().await
    }
}

#[async_trait]
impl Remote for DynamicRemote {
    fn kind(&self) -> RemoteKind {
        RemoteKind::Dynamic
    }

    fn key(&self) -> &IndexKey {
        &self.key
    }

    /// Newest known URL: `available_url`, then `current_url`, then a fresh
    /// discovery when the window allows one.
    async fn url(&self) -> RemoteResult<Option<String>> {
        let entry = self.ledger.entry(&self.key).await;
        if let Some(url) = entry.available_url.or(entry.current_url) {
            return Ok(Some(url));
        }
        if !self.ledger.should_check(&self.key).await {
            return Ok(None);
        }
        self.probe().await?;
        Ok(self.ledger.entry(&self.key).await.available_url)
    }

    async fn update_available(&self) -> RemoteResult<bool> {
        self.check(false).await
    }

    async fn refresh(&self) -> RemoteResult<bool> {
        self.check(true).await
    }

    async fn acknowledge_download(&self, url: &str) -> RemoteResult<()> {
        self.ledger
            .record_update_with_url(&self.key, url)
            .await
            .context(LedgerSnafu)
    }
}
