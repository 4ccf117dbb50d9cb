//! Network access behind a trait seam.
//!
//! Everything that touches the network goes through [`RemoteClient`]:
//! metadata-only probes (`HEAD` for last-modified), small text fetches
//! (listing pages, the static URL document) and streaming downloads into an
//! atomic [`OutputSink`]. The production implementation is [`HttpClient`];
//! tests substitute an in-memory fake.

use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, info};
use reqwest::header::LAST_MODIFIED;
use snafu::prelude::*;

use crate::storage::{OutputSink, StorageError};

/// Bytes between download progress messages.
const PROGRESS_BYTES: u64 = 64 * 1024 * 1024;

/// Errors from network operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FetchError {
    /// The host could not be reached (DNS, connect, timeout, TLS).
    #[snafu(display("Network unavailable for {url}: {message}"))]
    NetworkUnavailable {
        /// Requested URL.
        url: String,
        /// Transport error description.
        message: String,
    },

    /// The server answered with a non-success status.
    #[snafu(display("HTTP {status} for {url}"))]
    HttpStatus {
        /// Requested URL.
        url: String,
        /// Response status code.
        status: u16,
    },

    /// The URL could not be parsed.
    #[snafu(display("Invalid URL {url:?}"))]
    InvalidUrl {
        /// Offending URL text.
        url: String,
    },

    /// Writing the response body to local storage failed.
    #[snafu(display("Failed to store body of {url}: {source}"))]
    Storage {
        /// Requested URL.
        url: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// The HTTP client could not be configured (TLS backend, resolver).
    #[snafu(display("Failed to set up HTTP client: {message}"))]
    ClientSetup {
        /// Builder error description.
        message: String,
    },

    /// The body could not be read or decoded.
    #[snafu(display("Failed to read body of {url}: {message}"))]
    Body {
        /// Requested URL.
        url: String,
        /// Description of the failure.
        message: String,
    },
}

impl FetchError {
    /// Whether this error means "could not talk to the server at all".
    pub fn is_network(&self) -> bool {
        matches!(self, FetchError::NetworkUnavailable { .. })
    }
}

/// Result alias for network operations.
pub type FetchResult<T> = Result<T, FetchError>;

/// Minimal HTTP surface used by the remote strategies and the materializer.
#[async_trait]
pub trait RemoteClient: Debug + Send + Sync {
    /// `Last-Modified` of `url` from a metadata-only request, if reported.
    async fn last_modified(&self, url: &str) -> FetchResult<Option<DateTime<Utc>>>;

    /// Fetch a small text resource.
    async fn get_text(&self, url: &str) -> FetchResult<String>;

    /// Stream `url` into `sink`, returning the number of bytes written. The
    /// caller finishes (commits) the sink.
    async fn download(&self, url: &str, sink: &mut OutputSink) -> FetchResult<u64>;
}

/// Parse an HTTP date (`Wed, 21 Oct 2015 07:28:00 GMT`).
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// `reqwest`-backed client.
///
/// Probes (`last_modified`, `get_text`) are bounded by `probe_timeout`;
/// downloads only bound the connect phase and report progress instead.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    probe_timeout: Duration,
}

impl HttpClient {
    /// Build a client with the given probe timeout.
    pub fn new(probe_timeout: Duration) -> FetchResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(probe_timeout)
            .user_agent(concat!("pds-index/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::ClientSetup {
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            probe_timeout,
        })
    }

    fn parse_url(url: &str) -> FetchResult<reqwest::Url> {
        reqwest::Url::parse(url).map_err(|_| FetchError::InvalidUrl {
            url: url.to_string(),
        })
    }

    fn transport_error(url: &str, e: reqwest::Error) -> FetchError {
        FetchError::NetworkUnavailable {
            url: url.to_string(),
            message: e.to_string(),
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder, url: &str) -> FetchResult<reqwest::Response> {
        let resp = req.send().await.map_err(|e| Self::transport_error(url, e))?;
        let status = resp.status();
        ensure!(
            status.is_success(),
            HttpStatusSnafu {
                url,
                status: status.as_u16()
            }
        );
        Ok(resp)
    }
}

#[async_trait]
impl RemoteClient for HttpClient {
    async fn last_modified(&self, url: &str) -> FetchResult<Option<DateTime<Utc>>> {
        let parsed = Self::parse_url(url)?;
        let req = self.client.head(parsed).timeout(self.probe_timeout);
        let resp = self.send(req, url).await?;

        let stamp = resp
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);
        debug!("HEAD {url}: last-modified {stamp:?}");
        Ok(stamp)
    }

    async fn get_text(&self, url: &str) -> FetchResult<String> {
        let parsed = Self::parse_url(url)?;
        let req = self.client.get(parsed).timeout(self.probe_timeout);
        let resp = self.send(req, url).await?;
        resp.text().await.map_err(|e| FetchError::Body {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    async fn download(&self, url: &str, sink: &mut OutputSink) -> FetchResult<u64> {
        let parsed = Self::parse_url(url)?;
        let resp = self.send(self.client.get(parsed), url).await?;
        let total = resp.content_length();
        info!(
            "downloading {url} ({})",
            total.map_or_else(|| "unknown size".to_string(), |t| format!("{t} bytes"))
        );

        let mut stream = resp.bytes_stream();
        let mut written: u64 = 0;
        let mut next_report = PROGRESS_BYTES;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FetchError::Body {
                url: url.to_string(),
                message: e.to_string(),
            })?;
            sink.write_all(&chunk).context(StorageSnafu { url })?;
            written += chunk.len() as u64;

            if written >= next_report {
                match total {
                    Some(t) if t > 0 => info!(
                        "{url}: {written}/{t} bytes ({:.0}%)",
                        written as f64 * 100.0 / t as f64
                    ),
                    _ => info!("{url}: {written} bytes"),
                }
                next_report += PROGRESS_BYTES;
            }
        }
        debug!("downloaded {written} bytes from {url}");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_http_dates() {
        assert_eq!(
            parse_http_date("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap())
        );
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[test]
    fn client_keeps_configured_probe_timeout() {
        let client = HttpClient::new(Duration::from_millis(1500)).unwrap();
        assert_eq!(client.probe_timeout, Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn invalid_url_is_reported_without_network() {
        let client = HttpClient::new(Duration::from_secs(1)).unwrap();
        let err = client.get_text("not a url").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
        assert!(!err.is_network());
    }
}
