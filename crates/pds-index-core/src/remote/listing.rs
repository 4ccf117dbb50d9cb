//! Archive release listings scraped by the dynamic strategy.
//!
//! Some archives publish a cumulative index inside each release folder
//! (`mrox_4000/index/cumindex.lbl`, `LROLRC_0055/INDEX/CUMINDEX.LBL`) and add
//! a new folder with every delivery. The current index is therefore found by
//! reading the directory listing page and picking the newest release folder.

use log::{debug, warn};
use regex::Regex;

use crate::http::{FetchResult, RemoteClient};

const HREF_PATTERN: &str = r#"(?i)href\s*=\s*(?:"([^"]*)"|'([^']*)')"#;

/// One release folder found on a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseFolder {
    /// Folder name without slashes, e.g. `mrox_4000`.
    pub name: String,
    /// Release number parsed from the name.
    pub number: u64,
}

/// Where and how to find the newest release of one instrument's index.
#[derive(Debug, Clone)]
pub struct ArchiveListing {
    primary: String,
    backup: Option<String>,
    folder_pattern: Regex,
    label_path: String,
    href: Regex,
}

impl ArchiveListing {
    /// `folder_pattern` must match a whole folder name and capture the
    /// release number in its first group.
    pub fn new(
        primary: impl Into<String>,
        folder_pattern: &str,
        label_path: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            primary: primary.into(),
            backup: None,
            folder_pattern: Regex::new(folder_pattern)?,
            label_path: label_path.into(),
            href: Regex::new(HREF_PATTERN)?,
        })
    }

    /// Listing page tried when the primary cannot be fetched.
    pub fn with_backup(mut self, backup: impl Into<String>) -> Self {
        self.backup = Some(backup.into());
        self
    }

    /// Primary listing URL.
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// Backup listing URL, if any.
    pub fn backup(&self) -> Option<&str> {
        self.backup.as_deref()
    }

    /// Label path inside a release folder.
    pub fn label_path(&self) -> &str {
        &self.label_path
    }

    /// Release folders linked from a listing page, in page order.
    pub fn release_folders(&self, html: &str) -> Vec<ReleaseFolder> {
        let mut out: Vec<ReleaseFolder> = Vec::new();
        for cap in self.href.captures_iter(html) {
            let Some(target) = cap.get(1).or_else(|| cap.get(2)) else {
                continue;
            };
            let Some(name) = target.as_str().trim_end_matches('/').rsplit('/').next() else {
                continue;
            };
            let Some(folder) = self.folder_pattern.captures(name) else {
                continue;
            };
            let Some(number) = folder.get(1).and_then(|m| m.as_str().parse::<u64>().ok()) else {
                continue;
            };
            if !out.iter().any(|f| f.name == name) {
                out.push(ReleaseFolder {
                    name: name.to_string(),
                    number,
                });
            }
        }
        out
    }

    /// Highest-numbered release folder on a page (ties broken by name).
    pub fn newest_release(&self, html: &str) -> Option<ReleaseFolder> {
        self.release_folders(html)
            .into_iter()
            .max_by(|a, b| a.number.cmp(&b.number).then_with(|| a.name.cmp(&b.name)))
    }

    /// Label URL inside `folder`, relative to the listing `base` that served
    /// the page.
    pub fn label_url(&self, base: &str, folder: &ReleaseFolder) -> String {
        format!(
            "{}/{}/{}",
            base.trim_end_matches('/'),
            folder.name,
            self.label_path.trim_start_matches('/')
        )
    }

    /// Fetch the listing (primary, then backup) and return the label URL of
    /// the newest release. `Ok(None)` means a page was read but held no
    /// matching folder.
    pub async fn discover(&self, client: &dyn RemoteClient) -> FetchResult<Option<String>> {
        let (base, html) = match client.get_text(&self.primary).await {
            Ok(html) => (self.primary.as_str(), html),
            Err(primary_err) => {
                let Some(backup) = self.backup.as_deref() else {
                    return Err(primary_err);
                };
                warn!(
                    "listing {} unavailable ({primary_err}); trying backup {backup}",
                    self.primary
                );
                (backup, client.get_text(backup).await?)
            }
        };

        match self.newest_release(&html) {
            Some(folder) => {
                debug!("newest release at {base}: {} ({})", folder.name, folder.number);
                Ok(Some(self.label_url(base, &folder)))
            }
            None => {
                warn!("no release folders found at {base}");
                Ok(None)
            }
        }
    }
}

/// Built-in listings keyed by `mission.instrument`.
pub fn builtin_listings() -> Vec<(String, ArchiveListing)> {
    let ctx = ArchiveListing::new(
        "https://planetarydata.jpl.nasa.gov/img/data/mro/ctx/",
        r"^mrox_(\d+)$",
        "index/cumindex.lbl",
    )
    .map(|l| l.with_backup("https://pdsimage2.wr.usgs.gov/Mars_Reconnaissance_Orbiter/CTX/"));

    let lroc = ArchiveListing::new(
        "https://pds.lroc.asu.edu/data/LRO-L-LROC-2-EDR-V1.0/",
        r"^LROLRC_(\d+)[A-Z]?$",
        "INDEX/CUMINDEX.LBL",
    );

    [("mro.ctx", ctx), ("lro.lroc", lroc)]
        .into_iter()
        .filter_map(|(k, l)| match l {
            Ok(l) => Some((k.to_string(), l)),
            Err(e) => {
                warn!("invalid built-in listing for {k}: {e}");
                None
            }
        })
        .collect()
}
