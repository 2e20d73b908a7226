//! GitHub-style release listing client.
//!
//! Talks to any endpoint returning the GitHub releases JSON shape:
//! an array of `{tag_name, published_at, draft, assets: [{name, browser_download_url, size}]}`.

use crate::error::ImagerError;
use crate::models::{Release, ReleaseAsset};
use crate::release::ReleaseSource;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ApiRelease {
    tag_name: String,
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    assets: Vec<ApiAsset>,
}

#[derive(Debug, Deserialize)]
struct ApiAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    size: u64,
}

/// Release source backed by an HTTP endpoint.
pub struct GithubReleaseSource {
    client: reqwest::Client,
    url: String,
}

impl GithubReleaseSource {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        GithubReleaseSource {
            client,
            url: url.into(),
        }
    }

    async fn fetch(&self) -> Result<Vec<Release>, ImagerError> {
        log::debug!("[Catalog] [HTTP] GET {}", self.url);

        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| ImagerError::Network(format!("failed to reach {}: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImagerError::Network(format!(
                "{} answered with HTTP {}",
                self.url, status
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ImagerError::Network(format!("failed to read release listing: {}", e)))?;

        log::debug!("[Catalog] [HTTP] Received {} bytes", body.len());
        parse_releases(&body)
    }
}

impl ReleaseSource for GithubReleaseSource {
    fn endpoint(&self) -> &str {
        &self.url
    }

    fn fetch_releases(&self) -> BoxFuture<'_, Result<Vec<Release>, ImagerError>> {
        self.fetch().boxed()
    }
}

/// Parse a release listing body. Drafts and unpublished releases are dropped.
pub fn parse_releases(body: &str) -> Result<Vec<Release>, ImagerError> {
    let raw: Vec<ApiRelease> = serde_json::from_str(body)
        .map_err(|e| ImagerError::Network(format!("malformed release listing: {}", e)))?;

    Ok(raw
        .into_iter()
        .filter(|r| !r.draft)
        .filter_map(|r| {
            let published_at = r.published_at?;
            Some(Release {
                tag: r.tag_name,
                published_at,
                assets: r
                    .assets
                    .into_iter()
                    .map(|a| ReleaseAsset {
                        name: a.name,
                        url: a.browser_download_url,
                        size: a.size,
                    })
                    .collect(),
            })
        })
        .collect())
}
