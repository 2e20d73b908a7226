//! Release discovery for Skybian base images.
//!
//! The `ReleaseCatalog` lists releases from a `ReleaseSource`, orders them
//! newest first and keeps the last listing for tag resolution. It never
//! retries on its own; the caller decides.

pub mod github;

use crate::config::ImagerSettings;
use crate::error::ImagerError;
use crate::models::{BaseImageRef, Release};
use crate::net::{self, CancelSignal};
use futures::future::BoxFuture;
use regex::Regex;
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub use github::GithubReleaseSource;

/// Anything that can produce the raw release listing.
pub trait ReleaseSource: Send + Sync {
    /// Where the listing comes from, for error messages.
    fn endpoint(&self) -> &str;

    fn fetch_releases(&self) -> BoxFuture<'_, Result<Vec<Release>, ImagerError>>;
}

/// Cached, ordered view over a release source.
pub struct ReleaseCatalog {
    source: Arc<dyn ReleaseSource>,
    pattern: Regex,
    cache: RwLock<Option<Vec<Release>>>,
}

impl ReleaseCatalog {
    pub fn new(source: Arc<dyn ReleaseSource>, pattern: Regex) -> Self {
        ReleaseCatalog {
            source,
            pattern,
            cache: RwLock::new(None),
        }
    }

    /// Catalog over the configured HTTP endpoint.
    pub fn from_settings(
        settings: &ImagerSettings,
        client: reqwest::Client,
    ) -> Result<Self, ImagerError> {
        let pattern = settings
            .base_image_regex()
            .map_err(|e| ImagerError::InvalidConfig(e.to_string()))?;
        let source = GithubReleaseSource::new(client, settings.release_api_url.clone());
        Ok(ReleaseCatalog::new(Arc::new(source), pattern))
    }

    pub fn base_image_pattern(&self) -> &Regex {
        &self.pattern
    }

    /// List releases carrying a base image, newest first, plus the latest one.
    ///
    /// Always queries the source. A successful listing replaces the cache.
    pub async fn list_releases(
        &self,
        cancel: &CancelSignal,
        timeout: Duration,
    ) -> Result<(Vec<Release>, Release), ImagerError> {
        log::info!(
            "[Catalog] [LIST] Obtaining base image releases from {}",
            self.source.endpoint()
        );

        let raw = net::bounded(
            "release listing",
            self.source.fetch_releases(),
            cancel,
            timeout,
        )
        .await
        .map_err(|e| {
            log::error!("[Catalog] [LIST] [ERROR] {}", e);
            e
        })?;

        let total = raw.len();
        let releases = order_releases(
            raw.into_iter()
                .filter(|r| r.base_image_asset(&self.pattern).is_some())
                .collect(),
        );

        let latest = releases.first().cloned().ok_or_else(|| {
            log::warn!(
                "[Catalog] [LIST] {} releases listed, none with a base image",
                total
            );
            ImagerError::EmptyCatalog(self.source.endpoint().to_string())
        })?;

        log::info!(
            "[Catalog] [LIST] {} usable releases, latest is {}",
            releases.len(),
            latest
        );

        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(releases.clone());
        }
        Ok((releases, latest))
    }

    /// Last successful listing, if any.
    pub fn cached(&self) -> Option<Vec<Release>> {
        self.cache.read().ok().and_then(|c| c.clone())
    }

    /// Download URL of the latest release's base image.
    pub async fn latest_base_image_url(
        &self,
        cancel: &CancelSignal,
        timeout: Duration,
    ) -> Result<String, ImagerError> {
        let (_, latest) = self.list_releases(cancel, timeout).await?;
        latest
            .base_image_asset(&self.pattern)
            .map(|a| a.url.clone())
            .ok_or_else(|| ImagerError::Internal(format!("release {} lost its base image", latest.tag)))
    }

    /// Resolve `latest` or a tag to a release, reusing the cached listing.
    pub async fn resolve(
        &self,
        reference: &BaseImageRef,
        cancel: &CancelSignal,
        timeout: Duration,
    ) -> Result<Release, ImagerError> {
        let releases = match self.cached() {
            Some(releases) if !releases.is_empty() => releases,
            _ => self.list_releases(cancel, timeout).await?.0,
        };

        match reference {
            BaseImageRef::Latest => releases
                .into_iter()
                .next()
                .ok_or_else(|| ImagerError::EmptyCatalog(self.source.endpoint().to_string())),
            BaseImageRef::Tag(tag) => releases
                .into_iter()
                .find(|r| r.tag == *tag)
                .ok_or_else(|| {
                    ImagerError::InvalidConfig(format!("release '{}' does not exist", tag))
                }),
            other => Err(ImagerError::Internal(format!(
                "{:?} is not a release reference",
                other
            ))),
        }
    }
}

/// Newest first; equal timestamps fall back to tag, descending.
pub fn order_releases(mut releases: Vec<Release>) -> Vec<Release> {
    releases.sort_by(|a, b| {
        b.published_at
            .cmp(&a.published_at)
            .then_with(|| b.tag.cmp(&a.tag))
    });
    releases
}

/// Display strings for a release picker.
pub fn release_strings(releases: &[Release]) -> Vec<String> {
    releases.iter().map(|r| r.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReleaseAsset;
    use crate::net::never_cancel;
    use chrono::{TimeZone, Utc};
    use futures::future::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticSource {
        releases: Vec<Release>,
        calls: AtomicUsize,
    }

    impl ReleaseSource for StaticSource {
        fn endpoint(&self) -> &str {
            "static://releases"
        }

        fn fetch_releases(&self) -> BoxFuture<'_, Result<Vec<Release>, ImagerError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let releases = self.releases.clone();
            async move { Ok(releases) }.boxed()
        }
    }

    struct HangingSource;

    impl ReleaseSource for HangingSource {
        fn endpoint(&self) -> &str {
            "hanging://releases"
        }

        fn fetch_releases(&self) -> BoxFuture<'_, Result<Vec<Release>, ImagerError>> {
            futures::future::pending().boxed()
        }
    }

    fn release(tag: &str, day: u32, with_image: bool) -> Release {
        let mut assets = vec![ReleaseAsset {
            name: "README.md".to_string(),
            url: format!("https://dl/{}/README.md", tag),
            size: 1,
        }];
        if with_image {
            assets.push(ReleaseAsset {
                name: format!("Skybian-{}.img.gz", tag),
                url: format!("https://dl/{}/Skybian-{}.img.gz", tag, tag),
                size: 1024,
            });
        }
        Release {
            tag: tag.to_string(),
            published_at: Utc.with_ymd_and_hms(2020, 6, day, 0, 0, 0).unwrap(),
            assets,
        }
    }

    fn catalog(releases: Vec<Release>) -> (ReleaseCatalog, Arc<StaticSource>) {
        let source = Arc::new(StaticSource {
            releases,
            calls: AtomicUsize::new(0),
        });
        let pattern = Regex::new(crate::config::DEFAULT_BASE_IMAGE_PATTERN).unwrap();
        (ReleaseCatalog::new(source.clone(), pattern), source)
    }

    #[tokio::test]
    async fn test_list_orders_newest_first_and_filters() {
        let (catalog, _) = catalog(vec![
            release("v0.1.0", 1, true),
            release("v0.3.0", 3, false),
            release("v0.2.0", 2, true),
        ]);
        let (releases, latest) = catalog
            .list_releases(&never_cancel(), Duration::from_secs(1))
            .await
            .unwrap();
        let tags: Vec<_> = releases.iter().map(|r| r.tag.as_str()).collect();
        assert_eq!(tags, vec!["v0.2.0", "v0.1.0"]);
        assert_eq!(latest.tag, "v0.2.0");
    }

    #[tokio::test]
    async fn test_empty_catalog() {
        let (catalog, _) = catalog(vec![release("v0.1.0", 1, false)]);
        let err = catalog
            .list_releases(&never_cancel(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ImagerError::EmptyCatalog(_)));
        assert!(catalog.cached().is_none());
    }

    #[tokio::test]
    async fn test_resolve_uses_cache() {
        let (catalog, source) = catalog(vec![release("v0.1.0", 1, true), release("v0.2.0", 2, true)]);
        let cancel = never_cancel();
        let timeout = Duration::from_secs(1);

        let latest = catalog.resolve(&BaseImageRef::Latest, &cancel, timeout).await.unwrap();
        assert_eq!(latest.tag, "v0.2.0");
        let older = catalog
            .resolve(&BaseImageRef::Tag("v0.1.0".to_string()), &cancel, timeout)
            .await
            .unwrap();
        assert_eq!(older.tag, "v0.1.0");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        let missing = catalog
            .resolve(&BaseImageRef::Tag("v9.9.9".to_string()), &cancel, timeout)
            .await;
        assert!(matches!(missing, Err(ImagerError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_latest_base_image_url() {
        let (catalog, _) = catalog(vec![release("v0.1.0", 1, true)]);
        let url = catalog
            .latest_base_image_url(&never_cancel(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(url, "https://dl/v0.1.0/Skybian-v0.1.0.img.gz");
    }

    #[tokio::test]
    async fn test_hanging_source_times_out() {
        let pattern = Regex::new(crate::config::DEFAULT_BASE_IMAGE_PATTERN).unwrap();
        let catalog = ReleaseCatalog::new(Arc::new(HangingSource), pattern);
        let err = catalog
            .list_releases(&never_cancel(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ImagerError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_listing_stops_waiting() {
        let pattern = Regex::new(crate::config::DEFAULT_BASE_IMAGE_PATTERN).unwrap();
        let catalog = ReleaseCatalog::new(Arc::new(HangingSource), pattern);
        let (tx, rx) = tokio::sync::watch::channel(false);
        let listing = catalog.list_releases(&rx, Duration::from_secs(30));
        tx.send(true).unwrap();

        let err = listing.await.unwrap_err();
        assert!(matches!(err, ImagerError::Cancelled(_)));
        assert!(err.is_retryable());
        assert!(catalog.cached().is_none());
    }

    #[test]
    fn test_order_ties_break_on_tag() {
        let ordered = order_releases(vec![release("v0.1.0", 1, true), release("v0.1.1", 1, true)]);
        assert_eq!(ordered[0].tag, "v0.1.1");
    }

    #[test]
    fn test_release_strings() {
        let strings = release_strings(&[release("v0.1.0", 5, true)]);
        assert_eq!(strings, vec!["v0.1.0 (2020-06-05)".to_string()]);
    }
}
