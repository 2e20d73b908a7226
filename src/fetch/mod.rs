//! Base image acquisition.
//!
//! Downloads (or copies) the base image into the work directory, resuming
//! partial transfers, verifying the published SHA-256 and unpacking `.gz`
//! archives. Every step is idempotent: a complete, verified artifact already
//! on disk is reused as-is.

use crate::config::ImagerSettings;
use crate::error::ImagerError;
use crate::models::BaseImageSource;
use crate::net::{self, CancelSignal};
use regex::Regex;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Suffix of in-flight downloads.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Suffix of the digest recorded next to a verified download.
pub const CHECKSUM_SUFFIX: &str = ".sha256";

/// Fallback file name for URLs without a usable last path segment.
const FALLBACK_FILE_NAME: &str = "base.img";

/// Where the expected digest of a download comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ChecksumSource {
    /// Published alongside the release; must be reachable.
    Required(String),
    /// Guessed `<url>.sha256` sibling; a 404 means "no checksum".
    Optional(String),
    None,
}

/// Concrete transfer derived from a [`BaseImageSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
struct DownloadPlan {
    url: String,
    file_name: String,
    checksum: ChecksumSource,
}

/// Snapshot of a work directory before a build touches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDirState {
    pub path: PathBuf,
    pub exists: bool,
    pub entries: usize,
}

impl WorkDirState {
    /// True when clearing the directory would discard something.
    pub fn is_occupied(&self) -> bool {
        self.exists && self.entries > 0
    }
}

pub struct ImageFetcher {
    client: reqwest::Client,
    pattern: Regex,
    timeout: Duration,
    attempts: u32,
    retry_delay: Duration,
}

impl ImageFetcher {
    pub fn new(client: reqwest::Client, pattern: Regex) -> Self {
        ImageFetcher {
            client,
            pattern,
            timeout: Duration::from_secs(crate::config::DEFAULT_NETWORK_TIMEOUT_SECS),
            attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn from_settings(
        settings: &ImagerSettings,
        client: reqwest::Client,
    ) -> Result<Self, ImagerError> {
        let pattern = settings
            .base_image_regex()
            .map_err(|e| ImagerError::InvalidConfig(e.to_string()))?;
        Ok(ImageFetcher::new(client, pattern)
            .with_timeout(settings.network_timeout())
            .with_retries(settings.download_attempts, settings.retry_delay()))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    /// Make the base image available under `dest_dir` and return its path.
    ///
    /// The returned path is always the uncompressed image.
    pub async fn fetch(
        &self,
        source: &BaseImageSource,
        dest_dir: &Path,
        cancel: &CancelSignal,
    ) -> Result<PathBuf, ImagerError> {
        fs::create_dir_all(dest_dir).map_err(|e| ImagerError::disk(dest_dir, e))?;

        let artifact = match source {
            BaseImageSource::Local(path) => copy_local(path, dest_dir).await?,
            BaseImageSource::Release(_) | BaseImageSource::Url(_) => {
                let plan = self.plan(source)?;
                self.fetch_remote(&plan, dest_dir, cancel).await?
            }
        };

        decompress_if_needed(&artifact).await
    }

    fn plan(&self, source: &BaseImageSource) -> Result<DownloadPlan, ImagerError> {
        match source {
            BaseImageSource::Release(release) => {
                let asset = release.base_image_asset(&self.pattern).ok_or_else(|| {
                    ImagerError::Internal(format!(
                        "release {} has no asset matching {}",
                        release.tag, self.pattern
                    ))
                })?;
                let checksum = match release.checksum_asset(&asset.name) {
                    Some(sum) => ChecksumSource::Required(sum.url.clone()),
                    None => ChecksumSource::None,
                };
                Ok(DownloadPlan {
                    url: asset.url.clone(),
                    file_name: asset.name.clone(),
                    checksum,
                })
            }
            BaseImageSource::Url(url) => Ok(DownloadPlan {
                url: url.clone(),
                file_name: file_name_from_url(url),
                checksum: ChecksumSource::Optional(format!("{}.sha256", url)),
            }),
            BaseImageSource::Local(path) => Err(ImagerError::Internal(format!(
                "{} is a local file, not a download",
                path.display()
            ))),
        }
    }

    async fn fetch_remote(
        &self,
        plan: &DownloadPlan,
        dest_dir: &Path,
        cancel: &CancelSignal,
    ) -> Result<PathBuf, ImagerError> {
        let target = dest_dir.join(&plan.file_name);

        if target.exists() {
            if let Some(recorded) = recorded_checksum(&target) {
                log::info!("[Fetch] [REUSE] Found verified {}", target.display());
                verify_file(&target, &recorded).await?;
                return Ok(target);
            }
        }

        let expected = self.expected_checksum(&plan.checksum, cancel).await?;

        if target.exists() {
            log::info!("[Fetch] [REUSE] Found existing {}", target.display());
            let sum = match &expected {
                Some(expected) => {
                    verify_file(&target, expected).await?;
                    expected.clone()
                }
                None => digest_file(&target).await?,
            };
            record_checksum(&target, &sum);
            return Ok(target);
        }

        let partial = partial_path(&target);
        self.download_with_retries(&plan.url, &partial, cancel).await?;

        if let Some(expected) = &expected {
            if let Err(e) = verify_file(&partial, expected).await {
                let _ = fs::remove_file(&partial);
                return Err(match e {
                    ImagerError::ChecksumMismatch { expected, actual, .. } => {
                        ImagerError::ChecksumMismatch {
                            path: target,
                            expected,
                            actual,
                        }
                    }
                    other => other,
                });
            }
            log::info!("[Fetch] [VERIFY] Checksum OK for {}", plan.file_name);
        }
        let sum = match expected {
            Some(expected) => expected,
            None => digest_file(&partial).await?,
        };

        fs::rename(&partial, &target).map_err(|e| ImagerError::disk(&target, e))?;
        record_checksum(&target, &sum);
        log::info!("[Fetch] [DONE] Saved {}", target.display());
        Ok(target)
    }

    async fn expected_checksum(
        &self,
        source: &ChecksumSource,
        cancel: &CancelSignal,
    ) -> Result<Option<String>, ImagerError> {
        let (url, required) = match source {
            ChecksumSource::Required(url) => (url, true),
            ChecksumSource::Optional(url) => (url, false),
            ChecksumSource::None => {
                log::warn!("[Fetch] [VERIFY] No published checksum, skipping verification");
                return Ok(None);
            }
        };

        log::debug!("[Fetch] [VERIFY] Fetching checksum from {}", url);
        let response = net::bounded(
            "checksum request",
            async {
                self.client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| ImagerError::download(url.as_str(), e))
            },
            cancel,
            self.timeout,
        )
        .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND && !required {
            log::debug!("[Fetch] [VERIFY] No checksum published at {}", url);
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ImagerError::download(url.as_str(), format!("HTTP {}", status)));
        }

        let body = net::bounded(
            "checksum body",
            async {
                response
                    .text()
                    .await
                    .map_err(|e| ImagerError::download(url.as_str(), e))
            },
            cancel,
            self.timeout,
        )
        .await?;

        parse_checksum(&body)
            .map(Some)
            .ok_or_else(|| ImagerError::download(url.as_str(), "malformed checksum file"))
    }

    async fn download_with_retries(
        &self,
        url: &str,
        partial: &Path,
        cancel: &CancelSignal,
    ) -> Result<(), ImagerError> {
        let mut attempt = 1;
        loop {
            match self.download_once(url, partial, cancel).await {
                Ok(()) => return Ok(()),
                Err(e) if is_transfer_failure(&e) && attempt < self.attempts => {
                    log::warn!(
                        "[Fetch] [RETRY] Attempt {}/{} failed: {}",
                        attempt,
                        self.attempts,
                        e
                    );
                    net::pause(self.retry_delay, cancel, "download retry").await?;
                    attempt += 1;
                }
                Err(e) => {
                    log::error!("[Fetch] [ERROR] {}", e);
                    return Err(e);
                }
            }
        }
    }

    /// One transfer attempt, appending to `partial` when the server honors ranges.
    async fn download_once(
        &self,
        url: &str,
        partial: &Path,
        cancel: &CancelSignal,
    ) -> Result<(), ImagerError> {
        let offset = fs::metadata(partial).map(|m| m.len()).unwrap_or(0);

        let mut request = self.client.get(url);
        if offset > 0 {
            log::info!("[Fetch] [RESUME] Resuming {} from byte {}", url, offset);
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        } else {
            log::info!("[Fetch] [GET] Downloading {}", url);
        }

        let mut response = net::bounded(
            "download request",
            async { request.send().await.map_err(|e| ImagerError::download(url, e)) },
            cancel,
            self.timeout,
        )
        .await?;

        let status = response.status();
        let append = match status {
            StatusCode::PARTIAL_CONTENT if offset > 0 => true,
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                log::info!("[Fetch] [RESUME] Partial file already complete");
                return Ok(());
            }
            s if s.is_success() => {
                if offset > 0 {
                    log::warn!("[Fetch] [RESUME] Server ignored range, restarting from zero");
                }
                false
            }
            s => return Err(ImagerError::download(url, format!("HTTP {}", s))),
        };

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(partial)
            .await
            .map_err(|e| ImagerError::disk(partial, e))?;

        let total = response.content_length();
        let mut received: u64 = 0;
        loop {
            let chunk = net::bounded(
                "download",
                async { response.chunk().await.map_err(|e| ImagerError::download(url, e)) },
                cancel,
                self.timeout,
            )
            .await?;

            let Some(bytes) = chunk else { break };
            file.write_all(&bytes)
                .await
                .map_err(|e| ImagerError::disk(partial, e))?;
            received += bytes.len() as u64;
        }

        file.flush().await.map_err(|e| ImagerError::disk(partial, e))?;
        file.sync_all().await.map_err(|e| ImagerError::disk(partial, e))?;

        if let Some(total) = total {
            if received < total {
                return Err(ImagerError::download(
                    url,
                    format!("connection closed after {} of {} bytes", received, total),
                ));
            }
        }
        log::debug!("[Fetch] [GET] Received {} bytes", received);
        Ok(())
    }
}

fn is_transfer_failure(err: &ImagerError) -> bool {
    matches!(
        err,
        ImagerError::Download { .. } | ImagerError::Network(_) | ImagerError::Timeout { .. }
    )
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

fn file_name_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}

/// First token of a `sha256sum`-style line, lowercased.
fn parse_checksum(body: &str) -> Option<String> {
    let token = body.split_whitespace().next()?.to_ascii_lowercase();
    if token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(token)
    } else {
        None
    }
}

fn checksum_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(CHECKSUM_SUFFIX);
    PathBuf::from(name)
}

/// Digest stored beside `target` by an earlier verified fetch.
fn recorded_checksum(target: &Path) -> Option<String> {
    fs::read_to_string(checksum_path(target))
        .ok()
        .and_then(|body| parse_checksum(&body))
}

fn record_checksum(target: &Path, sum: &str) {
    let path = checksum_path(target);
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if let Err(e) = fs::write(&path, format!("{}  {}\n", sum, name)) {
        log::warn!("[Fetch] [VERIFY] Could not record checksum at {}: {}", path.display(), e);
    }
}

async fn digest_file(path: &Path) -> Result<String, ImagerError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || sha256_file(&owned))
        .await
        .map_err(|e| ImagerError::Internal(format!("checksum task failed: {}", e)))?
}

async fn verify_file(path: &Path, expected: &str) -> Result<(), ImagerError> {
    let actual = digest_file(path).await?;

    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        log::error!(
            "[Fetch] [VERIFY] Checksum mismatch for {}: expected {}, got {}",
            path.display(),
            expected,
            actual
        );
        Err(ImagerError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        })
    }
}

async fn copy_local(source: &Path, dest_dir: &Path) -> Result<PathBuf, ImagerError> {
    if !source.is_file() {
        return Err(ImagerError::disk(source, "base image file not found"));
    }
    let file_name = source
        .file_name()
        .ok_or_else(|| ImagerError::disk(source, "base image path has no file name"))?;
    let target = dest_dir.join(file_name);

    let same_file = match (source.canonicalize(), target.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };
    if same_file {
        log::info!("[Fetch] [LOCAL] Using {} in place", source.display());
        return Ok(target);
    }

    if target.is_file() {
        let source_sum = digest_file(source).await?;
        if digest_file(&target).await? == source_sum {
            log::info!("[Fetch] [REUSE] Found existing copy {}", target.display());
            return Ok(target);
        }
        log::warn!(
            "[Fetch] [LOCAL] {} differs from {}, replacing it",
            target.display(),
            source.display()
        );
    }

    log::info!(
        "[Fetch] [LOCAL] Copying {} to {}",
        source.display(),
        target.display()
    );
    let partial = partial_path(&target);
    tokio::fs::copy(source, &partial)
        .await
        .map_err(|e| ImagerError::disk(&partial, e))?;
    fs::rename(&partial, &target).map_err(|e| ImagerError::disk(&target, e))?;
    Ok(target)
}

/// Unpack `<name>.gz` into `<name>` next to it, reusing an earlier result.
async fn decompress_if_needed(archive: &Path) -> Result<PathBuf, ImagerError> {
    let Some(image) = decompressed_name(archive) else {
        return Ok(archive.to_path_buf());
    };

    if image.exists() {
        log::info!("[Fetch] [EXTRACT] Reusing {}", image.display());
        return Ok(image);
    }

    log::info!("[Fetch] [EXTRACT] Decompressing {}", archive.display());
    let archive = archive.to_path_buf();
    let out = image.clone();
    tokio::task::spawn_blocking(move || gunzip(&archive, &out))
        .await
        .map_err(|e| ImagerError::Internal(format!("decompression task failed: {}", e)))??;
    Ok(image)
}

fn decompressed_name(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".gz")?;
    if stem.is_empty() {
        return None;
    }
    Some(path.with_file_name(stem))
}

fn gunzip(archive: &Path, out: &Path) -> Result<(), ImagerError> {
    let input = File::open(archive).map_err(|e| ImagerError::disk(archive, e))?;
    let mut decoder = flate2::read::GzDecoder::new(BufReader::new(input));

    let partial = partial_path(out);
    let output = File::create(&partial).map_err(|e| ImagerError::disk(&partial, e))?;
    let mut writer = BufWriter::new(output);

    if let Err(e) = io::copy(&mut decoder, &mut writer) {
        drop(writer);
        let _ = fs::remove_file(&partial);
        return Err(ImagerError::disk(archive, format!("invalid gzip archive: {}", e)));
    }

    let output = writer
        .into_inner()
        .map_err(|e| ImagerError::disk(&partial, e.error()))?;
    output.sync_all().map_err(|e| ImagerError::disk(&partial, e))?;
    fs::rename(&partial, out).map_err(|e| ImagerError::disk(out, e))
}

/// Hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> Result<String, ImagerError> {
    let file = File::open(path).map_err(|e| ImagerError::disk(path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).map_err(|e| ImagerError::disk(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Report whether `dir` exists and how many entries it holds.
pub fn inspect_work_dir(dir: &Path) -> Result<WorkDirState, ImagerError> {
    if !dir.exists() {
        return Ok(WorkDirState {
            path: dir.to_path_buf(),
            exists: false,
            entries: 0,
        });
    }
    let entries = fs::read_dir(dir)
        .map_err(|e| ImagerError::disk(dir, e))?
        .count();
    Ok(WorkDirState {
        path: dir.to_path_buf(),
        exists: true,
        entries,
    })
}

/// Remove `dir` and everything in it. Missing directories are fine.
pub fn clear(dir: &Path) -> Result<(), ImagerError> {
    if !dir.exists() {
        return Ok(());
    }
    log::warn!("[Fetch] [CLEAR] Removing {}", dir.display());
    fs::remove_dir_all(dir).map_err(|e| ImagerError::disk(dir, e))
}
