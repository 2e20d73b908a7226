//! Core data types for Skyimager.

use chrono::{DateTime, Utc};
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Default gateway handed to generated boot parameters.
pub const DEFAULT_GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 1);

/// Default number of visor images.
pub const DEFAULT_VISOR_COUNT: u32 = 6;

/// Immutable description of one build run.
///
/// Created once by the caller (GUI, CLI, tests) and handed to the orchestrator
/// by reference. Nothing in the core mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Directory receiving the base image and final images
    pub work_dir: PathBuf,

    /// Base image: release tag, `latest`, direct URL or local path
    pub base_image: String,

    /// Gateway shared by every generated image
    pub gateway_ip: Option<Ipv4Addr>,

    /// Skysocks passcode, empty for none
    #[serde(default)]
    pub passcode: String,

    /// Number of visor images to produce
    pub visors: u32,

    /// Also produce a hypervisor image
    pub hypervisor: bool,

    /// Hex seed for key derivation; fixes the generated keys for this config
    pub key_seed: String,
}

impl BuildConfig {
    /// Create a config with defaults and a fresh random key seed.
    pub fn new(work_dir: impl Into<PathBuf>, base_image: impl Into<String>) -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        BuildConfig {
            work_dir: work_dir.into(),
            base_image: base_image.into(),
            gateway_ip: Some(DEFAULT_GATEWAY_IP),
            passcode: String::new(),
            visors: DEFAULT_VISOR_COUNT,
            hypervisor: true,
            key_seed: hex::encode(seed),
        }
    }

    pub fn with_gateway(mut self, gateway: Option<Ipv4Addr>) -> Self {
        self.gateway_ip = gateway;
        self
    }

    pub fn with_passcode(mut self, passcode: impl Into<String>) -> Self {
        self.passcode = passcode.into();
        self
    }

    pub fn with_visors(mut self, visors: u32) -> Self {
        self.visors = visors;
        self
    }

    pub fn with_hypervisor(mut self, hypervisor: bool) -> Self {
        self.hypervisor = hypervisor;
        self
    }

    pub fn with_key_seed(mut self, seed: impl Into<String>) -> Self {
        self.key_seed = seed.into();
        self
    }

    /// Number of images this config asks for (visors plus optional hypervisor).
    pub fn unit_count(&self) -> u64 {
        self.visors as u64 + u64::from(self.hypervisor)
    }

    /// Directory holding the final images.
    pub fn images_dir(&self) -> PathBuf {
        self.work_dir.join("images")
    }
}

/// How the base image identifier of a [`BuildConfig`] is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseImageRef {
    /// Newest release in the catalog
    Latest,
    /// Named release tag
    Tag(String),
    /// Direct download URL
    Url(String),
    /// File already on disk
    Local(PathBuf),
}

impl BaseImageRef {
    /// Classify a raw base image identifier.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("latest") {
            return BaseImageRef::Latest;
        }
        if let Ok(url) = reqwest::Url::parse(raw) {
            if url.scheme() == "http" || url.scheme() == "https" {
                return BaseImageRef::Url(raw.to_string());
            }
            if url.scheme() == "file" {
                if let Ok(path) = url.to_file_path() {
                    return BaseImageRef::Local(path);
                }
            }
        }
        let path = Path::new(raw);
        if path.is_absolute() || raw.contains(std::path::MAIN_SEPARATOR) || path.exists() {
            return BaseImageRef::Local(path.to_path_buf());
        }
        BaseImageRef::Tag(raw.to_string())
    }

    /// Whether the catalog must be consulted to resolve this reference.
    pub fn needs_catalog(&self) -> bool {
        matches!(self, BaseImageRef::Latest | BaseImageRef::Tag(_))
    }
}

/// Resolved location the fetcher pulls the base image from.
#[derive(Debug, Clone, PartialEq)]
pub enum BaseImageSource {
    Release(Release),
    Url(String),
    Local(PathBuf),
}

/// A downloadable file attached to a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub size: u64,
}

/// One published base image release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub tag: String,
    pub published_at: DateTime<Utc>,
    pub assets: Vec<ReleaseAsset>,
}

impl Release {
    /// First asset whose name matches the base image pattern.
    pub fn base_image_asset(&self, pattern: &Regex) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|a| pattern.is_match(&a.name))
    }

    /// The `<name>.sha256` companion of an asset, if published.
    pub fn checksum_asset(&self, asset_name: &str) -> Option<&ReleaseAsset> {
        let wanted = format!("{}.sha256", asset_name);
        self.assets.iter().find(|a| a.name == wanted)
    }
}

impl fmt::Display for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.tag, self.published_at.format("%Y-%m-%d"))
    }
}

/// Position of a boot parameter set in the generated sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootIndex {
    Visor(u32),
    Hypervisor,
}

impl BootIndex {
    /// Output file name under `images/`.
    pub fn file_name(&self) -> String {
        match self {
            BootIndex::Visor(i) => format!("{}.img", i),
            BootIndex::Hypervisor => "hypervisor.img".to_string(),
        }
    }

    pub fn mode(&self) -> BootMode {
        match self {
            BootIndex::Visor(_) => BootMode::Visor,
            BootIndex::Hypervisor => BootMode::Hypervisor,
        }
    }
}

impl fmt::Display for BootIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootIndex::Visor(i) => write!(f, "{}", i),
            BootIndex::Hypervisor => write!(f, "hypervisor"),
        }
    }
}

/// Role the image boots into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootMode {
    Visor,
    Hypervisor,
}

impl BootMode {
    pub fn as_byte(&self) -> u8 {
        match self {
            BootMode::Visor => 1,
            BootMode::Hypervisor => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(BootMode::Visor),
            2 => Some(BootMode::Hypervisor),
            _ => None,
        }
    }
}

/// Per-image configuration written into a copy of the base image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootParams {
    pub index: BootIndex,
    pub mode: BootMode,
    pub local_ip: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
    pub hostname: String,
    pub passcode: String,
    /// Hex ed25519 secret seed
    pub secret_key: String,
    /// Hex ed25519 public key
    pub public_key: String,
    /// Hex public keys of hypervisors this visor trusts
    pub hypervisor_pks: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactStatus {
    Pending,
    Success,
    Failed,
}

/// Outcome of building one final image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub path: PathBuf,
    pub index: BootIndex,
    pub status: ArtifactStatus,
    pub error: Option<String>,
}

impl BuildArtifact {
    pub fn pending(path: PathBuf, index: BootIndex) -> Self {
        BuildArtifact {
            path,
            index,
            status: ArtifactStatus::Pending,
            error: None,
        }
    }

    pub fn succeeded(mut self) -> Self {
        self.status = ArtifactStatus::Success;
        self.error = None;
        self
    }

    pub fn failed(mut self, detail: impl Into<String>) -> Self {
        self.status = ArtifactStatus::Failed;
        self.error = Some(detail.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ArtifactStatus::Success
    }
}

/// Final orchestrator status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// What a finished run hands back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    pub status: RunStatus,
    pub base_image: PathBuf,
    /// Sorted by boot index
    pub artifacts: Vec<BuildArtifact>,
    pub summary: String,
}

impl BuildReport {
    pub fn succeeded(&self) -> usize {
        self.artifacts.iter().filter(|a| a.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.artifacts.len() - self.succeeded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_unit_count() {
        let config = BuildConfig::new("/tmp/w", "latest").with_visors(3);
        assert_eq!(config.unit_count(), 4);
        assert_eq!(config.with_hypervisor(false).unit_count(), 3);
    }

    #[test]
    fn test_new_configs_get_distinct_seeds() {
        let a = BuildConfig::new("/tmp/w", "latest");
        let b = BuildConfig::new("/tmp/w", "latest");
        assert_eq!(a.key_seed.len(), 64);
        assert_ne!(a.key_seed, b.key_seed);
    }

    #[test]
    fn test_base_image_ref_parse() {
        assert_eq!(BaseImageRef::parse("latest"), BaseImageRef::Latest);
        assert_eq!(BaseImageRef::parse(" LATEST "), BaseImageRef::Latest);
        assert_eq!(
            BaseImageRef::parse("https://example.com/Skybian.img.gz"),
            BaseImageRef::Url("https://example.com/Skybian.img.gz".to_string())
        );
        assert_eq!(
            BaseImageRef::parse("/srv/images/base.img"),
            BaseImageRef::Local(PathBuf::from("/srv/images/base.img"))
        );
        assert_eq!(
            BaseImageRef::parse("v0.1.3"),
            BaseImageRef::Tag("v0.1.3".to_string())
        );
        assert!(BaseImageRef::parse("v0.1.3").needs_catalog());
        assert!(!BaseImageRef::parse("/srv/base.img").needs_catalog());
    }

    #[test]
    fn test_release_display_and_assets() {
        let release = Release {
            tag: "v0.2.0".to_string(),
            published_at: Utc.with_ymd_and_hms(2020, 5, 17, 10, 0, 0).unwrap(),
            assets: vec![
                ReleaseAsset {
                    name: "Skybian-v0.2.0.img.gz".to_string(),
                    url: "https://example.com/a".to_string(),
                    size: 10,
                },
                ReleaseAsset {
                    name: "Skybian-v0.2.0.img.gz.sha256".to_string(),
                    url: "https://example.com/b".to_string(),
                    size: 64,
                },
            ],
        };
        assert_eq!(release.to_string(), "v0.2.0 (2020-05-17)");

        let pattern = Regex::new(r"^Skybian-.*\.img(\.gz)?$").unwrap();
        let asset = release.base_image_asset(&pattern).unwrap();
        assert_eq!(asset.url, "https://example.com/a");
        assert_eq!(
            release.checksum_asset(&asset.name).map(|a| a.url.as_str()),
            Some("https://example.com/b")
        );
    }

    #[test]
    fn test_boot_index_file_names() {
        assert_eq!(BootIndex::Visor(2).file_name(), "2.img");
        assert_eq!(BootIndex::Hypervisor.file_name(), "hypervisor.img");
        assert!(BootIndex::Visor(100) < BootIndex::Hypervisor);
        assert_eq!(BootIndex::Hypervisor.mode(), BootMode::Hypervisor);
    }

    #[test]
    fn test_boot_mode_bytes() {
        for mode in [BootMode::Visor, BootMode::Hypervisor] {
            assert_eq!(BootMode::from_byte(mode.as_byte()), Some(mode));
        }
        assert_eq!(BootMode::from_byte(0), None);
    }

    #[test]
    fn test_artifact_transitions() {
        let a = BuildArtifact::pending(PathBuf::from("/w/images/0.img"), BootIndex::Visor(0));
        assert_eq!(a.status, ArtifactStatus::Pending);
        let failed = a.clone().failed("disk full");
        assert_eq!(failed.error.as_deref(), Some("disk full"));
        assert!(a.succeeded().is_success());
    }
}
