//! Configuration module for the image-build core.
//!
//! # Module Structure
//!
//! - `loader`: reads and writes the settings file (`~/.config/skyimager/settings.json`)
//! - `validator`: checks `BuildConfig` invariants and settings values
//!
//! `ImagerSettings` holds the tunables that are not part of a single build
//! (release endpoint, timeouts, worker cap, field defaults). A `BuildConfig`
//! is derived from them by the caller and then treated as immutable.

pub mod loader;
pub mod validator;

use crate::error::ConfigError;
use crate::models::{BuildConfig, DEFAULT_GATEWAY_IP, DEFAULT_VISOR_COUNT};
use regex::Regex;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// GitHub releases endpoint for Skybian base images.
pub const DEFAULT_RELEASE_API_URL: &str = "https://api.github.com/repos/skycoin/skybian/releases";

/// Asset names considered base images.
pub const DEFAULT_BASE_IMAGE_PATTERN: &str = r"^Skybian-.*\.img(\.gz)?$";

/// Network operations give up after this long unless configured otherwise.
pub const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 10;

/// Tunables shared by every build run.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ImagerSettings {
    /// Release listing endpoint
    pub release_api_url: String,

    /// Regex selecting the base image asset within a release
    pub base_image_pattern: String,

    /// Per-request and per-chunk network timeout in seconds
    pub network_timeout_secs: u64,

    /// Download attempts before giving up on a network failure
    pub download_attempts: u32,

    /// Delay between download attempts in milliseconds
    pub retry_delay_ms: u64,

    /// Upper bound on parallel image builds (`None` = available CPUs)
    pub max_workers: Option<usize>,

    /// Defaults offered to callers building a `BuildConfig`
    pub default_work_dir: PathBuf,
    pub default_gateway_ip: Ipv4Addr,
    pub default_visors: u32,
    pub default_hypervisor: bool,
}

impl Default for ImagerSettings {
    fn default() -> Self {
        ImagerSettings {
            release_api_url: DEFAULT_RELEASE_API_URL.to_string(),
            base_image_pattern: DEFAULT_BASE_IMAGE_PATTERN.to_string(),
            network_timeout_secs: DEFAULT_NETWORK_TIMEOUT_SECS,
            download_attempts: 3,
            retry_delay_ms: 1000,
            max_workers: None,
            default_work_dir: default_root_dir(),
            default_gateway_ip: DEFAULT_GATEWAY_IP,
            default_visors: DEFAULT_VISOR_COUNT,
            default_hypervisor: true,
        }
    }
}

impl ImagerSettings {
    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Compile the base image asset pattern.
    pub fn base_image_regex(&self) -> Result<Regex, ConfigError> {
        Regex::new(&self.base_image_pattern).map_err(|e| {
            ConfigError::ValidationFailed(format!(
                "Invalid base image pattern '{}': {}",
                self.base_image_pattern, e
            ))
        })
    }

    /// Worker pool size for `units` build units.
    pub fn worker_count(&self, units: usize) -> usize {
        let cap = self.max_workers.unwrap_or_else(num_cpus::get).max(1);
        units.min(cap).max(1)
    }

    /// A `BuildConfig` pre-filled with these defaults.
    pub fn default_build_config(&self, base_image: impl Into<String>) -> BuildConfig {
        BuildConfig::new(self.default_work_dir.clone(), base_image)
            .with_gateway(Some(self.default_gateway_ip))
            .with_visors(self.default_visors)
            .with_hypervisor(self.default_hypervisor)
    }
}

/// Default work directory: `~/skyimager`, or `./skyimager` without a home.
pub fn default_root_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("skyimager")
}

/// Settings persistence with graceful fallback.
pub struct SettingsManager;

impl SettingsManager {
    /// Load settings from the global path, or return defaults if the file is
    /// missing or unreadable.
    ///
    /// A file that fails to parse is logged and replaced by defaults in memory;
    /// it is never rewritten here.
    pub fn load() -> Result<ImagerSettings, ConfigError> {
        let path = loader::get_global_settings_path()?;
        match loader::load_settings_from_file(&path) {
            Ok(settings) => {
                validator::validate_settings(&settings)?;
                Ok(settings)
            }
            Err(ConfigError::FileNotFound(_)) => Ok(ImagerSettings::default()),
            Err(ConfigError::InvalidJson(e)) => {
                log::warn!(
                    "[Config] [WARNING] Failed to parse {}, falling back to defaults: {}",
                    path.display(),
                    e
                );
                Ok(ImagerSettings::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Save settings to the global path.
    pub fn save(settings: &ImagerSettings) -> Result<(), ConfigError> {
        validator::validate_settings(settings)?;
        loader::ensure_settings_dir_exists()?;
        let path = loader::get_global_settings_path()?;
        loader::save_settings_to_file(settings, &path)
    }
}
