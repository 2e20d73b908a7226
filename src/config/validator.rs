//! Build config and settings validation.
//!
//! The GUI or CLI validates raw text first; these checks run again inside the
//! core so a malformed `BuildConfig` never reaches the fetch or build stages.

use crate::config::ImagerSettings;
use crate::error::{ConfigError, ImagerError};
use crate::models::BuildConfig;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Longest passcode that fits the boot parameter region.
pub const MAX_PASSCODE_LEN: usize = 32;

/// Highest host octet handed out inside the gateway's /24.
const MAX_HOST_OCTET: u64 = 254;

/// Resolve a work directory to an absolute path without touching the filesystem.
pub fn resolve_work_dir(dir: &Path) -> Result<PathBuf, ImagerError> {
    if dir.as_os_str().is_empty() {
        return Err(ImagerError::InvalidConfig(
            "work directory cannot be empty".to_string(),
        ));
    }
    if dir.is_absolute() {
        return Ok(dir.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| {
        ImagerError::InvalidConfig(format!("invalid work directory {}: {}", dir.display(), e))
    })?;
    Ok(cwd.join(dir))
}

/// Check every `BuildConfig` invariant.
///
/// Returns a copy with the work directory made absolute.
pub fn validate_build_config(config: &BuildConfig) -> Result<BuildConfig, ImagerError> {
    let work_dir = resolve_work_dir(&config.work_dir)?;

    if config.base_image.trim().is_empty() {
        return Err(ImagerError::InvalidConfig(
            "base image cannot be empty".to_string(),
        ));
    }

    if config.passcode.len() > MAX_PASSCODE_LEN {
        return Err(ImagerError::InvalidConfig(format!(
            "passcode is {} bytes, at most {} allowed",
            config.passcode.len(),
            MAX_PASSCODE_LEN
        )));
    }

    let seed = hex::decode(&config.key_seed).map_err(|e| {
        ImagerError::InvalidConfig(format!("key seed is not valid hex: {}", e))
    })?;
    if seed.is_empty() {
        return Err(ImagerError::InvalidConfig(
            "key seed cannot be empty".to_string(),
        ));
    }

    if config.unit_count() > 0 {
        let gateway = config.gateway_ip.ok_or_else(|| {
            ImagerError::InvalidConfig("gateway IP is required to build images".to_string())
        })?;
        validate_gateway(gateway)?;
        validate_address_range(gateway, config.visors, config.hypervisor)?;
    }

    Ok(BuildConfig {
        work_dir,
        ..config.clone()
    })
}

/// Reject gateways that cannot route a /24 of devices.
pub fn validate_gateway(gateway: Ipv4Addr) -> Result<(), ImagerError> {
    if gateway.is_unspecified()
        || gateway.is_broadcast()
        || gateway.is_multicast()
        || gateway.is_loopback()
    {
        return Err(ImagerError::InvalidConfig(format!(
            "gateway IP {} is not a usable unicast address",
            gateway
        )));
    }
    let host = gateway.octets()[3];
    if host == 0 || host == 255 {
        return Err(ImagerError::InvalidConfig(format!(
            "gateway IP {} is a network or broadcast address",
            gateway
        )));
    }
    Ok(())
}

/// Generated addresses start right after the gateway and must stay inside its /24.
pub fn validate_address_range(
    gateway: Ipv4Addr,
    visors: u32,
    hypervisor: bool,
) -> Result<(), ImagerError> {
    let base = gateway.octets()[3] as u64;
    let highest = if visors > 0 {
        base + 1 + visors as u64
    } else if hypervisor {
        base + 1
    } else {
        return Ok(());
    };
    if highest > MAX_HOST_OCTET {
        return Err(ImagerError::InvalidConfig(format!(
            "{} visor images do not fit after gateway {} (last address would be .{})",
            visors, gateway, highest
        )));
    }
    Ok(())
}

/// Parse a visor count typed by a user.
pub fn parse_visor_count(raw: &str) -> Result<u32, ImagerError> {
    let value: i64 = raw.trim().parse().map_err(|e| {
        ImagerError::InvalidConfig(format!("invalid number of visor images '{}': {}", raw, e))
    })?;
    if value < 0 {
        return Err(ImagerError::InvalidConfig(format!(
            "cannot create {} visor images",
            value
        )));
    }
    u32::try_from(value).map_err(|_| {
        ImagerError::InvalidConfig(format!("cannot create {} visor images", value))
    })
}

/// Parse a gateway IP typed by a user.
pub fn parse_gateway_ip(raw: &str) -> Result<Ipv4Addr, ImagerError> {
    raw.trim()
        .parse()
        .map_err(|_| ImagerError::InvalidConfig(format!("invalid gateway IP '{}'", raw)))
}

/// Validate settings values.
pub fn validate_settings(settings: &ImagerSettings) -> Result<(), ConfigError> {
    reqwest::Url::parse(&settings.release_api_url).map_err(|e| {
        ConfigError::ValidationFailed(format!(
            "Invalid release API URL '{}': {}",
            settings.release_api_url, e
        ))
    })?;
    settings.base_image_regex()?;
    if settings.network_timeout_secs == 0 {
        return Err(ConfigError::ValidationFailed(
            "Network timeout must be at least 1 second".to_string(),
        ));
    }
    if settings.download_attempts == 0 {
        return Err(ConfigError::ValidationFailed(
            "Download attempts must be at least 1".to_string(),
        ));
    }
    Ok(())
}
