//! Settings file loader and serialization.

use crate::config::ImagerSettings;
use crate::error::ConfigError;
use std::fs;
use std::path::{Path, PathBuf};

fn config_dir() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or_else(|| {
        ConfigError::ValidationFailed("Cannot determine home directory".to_string())
    })?;
    Ok(home.join(".config/skyimager"))
}

/// Get the global settings path: ~/.config/skyimager/settings.json
pub fn get_global_settings_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("settings.json"))
}

/// Ensure the global settings directory exists
pub fn ensure_settings_dir_exists() -> Result<(), ConfigError> {
    fs::create_dir_all(config_dir()?).map_err(ConfigError::IoError)?;
    Ok(())
}

/// Load settings from a JSON file.
pub fn load_settings_from_file(path: &Path) -> Result<ImagerSettings, ConfigError> {
    validate_settings_path(path)?;

    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound(format!("Settings file not found at: {}", path.display()))
        } else {
            ConfigError::IoError(e)
        }
    })?;

    let settings: ImagerSettings =
        serde_json::from_str(&content).map_err(ConfigError::InvalidJson)?;

    Ok(settings)
}

/// Save settings to a JSON file.
pub fn save_settings_to_file(settings: &ImagerSettings, path: &Path) -> Result<(), ConfigError> {
    validate_settings_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(ConfigError::IoError)?;
        }
    }

    let json_content = serde_json::to_string_pretty(settings).map_err(ConfigError::InvalidJson)?;
    fs::write(path, json_content).map_err(ConfigError::IoError)?;

    Ok(())
}

/// Validate settings path (.json extension required).
pub fn validate_settings_path(path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "Settings path cannot be empty".to_string(),
        ));
    }

    match path.extension() {
        Some(ext) if ext == "json" => Ok(()),
        Some(ext) => Err(ConfigError::ValidationFailed(format!(
            "Settings file must have .json extension, got .{}",
            ext.to_string_lossy()
        ))),
        None => Err(ConfigError::ValidationFailed(
            "Settings file must have .json extension".to_string(),
        )),
    }
}
