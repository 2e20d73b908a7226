//! Unified error type hierarchy for Skyimager
//!
//! `ImagerError` carries the build-core taxonomy (config, network, integrity,
//! per-unit build, disk, internal). `ConfigError` covers the settings file.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Settings file parsing and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Settings file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid JSON in settings: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Settings validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error during settings operations: {0}")]
    IoError(#[from] io::Error),
}

/// Errors raised by the image-build core.
///
/// Catalog, fetch and config errors abort a run. `Build` errors are recorded
/// per unit and only surface in the final report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImagerError {
    /// Build configuration violates its contract
    #[error("Invalid build configuration: {0}")]
    InvalidConfig(String),

    /// Release source unreachable or returned garbage
    #[error("Release source unavailable: {0}")]
    Network(String),

    /// Release source answered but listed nothing usable
    #[error("No base image releases found at {0}")]
    EmptyCatalog(String),

    /// Artifact transfer failed
    #[error("Download of {url} failed: {reason}")]
    Download { url: String, reason: String },

    /// Artifact content does not match its published digest
    #[error("Checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// A single image build failed
    #[error("Image build failed: {0}")]
    Build(String),

    /// Local filesystem failure
    #[error("Disk error at {}: {reason}", path.display())]
    Disk { path: PathBuf, reason: String },

    /// Invariant broken inside the core
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    /// Another run already owns the work directory
    #[error("A build is already running in {}", .0.display())]
    AlreadyRunning(PathBuf),
}

impl ImagerError {
    /// Wrap an I/O failure at a path.
    pub fn disk(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        ImagerError::Disk {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    pub fn download(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        ImagerError::Download {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether a caller may reasonably retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ImagerError::Network(_)
                | ImagerError::Download { .. }
                | ImagerError::Timeout { .. }
                | ImagerError::Cancelled(_)
                | ImagerError::ChecksumMismatch { .. }
        )
    }

    /// Short category name, used in logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            ImagerError::InvalidConfig(_) => "invalid-config",
            ImagerError::Network(_) => "network",
            ImagerError::EmptyCatalog(_) => "empty-catalog",
            ImagerError::Download { .. } => "download",
            ImagerError::ChecksumMismatch { .. } => "checksum-mismatch",
            ImagerError::Build(_) => "build",
            ImagerError::Disk { .. } => "disk",
            ImagerError::Internal(_) => "internal",
            ImagerError::Cancelled(_) => "cancelled",
            ImagerError::Timeout { .. } => "timeout",
            ImagerError::AlreadyRunning(_) => "already-running",
        }
    }

    /// Get a user-facing error message suitable for display
    pub fn user_message(&self) -> String {
        match self {
            ImagerError::InvalidConfig(msg) => format!("Please check the build settings: {}", msg),
            ImagerError::Network(msg) => {
                format!("Could not reach the release server: {}", msg)
            }
            ImagerError::EmptyCatalog(src) => {
                format!("The release server at {} has no base images to offer", src)
            }
            ImagerError::Download { url, reason } => {
                format!("Downloading {} failed ({}). Try again later.", url, reason)
            }
            ImagerError::ChecksumMismatch { path, .. } => format!(
                "The downloaded file {} is corrupted. Clear the work directory and retry.",
                path.display()
            ),
            ImagerError::Build(msg) => format!("Image build failed: {}", msg),
            ImagerError::Disk { path, reason } => {
                format!("File operation failed at {}: {}", path.display(), reason)
            }
            ImagerError::Internal(msg) => format!("Unexpected internal error: {}", msg),
            ImagerError::Cancelled(what) => format!("Cancelled: {}", what),
            ImagerError::Timeout { what, after } => {
                format!("{} took longer than {}s", what, after.as_secs())
            }
            ImagerError::AlreadyRunning(dir) => format!(
                "Another build is using {}. Wait for it to finish.",
                dir.display()
            ),
        }
    }
}

/// Top-level result type for the binary and glue code.
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;
