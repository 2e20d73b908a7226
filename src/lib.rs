//! Skyimager build core
//!
//! Builds ready-to-flash Skybian images: discovers a base image release,
//! fetches it, derives per-device boot parameters and stamps them into one
//! copy of the base image per device.
//!
//! The system is organized into functional modules:
//! - **error**: Unified error type hierarchy
//! - **models**: Core data structures and types
//! - **config**: Settings file handling and BuildConfig validation
//! - **net**: Cancellation and timeout plumbing for network calls
//! - **release**: Release catalog over a GitHub-style listing endpoint
//! - **fetch**: Base image download, verification and unpacking
//! - **bootparams**: Boot parameter generation and binary codec
//! - **builder**: Final image assembly
//! - **orchestrator**: Stage machine driving a whole run
//! - **log_collector**: File-backed `log` backend

// Core foundational modules
pub mod error;
pub mod models;

pub mod config;
pub mod net;

pub mod bootparams;
pub mod builder;
pub mod fetch;
pub mod release;

pub mod orchestrator;

pub mod log_collector;

// Re-export the log crate for macro usage
pub use log;

pub use log_collector::{LogCollector, LogLine};

// ============================================================================
// PUBLIC RE-EXPORTS FOR CONVENIENCE
// ============================================================================

pub use error::{ConfigError, ImagerError, Result};

pub use models::{
    ArtifactStatus, BaseImageRef, BaseImageSource, BootIndex, BootMode, BootParams,
    BuildArtifact, BuildConfig, BuildReport, Release, ReleaseAsset, RunStatus,
};

pub use config::{ImagerSettings, SettingsManager};

pub use builder::{ImageBuilder, ImageWriter};
pub use fetch::ImageFetcher;
pub use release::{GithubReleaseSource, ReleaseCatalog, ReleaseSource};

pub use orchestrator::{
    BuildEvent, BuildManifest, BuildObserver, BuildOrchestrator, BuildStage, ChannelObserver,
    LogObserver, NullObserver, OrchestrationState,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
