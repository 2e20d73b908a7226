//! `images/manifest.json`: record of what a run produced.
//!
//! Written after the Building stage so the work directory can be inspected
//! later without re-reading every image. Secret keys are never stored.

use crate::error::ImagerError;
use crate::models::{BootIndex, BootParams, BuildArtifact, BuildConfig, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Public identity of one generated image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub index: BootIndex,
    pub hostname: String,
    pub local_ip: Ipv4Addr,
    pub public_key: String,
}

impl From<&BootParams> for ManifestEntry {
    fn from(params: &BootParams) -> Self {
        ManifestEntry {
            index: params.index,
            hostname: params.hostname.clone(),
            local_ip: params.local_ip,
            public_key: params.public_key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildManifest {
    pub created_at: DateTime<Utc>,
    pub base_image: PathBuf,
    /// Hex SHA-256 of the base image the run stamped
    pub base_image_sha256: String,
    pub gateway_ip: Option<Ipv4Addr>,
    pub visors: u32,
    pub hypervisor: bool,
    pub status: RunStatus,
    pub entries: Vec<ManifestEntry>,
    pub artifacts: Vec<BuildArtifact>,
    /// Images left over from an earlier run in the same directory
    #[serde(default)]
    pub stale_images: Vec<PathBuf>,
}

impl BuildManifest {
    pub fn new(
        config: &BuildConfig,
        base_image: &Path,
        base_image_sha256: String,
        params: &[BootParams],
        artifacts: &[BuildArtifact],
        status: RunStatus,
    ) -> Self {
        BuildManifest {
            created_at: Utc::now(),
            base_image: base_image.to_path_buf(),
            base_image_sha256,
            gateway_ip: config.gateway_ip,
            visors: config.visors,
            hypervisor: config.hypervisor,
            status,
            entries: params.iter().map(ManifestEntry::from).collect(),
            artifacts: artifacts.to_vec(),
            stale_images: Vec::new(),
        }
    }

    pub fn path_in(images_dir: &Path) -> PathBuf {
        images_dir.join(MANIFEST_FILE)
    }

    /// Write atomically into `images_dir`.
    pub fn save(&self, images_dir: &Path) -> Result<PathBuf, ImagerError> {
        let path = Self::path_in(images_dir);
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| ImagerError::Internal(format!("failed to serialize manifest: {}", e)))?;

        let mut tmp = tempfile::NamedTempFile::new_in(images_dir)
            .map_err(|e| ImagerError::disk(images_dir, e))?;
        tmp.write_all(&json).map_err(|e| ImagerError::disk(&path, e))?;
        tmp.as_file().sync_all().map_err(|e| ImagerError::disk(&path, e))?;
        tmp.persist(&path).map_err(|e| ImagerError::disk(&path, e.error))?;

        log::debug!("[Orchestrator] [MANIFEST] Wrote {}", path.display());
        Ok(path)
    }

    pub fn load(images_dir: &Path) -> Result<Self, ImagerError> {
        let path = Self::path_in(images_dir);
        let content = std::fs::read_to_string(&path).map_err(|e| ImagerError::disk(&path, e))?;
        serde_json::from_str(&content)
            .map_err(|e| ImagerError::disk(&path, format!("invalid manifest: {}", e)))
    }
}
