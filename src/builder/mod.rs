//! Final image assembly.
//!
//! Each unit copies the read-only base image into a temporary file next to
//! its destination, stamps the encoded boot parameters into the MBR
//! bootstrap area and renames the result into place. A failed unit leaves
//! nothing behind at `dest`.

use crate::bootparams::codec::{self, BOOT_PARAMS_OFFSET, REGION_LEN};
use crate::error::ImagerError;
use crate::models::{BootParams, BuildArtifact};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Size of the first sector.
pub const SECTOR_LEN: usize = 512;

/// `0x55AA` at the end of the first sector.
pub const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const SIGNATURE_OFFSET: usize = 510;

/// Produces one final image. Implementations run on blocking worker threads.
pub trait ImageWriter: Send + Sync {
    fn build(
        &self,
        base_image: &Path,
        params: &BootParams,
        dest: &Path,
    ) -> Result<BuildArtifact, ImagerError>;
}

/// Writes boot parameters into a copy of a Skybian base image.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageBuilder;

impl ImageBuilder {
    pub fn new() -> Self {
        ImageBuilder
    }
}

impl ImageWriter for ImageBuilder {
    fn build(
        &self,
        base_image: &Path,
        params: &BootParams,
        dest: &Path,
    ) -> Result<BuildArtifact, ImagerError> {
        log::info!(
            "[Build] [UNIT] Building image {} -> {}",
            params.index,
            dest.display()
        );

        check_base_image(base_image)?;
        let blob = codec::encode(params)?;

        let dir = dest
            .parent()
            .ok_or_else(|| ImagerError::Build(format!("{} has no parent directory", dest.display())))?;
        fs::create_dir_all(dir).map_err(|e| build_io(dir, e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| build_io(dir, e))?;
        {
            let mut base = File::open(base_image).map_err(|e| build_io(base_image, e))?;
            std::io::copy(&mut base, tmp.as_file_mut()).map_err(|e| build_io(tmp.path(), e))?;
        }

        let file = tmp.as_file_mut();
        file.seek(SeekFrom::Start(BOOT_PARAMS_OFFSET as u64))
            .map_err(|e| build_io(dest, e))?;
        file.write_all(&blob).map_err(|e| build_io(dest, e))?;
        file.sync_all().map_err(|e| build_io(dest, e))?;

        tmp.persist(dest)
            .map_err(|e| build_io(dest, e.error))?;

        log::info!("[Build] [UNIT] Image {} ready", params.index);
        Ok(BuildArtifact::pending(dest.to_path_buf(), params.index).succeeded())
    }
}

fn build_io(path: &Path, err: impl std::fmt::Display) -> ImagerError {
    ImagerError::Build(format!("{}: {}", path.display(), err))
}

fn read_first_sector(image: &Path) -> Result<[u8; SECTOR_LEN], ImagerError> {
    let mut file = File::open(image).map_err(|e| build_io(image, e))?;
    let len = file.metadata().map_err(|e| build_io(image, e))?.len();
    if len < SECTOR_LEN as u64 {
        return Err(ImagerError::Build(format!(
            "{} is {} bytes, smaller than one sector",
            image.display(),
            len
        )));
    }
    let mut sector = [0u8; SECTOR_LEN];
    file.read_exact(&mut sector).map_err(|e| build_io(image, e))?;
    Ok(sector)
}

/// Reject files that are too small or lack an MBR boot signature.
pub fn check_base_image(image: &Path) -> Result<(), ImagerError> {
    let sector = read_first_sector(image)?;
    if sector[SIGNATURE_OFFSET..SECTOR_LEN] != MBR_SIGNATURE {
        return Err(ImagerError::Build(format!(
            "{} has no MBR boot signature",
            image.display()
        )));
    }
    Ok(())
}

/// Read back the boot parameters stamped into a built image.
pub fn read_boot_params(image: &Path) -> Result<BootParams, ImagerError> {
    let sector = read_first_sector(image)?;
    codec::decode(&sector[BOOT_PARAMS_OFFSET..BOOT_PARAMS_OFFSET + REGION_LEN])
}
