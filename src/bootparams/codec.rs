//! Binary layout of boot parameters inside the MBR bootstrap area.
//!
//! ```text
//! offset  size  field
//! 0       4     magic "SKYB"
//! 4       1     format version
//! 5       1     mode (1 visor, 2 hypervisor)
//! 6       4     index, u32 LE (0xFFFFFFFF for the hypervisor)
//! 10      4     local IP
//! 14      4     gateway IP
//! 18      32    ed25519 secret seed
//! 50      1     trusted hypervisor key count N
//! 51      32*N  hypervisor public keys
//! ..      1+P   passcode length, bytes
//! ..      1+H   hostname length, bytes
//! ..      4     first 4 bytes of SHA-256 over everything above
//! ..            zero padding up to REGION_LEN
//! ```

use crate::error::ImagerError;
use crate::models::{BootIndex, BootMode, BootParams};
use ed25519_dalek::SigningKey;
use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;

/// Start of the blob inside the first sector.
pub const BOOT_PARAMS_OFFSET: usize = 0x0E0;

/// Bytes available before the partition table at 0x1BE.
pub const REGION_LEN: usize = 0x1BE - BOOT_PARAMS_OFFSET;

pub const MAGIC: &[u8; 4] = b"SKYB";
pub const FORMAT_VERSION: u8 = 1;

const HYPERVISOR_INDEX: u32 = u32::MAX;
const KEY_LEN: usize = 32;
const CHECKSUM_LEN: usize = 4;

pub fn index_to_wire(index: BootIndex) -> u32 {
    match index {
        BootIndex::Visor(i) => i,
        BootIndex::Hypervisor => HYPERVISOR_INDEX,
    }
}

fn index_from_wire(raw: u32) -> BootIndex {
    if raw == HYPERVISOR_INDEX {
        BootIndex::Hypervisor
    } else {
        BootIndex::Visor(raw)
    }
}

fn decode_key(hex_key: &str, what: &str) -> Result<[u8; KEY_LEN], ImagerError> {
    hex::decode(hex_key)
        .ok()
        .and_then(|bytes| <[u8; KEY_LEN]>::try_from(bytes).ok())
        .ok_or_else(|| ImagerError::Build(format!("{} is not a 32-byte hex key", what)))
}

fn push_short_str(out: &mut Vec<u8>, value: &str, what: &str) -> Result<(), ImagerError> {
    let len = u8::try_from(value.len())
        .map_err(|_| ImagerError::Build(format!("{} is too long to encode", what)))?;
    out.push(len);
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Encode into exactly [`REGION_LEN`] bytes.
pub fn encode(params: &BootParams) -> Result<Vec<u8>, ImagerError> {
    let mut out = Vec::with_capacity(REGION_LEN);
    out.extend_from_slice(MAGIC);
    out.push(FORMAT_VERSION);
    out.push(params.mode.as_byte());
    out.extend_from_slice(&index_to_wire(params.index).to_le_bytes());
    out.extend_from_slice(&params.local_ip.octets());
    out.extend_from_slice(&params.gateway_ip.octets());
    out.extend_from_slice(&decode_key(&params.secret_key, "secret key")?);

    let count = u8::try_from(params.hypervisor_pks.len())
        .map_err(|_| ImagerError::Build("too many hypervisor keys".to_string()))?;
    out.push(count);
    for pk in &params.hypervisor_pks {
        out.extend_from_slice(&decode_key(pk, "hypervisor public key")?);
    }

    push_short_str(&mut out, &params.passcode, "passcode")?;
    push_short_str(&mut out, &params.hostname, "hostname")?;

    let sum = Sha256::digest(&out);
    out.extend_from_slice(&sum[..CHECKSUM_LEN]);

    if out.len() > REGION_LEN {
        return Err(ImagerError::Build(format!(
            "boot parameters need {} bytes, only {} reserved",
            out.len(),
            REGION_LEN
        )));
    }
    out.resize(REGION_LEN, 0);
    Ok(out)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ImagerError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| ImagerError::Build("boot parameter blob is truncated".to_string()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, ImagerError> {
        Ok(self.take(1)?[0])
    }

    fn ip(&mut self) -> Result<Ipv4Addr, ImagerError> {
        let b = self.take(4)?;
        Ok(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
    }

    fn key(&mut self) -> Result<[u8; KEY_LEN], ImagerError> {
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(self.take(KEY_LEN)?);
        Ok(key)
    }

    fn short_str(&mut self, what: &str) -> Result<String, ImagerError> {
        let len = self.byte()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ImagerError::Build(format!("{} is not valid UTF-8", what)))
    }
}

/// Decode and verify a blob produced by [`encode`].
pub fn decode(blob: &[u8]) -> Result<BootParams, ImagerError> {
    if blob.len() < REGION_LEN {
        return Err(ImagerError::Build(format!(
            "boot parameter region is {} bytes, expected {}",
            blob.len(),
            REGION_LEN
        )));
    }
    let blob = &blob[..REGION_LEN];
    let mut cur = Cursor { buf: blob, pos: 0 };

    if cur.take(MAGIC.len())? != MAGIC {
        return Err(ImagerError::Build(
            "no boot parameters found (bad magic)".to_string(),
        ));
    }
    let version = cur.byte()?;
    if version != FORMAT_VERSION {
        return Err(ImagerError::Build(format!(
            "unsupported boot parameter version {}",
            version
        )));
    }
    let mode_byte = cur.byte()?;
    let mode = BootMode::from_byte(mode_byte)
        .ok_or_else(|| ImagerError::Build(format!("unknown boot mode {}", mode_byte)))?;

    let mut raw_index = [0u8; 4];
    raw_index.copy_from_slice(cur.take(4)?);
    let index = index_from_wire(u32::from_le_bytes(raw_index));

    let local_ip = cur.ip()?;
    let gateway_ip = cur.ip()?;
    let secret = cur.key()?;

    let count = cur.byte()? as usize;
    let mut hypervisor_pks = Vec::with_capacity(count);
    for _ in 0..count {
        hypervisor_pks.push(hex::encode(cur.key()?));
    }

    let passcode = cur.short_str("passcode")?;
    let hostname = cur.short_str("hostname")?;

    let payload_end = cur.pos;
    let stored = cur.take(CHECKSUM_LEN)?;
    let computed = Sha256::digest(&blob[..payload_end]);
    if stored != &computed[..CHECKSUM_LEN] {
        return Err(ImagerError::Build(
            "boot parameter checksum does not match".to_string(),
        ));
    }

    if index.mode() != mode {
        return Err(ImagerError::Build(format!(
            "boot mode {:?} does not match index {}",
            mode, index
        )));
    }

    let key = SigningKey::from_bytes(&secret);
    Ok(BootParams {
        index,
        mode,
        local_ip,
        gateway_ip,
        hostname,
        passcode,
        secret_key: hex::encode(secret),
        public_key: hex::encode(key.verifying_key().to_bytes()),
        hypervisor_pks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootparams::generate;
    use crate::models::BuildConfig;

    fn sample() -> Vec<BootParams> {
        let cfg = BuildConfig::new("/tmp/w", "latest")
            .with_visors(2)
            .with_passcode("secret")
            .with_key_seed("abcdef");
        generate(&cfg).unwrap()
    }

    #[test]
    fn test_region_layout_constants() {
        assert_eq!(REGION_LEN, 222);
        assert_eq!(BOOT_PARAMS_OFFSET + REGION_LEN, 0x1BE);
    }

    #[test]
    fn test_encoded_blob_fills_region() {
        for params in sample() {
            let blob = encode(&params).unwrap();
            assert_eq!(blob.len(), REGION_LEN);
            assert_eq!(&blob[..4], MAGIC);
            assert_eq!(decode(&blob).unwrap(), params);
        }
    }

    #[test]
    fn test_flipped_byte_rejected() {
        let params = &sample()[0];
        let mut blob = encode(params).unwrap();
        blob[12] ^= 0xFF;
        assert!(matches!(decode(&blob), Err(ImagerError::Build(msg)) if msg.contains("checksum")));
    }

    #[test]
    fn test_bad_magic_and_version() {
        let params = &sample()[0];
        let mut blob = encode(params).unwrap();
        blob[0] = b'X';
        assert!(decode(&blob).is_err());

        let mut blob = encode(params).unwrap();
        blob[4] = 9;
        assert!(decode(&blob).is_err());

        assert!(decode(&[0u8; 10]).is_err());
        assert!(decode(&[0u8; REGION_LEN]).is_err());
    }

    #[test]
    fn test_oversized_hostname_rejected() {
        let mut params = sample()[0].clone();
        params.hostname = "h".repeat(200);
        assert!(matches!(encode(&params), Err(ImagerError::Build(_))));
    }

    #[test]
    fn test_hypervisor_index_wire_value() {
        assert_eq!(index_to_wire(BootIndex::Hypervisor), u32::MAX);
        assert_eq!(index_from_wire(u32::MAX), BootIndex::Hypervisor);
        assert_eq!(index_from_wire(3), BootIndex::Visor(3));
    }
}
