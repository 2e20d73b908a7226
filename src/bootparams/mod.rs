//! Boot parameter generation.
//!
//! Turns one [`BuildConfig`] into the per-image parameter sets: one per visor,
//! then the hypervisor last. Generation is pure; the same config always
//! yields the same addresses, hostnames and keys.

pub mod codec;

use crate::config::validator;
use crate::error::ImagerError;
use crate::models::{BootIndex, BootParams, BuildConfig};
use ed25519_dalek::SigningKey;
use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;

/// Domain separation tag mixed into every derived key.
const KEY_DERIVATION_TAG: &[u8] = b"skyimager/boot-key/v1";

pub const VISOR_HOSTNAME_PREFIX: &str = "skybian-visor-";
pub const HYPERVISOR_HOSTNAME: &str = "skybian-hypervisor";

/// Generate boot parameters for every image the config asks for.
pub fn generate(config: &BuildConfig) -> Result<Vec<BootParams>, ImagerError> {
    if config.unit_count() == 0 {
        return Ok(Vec::new());
    }

    let gateway = config.gateway_ip.ok_or_else(|| {
        ImagerError::InvalidConfig("gateway IP is required to build images".to_string())
    })?;
    validator::validate_gateway(gateway)?;
    validator::validate_address_range(gateway, config.visors, config.hypervisor)?;

    let seed = hex::decode(&config.key_seed)
        .map_err(|e| ImagerError::InvalidConfig(format!("key seed is not valid hex: {}", e)))?;

    let hypervisor_key = config
        .hypervisor
        .then(|| derive_key(&seed, gateway, &config.passcode, BootIndex::Hypervisor));
    let trusted: Vec<String> = hypervisor_key
        .iter()
        .map(|k| hex::encode(k.verifying_key().to_bytes()))
        .collect();

    let mut params = Vec::with_capacity(config.unit_count() as usize);
    for i in 0..config.visors {
        let index = BootIndex::Visor(i);
        let key = derive_key(&seed, gateway, &config.passcode, index);
        params.push(entry(
            index,
            address_for(gateway, index),
            gateway,
            &config.passcode,
            &key,
            trusted.clone(),
        ));
    }

    if let Some(key) = hypervisor_key {
        let index = BootIndex::Hypervisor;
        params.push(entry(
            index,
            address_for(gateway, index),
            gateway,
            &config.passcode,
            &key,
            Vec::new(),
        ));
    }

    log::debug!(
        "[Params] Generated {} boot parameter sets for gateway {}",
        params.len(),
        gateway
    );
    Ok(params)
}

/// Pretty JSON for display before the build is committed.
pub fn render(params: &[BootParams]) -> Result<String, ImagerError> {
    serde_json::to_string_pretty(params)
        .map_err(|e| ImagerError::Internal(format!("failed to render boot parameters: {}", e)))
}

pub fn hostname_for(index: BootIndex) -> String {
    match index {
        BootIndex::Visor(i) => format!("{}{}", VISOR_HOSTNAME_PREFIX, i),
        BootIndex::Hypervisor => HYPERVISOR_HOSTNAME.to_string(),
    }
}

/// Hypervisor sits right after the gateway; visors follow it.
pub fn address_for(gateway: Ipv4Addr, index: BootIndex) -> Ipv4Addr {
    let offset = match index {
        BootIndex::Hypervisor => 1,
        BootIndex::Visor(i) => 2 + i,
    };
    Ipv4Addr::from(u32::from(gateway).wrapping_add(offset))
}

fn entry(
    index: BootIndex,
    local_ip: Ipv4Addr,
    gateway_ip: Ipv4Addr,
    passcode: &str,
    key: &SigningKey,
    hypervisor_pks: Vec<String>,
) -> BootParams {
    BootParams {
        index,
        mode: index.mode(),
        local_ip,
        gateway_ip,
        hostname: hostname_for(index),
        passcode: passcode.to_string(),
        secret_key: hex::encode(key.to_bytes()),
        public_key: hex::encode(key.verifying_key().to_bytes()),
        hypervisor_pks,
    }
}

fn derive_key(seed: &[u8], gateway: Ipv4Addr, passcode: &str, index: BootIndex) -> SigningKey {
    let mut hasher = Sha256::new();
    hasher.update(KEY_DERIVATION_TAG);
    hasher.update((seed.len() as u32).to_le_bytes());
    hasher.update(seed);
    hasher.update(gateway.octets());
    hasher.update((passcode.len() as u32).to_le_bytes());
    hasher.update(passcode.as_bytes());
    hasher.update(codec::index_to_wire(index).to_le_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    SigningKey::from_bytes(&digest)
}
