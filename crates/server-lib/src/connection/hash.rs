//! Remote config hashing

use crate::proto::{AgentConfigMap, AgentRemoteConfig};
use sha2::{Digest, Sha256};

/// SHA-256 over the section bodies, concatenated in section-name order.
///
/// `AgentConfigMap` keeps sections in a sorted map, so identical content
/// always hashes identically regardless of insertion order.
pub fn calc_config_hash(config: &AgentConfigMap) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for file in config.config_map.values() {
        hasher.update(&file.body);
    }
    hasher.finalize().to_vec()
}

/// Wrap a config map together with its hash
pub fn hashed_remote_config(config: AgentConfigMap) -> AgentRemoteConfig {
    let config_hash = calc_config_hash(&config);
    AgentRemoteConfig {
        config: Some(config),
        config_hash,
    }
}

/// Hex form used in logs
pub fn hash_hex(hash: &[u8]) -> String {
    hex::encode(hash)
}
