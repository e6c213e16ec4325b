//! Per-process connection state

use super::hash::hash_hex;
use crate::ebpf::UnloadHandle;
use crate::models::{DeviceId, PodWorkload, ResourceAttribute};
use crate::proto::AgentRemoteConfig;
use k8s_openapi::api::core::v1::Pod;
use std::time::Instant;

/// State of one live agent connection.
///
/// Owned by [`super::ConnectionRegistry`]; every read hands out a clone.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub device_id: DeviceId,
    /// Agent instance uid; a different uid on the same device is a new session
    pub instance_uid: Vec<u8>,
    /// Pod as fetched at handshake time
    pub pod: Pod,
    pub pid: i64,
    pub programming_language: String,
    pub container_name: String,
    pub instrumented_app_name: String,
    pub workload: PodWorkload,
    pub remote_resource_attributes: Vec<ResourceAttribute>,
    pub agent_remote_config: AgentRemoteConfig,
    pub last_message_time: Instant,
    pub unload: Option<UnloadHandle>,
}

impl ConnectionInfo {
    pub fn pod_name(&self) -> &str {
        self.pod.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.pod
            .metadata
            .namespace
            .as_deref()
            .unwrap_or(&self.workload.namespace)
    }

    pub fn config_hash(&self) -> &[u8] {
        &self.agent_remote_config.config_hash
    }

    pub fn config_hash_hex(&self) -> String {
        hash_hex(self.config_hash())
    }

    /// Value of a server-resolved resource attribute
    pub fn resource_attribute(&self, key: &str) -> Option<&str> {
        self.remote_resource_attributes
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value.as_str())
    }

    /// Detach instrumentation if a hook attached any
    pub fn run_unload(&self) {
        if let Some(handle) = &self.unload {
            handle.unload(self.pid);
        }
    }
}
