//! Server configuration

use anyhow::{bail, Result};
use serde::Deserialize;
use std::time::Duration;

/// Server configuration, read from `OPAMP_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Namespace holding the collectors group and destinations
    #[serde(default = "default_odigos_namespace")]
    pub odigos_namespace: String,

    /// OpAMP listen port
    #[serde(default = "default_opamp_port")]
    pub opamp_port: u16,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Kubelet pod-resources unix socket
    #[serde(default = "default_pod_resources_socket")]
    pub pod_resources_socket: String,

    /// Device plugin resource names owned by this system
    #[serde(default = "default_resource_name_prefix")]
    pub resource_name_prefix: String,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_timeout")]
    pub kubelet_timeout_secs: u64,

    #[serde(default = "default_timeout")]
    pub kube_api_timeout_secs: u64,

    /// Node collectors group whose status lists the received signals
    #[serde(default = "default_collectors_group")]
    pub collectors_group_name: String,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_odigos_namespace() -> String {
    std::env::var("CURRENT_NS").unwrap_or_else(|_| "odigos-system".to_string())
}

fn default_opamp_port() -> u16 {
    4320
}

fn default_api_port() -> u16 {
    8080
}

fn default_pod_resources_socket() -> String {
    server_lib::deviceid::DEFAULT_POD_RESOURCES_SOCKET.to_string()
}

fn default_resource_name_prefix() -> String {
    server_lib::deviceid::DEFAULT_RESOURCE_NAME_PREFIX.to_string()
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_timeout() -> u64 {
    5
}

fn default_collectors_group() -> String {
    server_lib::cluster::NODE_COLLECTORS_GROUP_NAME.to_string()
}

impl ServerConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("OPAMP"))
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("kubelet_timeout_secs", self.kubelet_timeout_secs),
            ("kube_api_timeout_secs", self.kube_api_timeout_secs),
        ];
        for (name, value) in durations {
            if value == 0 {
                bail!("OPAMP_{} must be greater than zero", name.to_uppercase());
            }
        }
        if self.opamp_port == self.api_port {
            bail!("OpAMP and API servers cannot share port {}", self.opamp_port);
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn kubelet_timeout(&self) -> Duration {
        Duration::from_secs(self.kubelet_timeout_secs)
    }

    pub fn kube_api_timeout(&self) -> Duration {
        Duration::from_secs(self.kube_api_timeout_secs)
    }
}
