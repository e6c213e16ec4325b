//! Kubelet pod-resources client
//!
//! The kubelet exposes every device allocated to every container on the node
//! over a local unix socket. There is no single-device query, so each call
//! produces a full device id -> container snapshot.

use super::AllocationLister;
use crate::models::{ContainerDetails, DeviceId};
use crate::proto::podresources::v1::{ListPodResourcesRequest, ListPodResourcesResponse};
use crate::proto::PodResourcesListerClient;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info};

/// Default location of the kubelet pod-resources socket
pub const DEFAULT_POD_RESOURCES_SOCKET: &str = "/var/lib/kubelet/pod-resources/kubelet.sock";

/// Prefix of the extended resource names owned by this system
pub const DEFAULT_RESOURCE_NAME_PREFIX: &str = "instrumentation.odigos.io/";

/// Configuration for the kubelet client
#[derive(Debug, Clone)]
pub struct KubeletConfig {
    pub socket_path: PathBuf,
    pub resource_name_prefix: String,
    pub connect_timeout: Duration,
    pub list_timeout: Duration,
}

impl Default for KubeletConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_POD_RESOURCES_SOCKET),
            resource_name_prefix: DEFAULT_RESOURCE_NAME_PREFIX.to_string(),
            connect_timeout: Duration::from_secs(5),
            list_timeout: Duration::from_secs(5),
        }
    }
}

/// Long-lived pod-resources client shared by all sessions
pub struct KubeletPodResources {
    client: PodResourcesListerClient<Channel>,
    config: KubeletConfig,
}

impl KubeletPodResources {
    /// Connect to the kubelet socket.
    ///
    /// Fails if the socket is unreachable; callers treat this as fatal at startup.
    pub async fn connect(config: KubeletConfig) -> Result<Self> {
        let channel = channel_for_unix_socket(&config.socket_path, config.connect_timeout)
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to kubelet pod-resources socket {}",
                    config.socket_path.display()
                )
            })?;

        info!(socket = %config.socket_path.display(), "Connected to kubelet pod-resources");

        Ok(Self {
            client: PodResourcesListerClient::new(channel),
            config,
        })
    }
}

#[async_trait]
impl AllocationLister for KubeletPodResources {
    async fn list_allocations(&self) -> Result<HashMap<DeviceId, ContainerDetails>> {
        // The generated client needs &mut self; channels are cheap to clone.
        let mut client = self.client.clone();
        let response = tokio::time::timeout(
            self.config.list_timeout,
            client.list(ListPodResourcesRequest {}),
        )
        .await
        .context("Timed out listing pod resources")?
        .context("Failed to list pod resources")?;

        let snapshot = snapshot_from_response(
            response.into_inner(),
            &self.config.resource_name_prefix,
        );
        debug!(devices = snapshot.len(), "Listed device allocations");
        Ok(snapshot)
    }
}

/// Keep only devices whose resource name belongs to this system
pub fn snapshot_from_response(
    response: ListPodResourcesResponse,
    resource_name_prefix: &str,
) -> HashMap<DeviceId, ContainerDetails> {
    let mut snapshot = HashMap::new();

    for pod in response.pod_resources {
        let containers_in_pod = pod.containers.len();
        for container in &pod.containers {
            for device in &container.devices {
                if !device.resource_name.starts_with(resource_name_prefix) {
                    continue;
                }
                for device_id in &device.device_ids {
                    snapshot.insert(
                        device_id.clone(),
                        ContainerDetails {
                            pod_name: pod.name.clone(),
                            pod_namespace: pod.namespace.clone(),
                            container_name: container.name.clone(),
                            containers_in_pod,
                        },
                    );
                }
            }
        }
    }

    snapshot
}

async fn channel_for_unix_socket(path: &Path, connect_timeout: Duration) -> Result<Channel> {
    let path = path.to_path_buf();
    // The URI is ignored by the connector; tonic just needs a valid one.
    let channel = Endpoint::try_from("http://[::]:50051")?
        .connect_timeout(connect_timeout)
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move { UnixStream::connect(path).await }
        }))
        .await?;
    Ok(channel)
}
