//! Read access to cluster state
//!
//! Handlers and the config computer read Pods and custom resources through
//! [`ClusterReader`] so the Kubernetes API can be swapped out in tests.

use crate::crd::{CollectorsGroup, InstrumentationConfig};
use crate::models::ObservabilitySignal;
use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use std::time::Duration;
use tracing::warn;

/// Default name of the node collector's CollectorsGroup
pub const NODE_COLLECTORS_GROUP_NAME: &str = "odigos-data-collection";

#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// Fetch a Pod live from the API server
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    /// Fetch a workload's InstrumentationConfig.
    ///
    /// Returns `Ok(None)` when it does not exist or cannot be decoded.
    async fn get_instrumentation_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<InstrumentationConfig>>;

    /// Signals the node collector currently advertises as received
    async fn node_receiver_signals(&self) -> Result<Vec<ObservabilitySignal>>;
}

/// [`ClusterReader`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeClusterReader {
    client: Client,
    system_namespace: String,
    collectors_group_name: String,
    timeout: Duration,
}

impl KubeClusterReader {
    pub fn new(
        client: Client,
        system_namespace: impl Into<String>,
        collectors_group_name: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            system_namespace: system_namespace.into(),
            collectors_group_name: collectors_group_name.into(),
            timeout,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl ClusterReader for KubeClusterReader {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        tokio::time::timeout(self.timeout, pods.get(name))
            .await
            .with_context(|| format!("Timed out fetching pod {namespace}/{name}"))?
            .with_context(|| format!("Failed to fetch pod {namespace}/{name}"))
    }

    async fn get_instrumentation_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<InstrumentationConfig>> {
        let api: Api<InstrumentationConfig> = Api::namespaced(self.client.clone(), namespace);
        let result = tokio::time::timeout(self.timeout, api.get_opt(name))
            .await
            .with_context(|| {
                format!("Timed out fetching instrumentation config {namespace}/{name}")
            })?;

        match result {
            Ok(config) => Ok(config),
            Err(kube::Error::SerdeError(e)) => {
                warn!(
                    namespace = %namespace,
                    name = %name,
                    error = %e,
                    "Malformed instrumentation config, treating as unconfigured"
                );
                Ok(None)
            }
            Err(e) => Err(e).with_context(|| {
                format!("Failed to fetch instrumentation config {namespace}/{name}")
            }),
        }
    }

    async fn node_receiver_signals(&self) -> Result<Vec<ObservabilitySignal>> {
        let api: Api<CollectorsGroup> =
            Api::namespaced(self.client.clone(), &self.system_namespace);
        let group = tokio::time::timeout(self.timeout, api.get_opt(&self.collectors_group_name))
            .await
            .context("Timed out fetching node collectors group")?
            .context("Failed to fetch node collectors group")?;

        Ok(group
            .and_then(|g| g.status)
            .map(|s| s.receiver_signals)
            .unwrap_or_default())
    }
}
