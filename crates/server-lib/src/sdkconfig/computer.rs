//! Remote config computation against live cluster state

use super::attributes::{server_resource_attributes, with_service_name};
use super::sections::{
    calc_libraries_config, calc_sdk_config, libraries_section, sdk_section, to_wire_sections,
    RemoteConfigInstrumentationLibrary,
};
use crate::cluster::ClusterReader;
use crate::connection::{hashed_remote_config, SectionUpdate};
use crate::crd::InstrumentationConfig;
use crate::error::ConfigError;
use crate::models::{EnabledSignals, PodWorkload, ResourceAttribute, WorkloadIdentity};
use crate::proto::{AgentConfigMap, AgentRemoteConfig};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// Complete config for a new connection
#[derive(Debug, Clone)]
pub struct FullConfig {
    pub remote_config: AgentRemoteConfig,
    pub resource_attributes: Vec<ResourceAttribute>,
    /// Signal set the SDK section was built from
    pub signals: EnabledSignals,
}

/// Builds remote config documents.
///
/// The node collector's receiver signals are remembered between reconciles;
/// everything else is read live.
pub struct RemoteConfigComputer {
    cluster: Arc<dyn ClusterReader>,
    node_name: String,
    signals: RwLock<Option<EnabledSignals>>,
}

impl RemoteConfigComputer {
    pub fn new(cluster: Arc<dyn ClusterReader>, node_name: impl Into<String>) -> Self {
        Self {
            cluster,
            node_name: node_name.into(),
            signals: RwLock::new(None),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Remembered signals, if any reconcile or handshake has read them
    pub fn cached_signals(&self) -> Option<EnabledSignals> {
        *self.signals.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remembered signals, reading the collectors group on first use
    pub async fn current_signals(&self) -> Result<EnabledSignals, ConfigError> {
        if let Some(signals) = self.cached_signals() {
            return Ok(signals);
        }
        let signals = self.read_signals().await?;
        self.set_signals(signals);
        Ok(signals)
    }

    /// Read the collectors group without touching the remembered value
    pub async fn read_signals(&self) -> Result<EnabledSignals, ConfigError> {
        let received = self
            .cluster
            .node_receiver_signals()
            .await
            .map_err(ConfigError::Cluster)?;
        Ok(EnabledSignals::from_signals(&received))
    }

    /// Remember `signals`; returns true if they differ from the previous value
    pub fn set_signals(&self, signals: EnabledSignals) -> bool {
        let mut current = self.signals.write().unwrap_or_else(PoisonError::into_inner);
        let changed = *current != Some(signals);
        if changed {
            info!(
                traces = signals.traces,
                metrics = signals.metrics,
                logs = signals.logs,
                "Node collector signals changed"
            );
        }
        *current = Some(signals);
        changed
    }

    pub fn resource_attributes(&self, identity: &WorkloadIdentity) -> Vec<ResourceAttribute> {
        server_resource_attributes(identity, &self.node_name)
    }

    /// Libraries configured for a workload and language
    pub async fn calc_libraries_config(
        &self,
        workload: &PodWorkload,
        language: &str,
    ) -> Result<Vec<RemoteConfigInstrumentationLibrary>, ConfigError> {
        let config = self
            .cluster
            .get_instrumentation_config(&workload.namespace, &workload.instrumented_app_name())
            .await
            .map_err(ConfigError::Cluster)?;
        Ok(calc_libraries_config(config.as_ref(), language))
    }

    /// Everything a new connection needs in its handshake response
    pub async fn build_full_config(
        &self,
        identity: &WorkloadIdentity,
        language: &str,
    ) -> Result<FullConfig, ConfigError> {
        let signals = self.current_signals().await?;
        let resource_attributes = self.resource_attributes(identity);
        let libraries = self
            .calc_libraries_config(&identity.workload(), language)
            .await?;

        let sdk = calc_sdk_config(&resource_attributes, signals);
        let config = AgentConfigMap {
            config_map: to_wire_sections(&sdk, &libraries)?,
        };
        let remote_config = hashed_remote_config(config);

        debug!(
            workload = %identity.workload(),
            libraries = libraries.len(),
            "Built full remote config"
        );

        Ok(FullConfig {
            remote_config,
            resource_attributes,
            signals,
        })
    }

    /// SDK section for a connection's current attributes
    pub fn sdk_update(
        resource_attributes: &[ResourceAttribute],
        signals: EnabledSignals,
    ) -> Result<SectionUpdate, ConfigError> {
        let sdk = calc_sdk_config(resource_attributes, signals);
        Ok(SectionUpdate::new(BTreeMap::from([sdk_section(&sdk)?])))
    }

    /// Both sections after an instrumentation config change.
    ///
    /// A deleted config (`None`) resets the service name to the workload
    /// name and empties the library list.
    pub fn instrumentation_config_update(
        workload: &PodWorkload,
        config: Option<&InstrumentationConfig>,
        language: &str,
        resource_attributes: &[ResourceAttribute],
        signals: EnabledSignals,
    ) -> Result<SectionUpdate, ConfigError> {
        let service_name = config
            .map(|c| c.spec.service_name.as_str())
            .filter(|name| !name.is_empty())
            .unwrap_or(&workload.name);
        let attributes = with_service_name(resource_attributes, service_name);

        let sdk = calc_sdk_config(&attributes, signals);
        let libraries = calc_libraries_config(config, language);
        let sections = BTreeMap::from([sdk_section(&sdk)?, libraries_section(&libraries)?]);

        Ok(SectionUpdate::new(sections).with_resource_attributes(attributes))
    }
}
