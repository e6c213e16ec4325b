//! InstrumentationInstance status persistence
//!
//! Agents self-report identifying attributes and health. Each process gets
//! one InstrumentationInstance named `<pod>-<pid>`, owned by its pod, so
//! external tooling can describe what is running where.

use crate::connection::ConnectionInfo;
use crate::crd::{
    Attribute, InstrumentationInstance, InstrumentationInstanceSpec,
    InstrumentationInstanceStatus, InstrumentationLibraryStatus,
};
use crate::proto::{AgentToServer, ComponentHealth};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Instances allowed per pod before creation is refused
pub const MAX_INSTANCES_PER_POD: usize = 16;

pub const LABEL_INSTRUMENTED_APP: &str = "instrumented-app";
pub const LABEL_OWNER_POD: &str = "odigos.io/pod-name";

pub const REASON_NO_HEARTBEAT: &str = "NoHeartbeat";
const REASON_INSTRUMENTATION_DETAILS: &str = "instrumentation.details";
const LIBRARY_TYPE_INSTRUMENTATION: &str = "instrumentation";

/// Which instance a status update is for
#[derive(Debug, Clone)]
pub struct InstanceTarget {
    pub pod: Pod,
    pub container_name: String,
    pub instrumented_app_name: String,
    pub pid: i64,
}

impl InstanceTarget {
    pub fn from_connection(info: &ConnectionInfo) -> Self {
        Self {
            pod: info.pod.clone(),
            container_name: info.container_name.clone(),
            instrumented_app_name: info.instrumented_app_name.clone(),
            pid: info.pid,
        }
    }

    pub fn pod_name(&self) -> &str {
        self.pod.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.pod.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// `<pod>-<pid>`
    pub fn instance_name(&self) -> String {
        format!("{}-{}", self.pod_name(), self.pid)
    }
}

/// Fields to overwrite in an instance status; `None` leaves a field as is
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub identifying_attributes: Option<Vec<Attribute>>,
    pub healthy: Option<bool>,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub components: Option<Vec<InstrumentationLibraryStatus>>,
}

impl StatusUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn no_heartbeat() -> Self {
        Self {
            healthy: Some(false),
            reason: Some(REASON_NO_HEARTBEAT.to_string()),
            message: Some("Agent stopped sending heartbeats".to_string()),
            ..Default::default()
        }
    }

    /// Merge into an existing status, stamping the update time
    pub fn apply_to(self, status: &mut InstrumentationInstanceStatus, now: &str) {
        if let Some(attrs) = self.identifying_attributes {
            status.identifying_attributes = attrs;
        }
        if let Some(healthy) = self.healthy {
            status.healthy = Some(healthy);
        }
        if let Some(reason) = self.reason {
            status.reason = reason;
        }
        if let Some(message) = self.message {
            status.message = message;
        }
        if let Some(components) = self.components {
            status.components = components;
        }
        status.last_status_time = Some(now.to_string());
    }
}

/// Status fields carried by an agent message, if any
pub fn status_update_from_message(message: &AgentToServer, now: &str) -> StatusUpdate {
    let mut update = StatusUpdate::default();

    if let Some(description) = &message.agent_description {
        update.identifying_attributes = Some(
            description
                .identifying_attributes
                .iter()
                .map(|kv| Attribute {
                    key: kv.key.clone(),
                    value: kv
                        .value
                        .as_ref()
                        .map(|v| v.to_display_string())
                        .unwrap_or_default(),
                })
                .collect(),
        );
    }

    // Health is only sent when it changes, so its presence is a new status
    if let Some(health) = &message.health {
        update.healthy = Some(health.healthy);
        update.reason = Some(health.status.clone());
        update.message = Some(health.last_error.clone());

        if !health.component_health_map.is_empty() {
            update.components = Some(component_statuses(health, now));
        }
    }

    update
}

fn component_statuses(health: &ComponentHealth, now: &str) -> Vec<InstrumentationLibraryStatus> {
    let mut names: Vec<&String> = health.component_health_map.keys().collect();
    names.sort();

    names
        .into_iter()
        .map(|name| {
            let component = &health.component_health_map[name];
            let mut status = InstrumentationLibraryStatus {
                name: name.clone(),
                library_type: LIBRARY_TYPE_INSTRUMENTATION.to_string(),
                healthy: Some(component.healthy),
                last_status_time: Some(now.to_string()),
                ..Default::default()
            };

            if !component.status.is_empty() {
                match parse_status_object(&component.status) {
                    Some(attrs) => status.non_identifying_attributes = attrs,
                    None => {
                        status.reason = REASON_INSTRUMENTATION_DETAILS.to_string();
                        status.message = component.status.clone();
                    }
                }
            }
            status
        })
        .collect()
}

/// A component status that is a JSON object becomes key/value attributes
fn parse_status_object(raw: &str) -> Option<Vec<Attribute>> {
    let parsed: BTreeMap<String, serde_json::Value> = serde_json::from_str(raw).ok()?;
    Some(
        parsed
            .into_iter()
            .map(|(key, value)| Attribute {
                key,
                value: match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                },
            })
            .collect(),
    )
}

#[async_trait]
pub trait StatusWriter: Send + Sync {
    /// Create the instance if needed and merge `update` into its status
    async fn persist(&self, target: &InstanceTarget, update: StatusUpdate) -> Result<()>;

    /// Delete the instance; a missing instance is not an error
    async fn delete(&self, target: &InstanceTarget) -> Result<()>;
}

/// [`StatusWriter`] backed by the Kubernetes API
pub struct KubeStatusWriter {
    client: Client,
    timeout: Duration,
}

impl KubeStatusWriter {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn api(&self, namespace: &str) -> Api<InstrumentationInstance> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_or_create(&self, target: &InstanceTarget) -> Result<InstrumentationInstance> {
        let api = self.api(target.namespace());
        let name = target.instance_name();

        if let Some(existing) = api.get_opt(&name).await? {
            return Ok(existing);
        }

        let selector = format!("{}={}", LABEL_OWNER_POD, target.pod_name());
        let existing = api.list(&ListParams::default().labels(&selector)).await?;
        if existing.items.len() >= MAX_INSTANCES_PER_POD {
            bail!(
                "pod {}/{} already has {} instrumentation instances",
                target.namespace(),
                target.pod_name(),
                existing.items.len()
            );
        }

        let instance = new_instance(target)?;
        debug!(instance = %name, "Creating instrumentation instance");
        Ok(api.create(&PostParams::default(), &instance).await?)
    }
}

fn new_instance(target: &InstanceTarget) -> Result<InstrumentationInstance> {
    let pod_uid = target
        .pod
        .metadata
        .uid
        .clone()
        .context("pod has no uid")?;

    let mut instance = InstrumentationInstance::new(
        &target.instance_name(),
        InstrumentationInstanceSpec {
            container_name: target.container_name.clone(),
        },
    );
    instance.metadata = ObjectMeta {
        name: Some(target.instance_name()),
        namespace: Some(target.namespace().to_string()),
        labels: Some(BTreeMap::from([
            (
                LABEL_INSTRUMENTED_APP.to_string(),
                target.instrumented_app_name.clone(),
            ),
            (LABEL_OWNER_POD.to_string(), target.pod_name().to_string()),
        ])),
        owner_references: Some(vec![OwnerReference {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            name: target.pod_name().to_string(),
            uid: pod_uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]),
        ..Default::default()
    };
    Ok(instance)
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn persist(&self, target: &InstanceTarget, update: StatusUpdate) -> Result<()> {
        let write = async move {
            let instance = self.get_or_create(target).await?;
            let mut status = instance.status.unwrap_or_default();
            update.apply_to(&mut status, &chrono::Utc::now().to_rfc3339());

            self.api(target.namespace())
                .patch_status(
                    &target.instance_name(),
                    &PatchParams::default(),
                    &Patch::Merge(json!({ "status": status })),
                )
                .await?;
            Ok::<_, anyhow::Error>(())
        };

        tokio::time::timeout(self.timeout, write)
            .await
            .context("Timed out writing instrumentation instance status")?
            .with_context(|| format!("Failed to persist status for {}", target.instance_name()))
    }

    async fn delete(&self, target: &InstanceTarget) -> Result<()> {
        let api = self.api(target.namespace());
        let name = target.instance_name();

        let result = tokio::time::timeout(self.timeout, api.delete(&name, &DeleteParams::default()))
            .await
            .context("Timed out deleting instrumentation instance")?;

        match result {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete instance {name}")),
        }
    }
}
