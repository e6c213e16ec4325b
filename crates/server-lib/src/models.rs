//! Core data models for the control plane

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Opaque per-container handle issued by the node device-plugin framework.
///
/// Scoped to one container's resource claim; not stable across restarts.
pub type DeviceId = String;

/// Container identity as reported by the kubelet pod-resources listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDetails {
    pub pod_name: String,
    pub pod_namespace: String,
    pub container_name: String,
    pub containers_in_pod: usize,
}

/// Kind of the controller that owns a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    Job,
    CronJob,
    Pod,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::Job => "Job",
            WorkloadKind::CronJob => "CronJob",
            WorkloadKind::Pod => "Pod",
        }
    }

    /// Lowercase form used in resource names and attribute keys
    pub fn lowercase(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::StatefulSet => "statefulset",
            WorkloadKind::DaemonSet => "daemonset",
            WorkloadKind::Job => "job",
            WorkloadKind::CronJob => "cronjob",
            WorkloadKind::Pod => "pod",
        }
    }

    pub fn from_lowercase(s: &str) -> Option<Self> {
        match s {
            "deployment" => Some(WorkloadKind::Deployment),
            "statefulset" => Some(WorkloadKind::StatefulSet),
            "daemonset" => Some(WorkloadKind::DaemonSet),
            "job" => Some(WorkloadKind::Job),
            "cronjob" => Some(WorkloadKind::CronJob),
            "pod" => Some(WorkloadKind::Pod),
            _ => None,
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A controller object (or bare pod) that owns running pods
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodWorkload {
    pub namespace: String,
    pub kind: WorkloadKind,
    pub name: String,
}

impl PodWorkload {
    /// Name of the per-workload instrumentation resources, e.g. `deployment-checkout`
    pub fn instrumented_app_name(&self) -> String {
        format!("{}-{}", self.kind.lowercase(), self.name)
    }

    /// Inverse of [`PodWorkload::instrumented_app_name`]
    pub fn from_instrumented_app_name(namespace: &str, app_name: &str) -> Option<Self> {
        let (kind, name) = app_name.split_once('-')?;
        if name.is_empty() {
            return None;
        }
        Some(Self {
            namespace: namespace.to_string(),
            kind: WorkloadKind::from_lowercase(kind)?,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for PodWorkload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

/// Resolved identity of an instrumented container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadIdentity {
    pub namespace: String,
    pub workload_kind: WorkloadKind,
    pub workload_name: String,
    pub pod_name: String,
    pub container_name: String,
    /// Filled per connection, never cached
    pub service_name: String,
}

impl WorkloadIdentity {
    pub fn workload(&self) -> PodWorkload {
        PodWorkload {
            namespace: self.namespace.clone(),
            kind: self.workload_kind,
            name: self.workload_name.clone(),
        }
    }
}

/// A single key/value resource attribute pushed to an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAttribute {
    pub key: String,
    pub value: String,
}

impl ResourceAttribute {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Observability signal kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObservabilitySignal {
    Traces,
    Metrics,
    Logs,
}

/// Which signals the node collector currently receives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnabledSignals {
    pub traces: bool,
    pub metrics: bool,
    pub logs: bool,
}

impl EnabledSignals {
    pub fn from_signals(signals: &[ObservabilitySignal]) -> Self {
        Self {
            traces: signals.contains(&ObservabilitySignal::Traces),
            metrics: signals.contains(&ObservabilitySignal::Metrics),
            logs: signals.contains(&ObservabilitySignal::Logs),
        }
    }
}

/// Deserialize `null` as an empty list
pub(crate) fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instrumented_app_name_round_trip() {
        let workload = PodWorkload {
            namespace: "default".to_string(),
            kind: WorkloadKind::Deployment,
            name: "checkout-v2".to_string(),
        };

        let name = workload.instrumented_app_name();
        assert_eq!(name, "deployment-checkout-v2");

        let parsed = PodWorkload::from_instrumented_app_name("default", &name).unwrap();
        assert_eq!(parsed, workload);
    }

    #[test]
    fn test_instrumented_app_name_rejects_unknown_kind() {
        assert!(PodWorkload::from_instrumented_app_name("default", "rollout-web").is_none());
        assert!(PodWorkload::from_instrumented_app_name("default", "deployment-").is_none());
        assert!(PodWorkload::from_instrumented_app_name("default", "nodash").is_none());
    }

    #[test]
    fn test_enabled_signals_from_list() {
        let signals = EnabledSignals::from_signals(&[ObservabilitySignal::Traces]);
        assert!(signals.traces);
        assert!(!signals.metrics);
        assert!(!signals.logs);
    }

    #[test]
    fn test_signal_serde_names() {
        let json = serde_json::to_string(&ObservabilitySignal::Traces).unwrap();
        assert_eq!(json, "\"TRACES\"");
    }
}
