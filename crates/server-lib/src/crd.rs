//! Custom resources consumed and written by the control plane
//!
//! - `CollectorsGroup`: which signals the node collector currently receives
//! - `Destination`: a telemetry backend and the signals it accepts
//! - `InstrumentationConfig`: per-workload library settings and service name
//! - `InstrumentationInstance`: per-process status written by this server

use crate::models::ObservabilitySignal;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "odigos.io",
    version = "v1alpha1",
    kind = "CollectorsGroup",
    namespaced,
    status = "CollectorsGroupStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct CollectorsGroupSpec {
    #[serde(default)]
    pub role: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CollectorsGroupStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub receiver_signals: Vec<ObservabilitySignal>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "odigos.io",
    version = "v1alpha1",
    kind = "Destination",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DestinationSpec {
    #[serde(default, rename = "type")]
    pub destination_type: String,
    #[serde(default)]
    pub destination_name: String,
    #[serde(default)]
    pub signals: Vec<ObservabilitySignal>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "odigos.io",
    version = "v1alpha1",
    kind = "InstrumentationConfig",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentationConfigSpec {
    /// Overrides the workload name as `service.name` when set
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_name: String,
    #[serde(default)]
    pub sdk_configs: Vec<SdkConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SdkConfig {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub instrumentation_library_configs: Vec<InstrumentationLibraryConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentationLibraryConfig {
    #[serde(default)]
    pub library_id: InstrumentationLibraryId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_config: Option<InstrumentationLibraryConfigTraces>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentationLibraryId {
    #[serde(default)]
    pub library_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_kind: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct InstrumentationLibraryConfigTraces {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl InstrumentationConfigSpec {
    /// The sdk config for a programming language, if one is configured
    pub fn sdk_config_for(&self, language: &str) -> Option<&SdkConfig> {
        self.sdk_configs
            .iter()
            .find(|c| c.language.eq_ignore_ascii_case(language))
    }
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "odigos.io",
    version = "v1alpha1",
    kind = "InstrumentationInstance",
    namespaced,
    status = "InstrumentationInstanceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentationInstanceSpec {
    #[serde(default)]
    pub container_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentationInstanceStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifying_attributes: Vec<Attribute>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_identifying_attributes: Vec<Attribute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<InstrumentationLibraryStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status_time: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct Attribute {
    pub key: String,
    pub value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentationLibraryStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub library_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_identifying_attributes: Vec<Attribute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status_time: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instrumentation_config_missing_lists_default_empty() {
        let json = r#"{
            "apiVersion": "odigos.io/v1alpha1",
            "kind": "InstrumentationConfig",
            "metadata": {"name": "deployment-checkout", "namespace": "default"},
            "spec": {
                "serviceName": "checkout-svc",
                "sdkConfigs": [
                    {"language": "java"},
                    {"language": "python", "instrumentationLibraryConfigs": [
                        {"libraryId": {"libraryName": "flask"}, "traceConfig": {"enabled": false}}
                    ]}
                ]
            }
        }"#;

        let ic: InstrumentationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(ic.spec.service_name, "checkout-svc");
        assert!(ic
            .spec
            .sdk_config_for("java")
            .unwrap()
            .instrumentation_library_configs
            .is_empty());

        let python = ic.spec.sdk_config_for("python").unwrap();
        assert_eq!(
            python.instrumentation_library_configs[0].library_id.library_name,
            "flask"
        );
    }

    #[test]
    fn test_collectors_group_status_signals() {
        let json = r#"{
            "apiVersion": "odigos.io/v1alpha1",
            "kind": "CollectorsGroup",
            "metadata": {"name": "odigos-data-collection", "namespace": "odigos-system"},
            "spec": {"role": "NODE_COLLECTOR"},
            "status": {"ready": true, "receiverSignals": ["TRACES", "LOGS"]}
        }"#;

        let cg: CollectorsGroup = serde_json::from_str(json).unwrap();
        let status = cg.status.unwrap();
        assert_eq!(
            status.receiver_signals,
            vec![ObservabilitySignal::Traces, ObservabilitySignal::Logs]
        );
    }
}
