//! Server-resolved resource attributes

use crate::models::{ResourceAttribute, WorkloadIdentity, WorkloadKind};

pub const SERVICE_NAME: &str = "service.name";
pub const K8S_NAMESPACE_NAME: &str = "k8s.namespace.name";
pub const K8S_POD_NAME: &str = "k8s.pod.name";
pub const K8S_CONTAINER_NAME: &str = "k8s.container.name";
pub const K8S_NODE_NAME: &str = "k8s.node.name";

/// Attributes the agent cannot discover from inside its container
pub fn server_resource_attributes(
    identity: &WorkloadIdentity,
    node_name: &str,
) -> Vec<ResourceAttribute> {
    let mut attributes = vec![
        ResourceAttribute::new(SERVICE_NAME, &identity.service_name),
        ResourceAttribute::new(K8S_NAMESPACE_NAME, &identity.namespace),
        ResourceAttribute::new(K8S_POD_NAME, &identity.pod_name),
        ResourceAttribute::new(K8S_CONTAINER_NAME, &identity.container_name),
        ResourceAttribute::new(K8S_NODE_NAME, node_name),
    ];

    if identity.workload_kind != WorkloadKind::Pod {
        attributes.push(ResourceAttribute::new(
            format!("k8s.{}.name", identity.workload_kind.lowercase()),
            &identity.workload_name,
        ));
    }

    attributes
}

/// Copy of `attributes` with `service.name` set to `service_name`
pub fn with_service_name(
    attributes: &[ResourceAttribute],
    service_name: &str,
) -> Vec<ResourceAttribute> {
    let mut updated: Vec<ResourceAttribute> = attributes
        .iter()
        .filter(|a| a.key != SERVICE_NAME)
        .cloned()
        .collect();
    updated.insert(0, ResourceAttribute::new(SERVICE_NAME, service_name));
    updated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(kind: WorkloadKind) -> WorkloadIdentity {
        WorkloadIdentity {
            namespace: "default".to_string(),
            workload_kind: kind,
            workload_name: "checkout".to_string(),
            pod_name: "checkout-abc".to_string(),
            container_name: "app".to_string(),
            service_name: "checkout".to_string(),
        }
    }

    #[test]
    fn test_deployment_attributes() {
        let attrs = server_resource_attributes(&identity(WorkloadKind::Deployment), "node-a");
        let find = |k: &str| attrs.iter().find(|a| a.key == k).map(|a| a.value.as_str());

        assert_eq!(find(SERVICE_NAME), Some("checkout"));
        assert_eq!(find(K8S_NAMESPACE_NAME), Some("default"));
        assert_eq!(find(K8S_POD_NAME), Some("checkout-abc"));
        assert_eq!(find(K8S_CONTAINER_NAME), Some("app"));
        assert_eq!(find(K8S_NODE_NAME), Some("node-a"));
        assert_eq!(find("k8s.deployment.name"), Some("checkout"));
    }

    #[test]
    fn test_bare_pod_has_no_workload_attribute() {
        let attrs = server_resource_attributes(&identity(WorkloadKind::Pod), "node-a");
        assert_eq!(attrs.len(), 5);
        assert!(!attrs.iter().any(|a| a.key == "k8s.pod.name" && a.value == "checkout"));
    }

    #[test]
    fn test_with_service_name_replaces_single_entry() {
        let attrs = server_resource_attributes(&identity(WorkloadKind::StatefulSet), "node-a");
        let renamed = with_service_name(&attrs, "checkout-api");

        assert_eq!(renamed.len(), attrs.len());
        let names: Vec<&str> = renamed
            .iter()
            .filter(|a| a.key == SERVICE_NAME)
            .map(|a| a.value.as_str())
            .collect();
        assert_eq!(names, vec!["checkout-api"]);
        assert!(renamed.iter().any(|a| a.key == "k8s.statefulset.name"));
    }
}
