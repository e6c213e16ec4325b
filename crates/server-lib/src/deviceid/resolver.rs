//! Container -> workload identity resolution

use crate::cluster::ClusterReader;
use crate::error::IdentityError;
use crate::models::{ContainerDetails, PodWorkload, WorkloadIdentity, WorkloadKind};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::sync::Arc;
use tracing::debug;

const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

/// Resolves container details to the workload that owns them.
///
/// Nothing here is cached: pods and instrumentation configs are fetched on
/// every call so edits made between connects are always observed.
#[derive(Clone)]
pub struct WorkloadIdentityResolver {
    cluster: Arc<dyn ClusterReader>,
}

impl WorkloadIdentityResolver {
    pub fn new(cluster: Arc<dyn ClusterReader>) -> Self {
        Self { cluster }
    }

    /// Fetch the pod live and walk its owners to the top controller.
    ///
    /// The returned identity has `service_name` defaulted to the workload
    /// name; call [`Self::resolve_service_name`] for the effective value.
    pub async fn resolve(
        &self,
        details: &ContainerDetails,
    ) -> Result<(WorkloadIdentity, Pod), IdentityError> {
        let pod = self
            .cluster
            .get_pod(&details.pod_namespace, &details.pod_name)
            .await
            .map_err(IdentityError::KubeApi)?;

        let (workload_kind, workload_name) = workload_from_pod(&pod, &details.pod_name);
        debug!(
            pod = %details.pod_name,
            namespace = %details.pod_namespace,
            kind = %workload_kind,
            workload = %workload_name,
            "Resolved pod owner"
        );

        let identity = WorkloadIdentity {
            namespace: details.pod_namespace.clone(),
            workload_kind,
            service_name: workload_name.clone(),
            workload_name,
            pod_name: details.pod_name.clone(),
            container_name: details.container_name.clone(),
        };

        Ok((identity, pod))
    }

    /// Service name override from the workload's InstrumentationConfig,
    /// falling back to the workload name.
    pub async fn resolve_service_name(
        &self,
        workload: &PodWorkload,
    ) -> Result<String, IdentityError> {
        let config = self
            .cluster
            .get_instrumentation_config(&workload.namespace, &workload.instrumented_app_name())
            .await
            .map_err(IdentityError::KubeApi)?;

        Ok(config
            .map(|c| c.spec.service_name)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| workload.name.clone()))
    }
}

/// Top controller of a pod, defaulting to the pod itself.
pub fn workload_from_pod(pod: &Pod, pod_name: &str) -> (WorkloadKind, String) {
    let owners = pod.metadata.owner_references.as_deref().unwrap_or_default();

    // Prefer the controller reference when there are several owners.
    let mut ordered: Vec<&OwnerReference> = owners.iter().collect();
    ordered.sort_by_key(|o| !o.controller.unwrap_or(false));

    for owner in ordered {
        match owner.kind.as_str() {
            "ReplicaSet" => {
                let hash = pod
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(POD_TEMPLATE_HASH_LABEL));
                return (
                    WorkloadKind::Deployment,
                    deployment_name_from_replicaset(&owner.name, hash.map(String::as_str)),
                );
            }
            "StatefulSet" => return (WorkloadKind::StatefulSet, owner.name.clone()),
            "DaemonSet" => return (WorkloadKind::DaemonSet, owner.name.clone()),
            "Job" => return (WorkloadKind::Job, owner.name.clone()),
            "CronJob" => return (WorkloadKind::CronJob, owner.name.clone()),
            _ => continue,
        }
    }

    (WorkloadKind::Pod, pod_name.to_string())
}

fn deployment_name_from_replicaset(replicaset: &str, template_hash: Option<&str>) -> String {
    if let Some(hash) = template_hash {
        if let Some(name) = replicaset.strip_suffix(hash).and_then(|n| n.strip_suffix('-')) {
            return name.to_string();
        }
    }
    match replicaset.rsplit_once('-') {
        Some((name, _)) if !name.is_empty() => name.to_string(),
        _ => replicaset.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn owner(kind: &str, name: &str, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("uid-{name}"),
            controller: Some(controller),
            block_owner_deletion: None,
        }
    }

    fn pod(owners: Vec<OwnerReference>, labels: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("checkout-7d9f8b6c5-abcde".to_string()),
                namespace: Some("default".to_string()),
                owner_references: Some(owners),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_replicaset_maps_to_deployment() {
        let p = pod(
            vec![owner("ReplicaSet", "checkout-7d9f8b6c5", true)],
            &[("pod-template-hash", "7d9f8b6c5")],
        );
        assert_eq!(
            workload_from_pod(&p, "checkout-7d9f8b6c5-abcde"),
            (WorkloadKind::Deployment, "checkout".to_string())
        );
    }

    #[test]
    fn test_replicaset_without_hash_label_strips_last_segment() {
        let p = pod(vec![owner("ReplicaSet", "my-app-5c4d", true)], &[]);
        assert_eq!(
            workload_from_pod(&p, "x"),
            (WorkloadKind::Deployment, "my-app".to_string())
        );
    }

    #[test]
    fn test_direct_controllers() {
        for (kind, expected) in [
            ("StatefulSet", WorkloadKind::StatefulSet),
            ("DaemonSet", WorkloadKind::DaemonSet),
            ("Job", WorkloadKind::Job),
        ] {
            let p = pod(vec![owner(kind, "db", true)], &[]);
            assert_eq!(workload_from_pod(&p, "db-0"), (expected, "db".to_string()));
        }
    }

    #[test]
    fn test_unrecognized_owner_defaults_to_pod() {
        let p = pod(vec![owner("Rollout", "canary", true)], &[]);
        assert_eq!(
            workload_from_pod(&p, "canary-xyz"),
            (WorkloadKind::Pod, "canary-xyz".to_string())
        );

        let bare = pod(vec![], &[]);
        assert_eq!(
            workload_from_pod(&bare, "standalone"),
            (WorkloadKind::Pod, "standalone".to_string())
        );
    }

    #[test]
    fn test_controller_owner_preferred() {
        let p = pod(
            vec![
                owner("Rollout", "ignored", false),
                owner("StatefulSet", "ledger", true),
            ],
            &[],
        );
        assert_eq!(
            workload_from_pod(&p, "ledger-0"),
            (WorkloadKind::StatefulSet, "ledger".to_string())
        );
    }
}
