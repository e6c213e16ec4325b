//! Device identity cache
//!
//! Holds the last full allocation snapshot. A lookup miss triggers exactly
//! one re-list; misses are not remembered, so a later lookup of the same
//! absent id re-lists again.

use super::{AllocationLister, WorkloadIdentityResolver};
use crate::error::IdentityError;
use crate::models::{ContainerDetails, DeviceId, WorkloadIdentity};
use crate::observability::ServerMetrics;
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A device resolved to its workload, with the pod as fetched during resolution
#[derive(Debug, Clone)]
pub struct ResolvedDevice {
    pub identity: WorkloadIdentity,
    pub container: ContainerDetails,
    pub pod: Pod,
}

pub struct DeviceIdentityCache {
    lister: Arc<dyn AllocationLister>,
    resolver: WorkloadIdentityResolver,
    snapshot: RwLock<HashMap<DeviceId, ContainerDetails>>,
    metrics: ServerMetrics,
}

impl DeviceIdentityCache {
    /// Build the cache and take the initial snapshot.
    ///
    /// Fails if the device plugin listing is unavailable.
    pub async fn new(
        lister: Arc<dyn AllocationLister>,
        resolver: WorkloadIdentityResolver,
    ) -> Result<Self, IdentityError> {
        let initial = lister
            .list_allocations()
            .await
            .map_err(IdentityError::DevicePlugin)?;
        info!(devices = initial.len(), "Loaded initial device allocation snapshot");

        Ok(Self {
            lister,
            resolver,
            snapshot: RwLock::new(initial),
            metrics: ServerMetrics::new(),
        })
    }

    /// Container details for a device, re-listing once on a miss
    pub async fn container_details(
        &self,
        device_id: &str,
    ) -> Result<ContainerDetails, IdentityError> {
        if let Some(details) = self.snapshot.read().await.get(device_id) {
            return Ok(details.clone());
        }

        debug!(device_id = %device_id, "Device not in snapshot, re-listing allocations");
        self.resnapshot().await?;

        self.snapshot
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| IdentityError::UnknownDevice(device_id.to_string()))
    }

    /// Resolve a device all the way to its workload identity.
    ///
    /// The pod and the service name are always read live.
    pub async fn resolve(&self, device_id: &str) -> Result<ResolvedDevice, IdentityError> {
        let container = self.container_details(device_id).await?;
        let (mut identity, pod) = self.resolver.resolve(&container).await?;
        identity.service_name = self
            .resolver
            .resolve_service_name(&identity.workload())
            .await?;

        Ok(ResolvedDevice {
            identity,
            container,
            pod,
        })
    }

    /// Replace the snapshot with a fresh full listing
    pub async fn resnapshot(&self) -> Result<(), IdentityError> {
        self.metrics.inc_device_resnapshots();
        // List outside the lock; only the swap is guarded.
        let fresh = self
            .lister
            .list_allocations()
            .await
            .map_err(IdentityError::DevicePlugin)?;
        *self.snapshot.write().await = fresh;
        Ok(())
    }

    pub fn resolver(&self) -> &WorkloadIdentityResolver {
        &self.resolver
    }

    pub async fn len(&self) -> usize {
        self.snapshot.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshot.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterReader;
    use crate::crd::{InstrumentationConfig, InstrumentationConfigSpec};
    use crate::models::{ObservabilitySignal, WorkloadKind};
    use anyhow::Result;
    use async_trait::async_trait;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Lister returning a fixed snapshot and counting calls
    struct CountingLister {
        calls: AtomicUsize,
        devices: Mutex<HashMap<DeviceId, ContainerDetails>>,
    }

    impl CountingLister {
        fn new(devices: &[(&str, &str)]) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                devices: Mutex::new(
                    devices
                        .iter()
                        .map(|(id, pod)| (id.to_string(), details(pod)))
                        .collect(),
                ),
            }
        }

        fn add(&self, id: &str, pod: &str) {
            self.devices
                .lock()
                .unwrap()
                .insert(id.to_string(), details(pod));
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AllocationLister for CountingLister {
        async fn list_allocations(&self) -> Result<HashMap<DeviceId, ContainerDetails>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.devices.lock().unwrap().clone())
        }
    }

    struct FakeCluster {
        service_name: String,
    }

    #[async_trait]
    impl ClusterReader for FakeCluster {
        async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
            Ok(Pod {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    owner_references: Some(vec![OwnerReference {
                        api_version: "apps/v1".to_string(),
                        kind: "ReplicaSet".to_string(),
                        name: "checkout-5f6d7".to_string(),
                        uid: "rs-uid".to_string(),
                        controller: Some(true),
                        block_owner_deletion: None,
                    }]),
                    ..Default::default()
                },
                ..Default::default()
            })
        }

        async fn get_instrumentation_config(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<InstrumentationConfig>> {
            if self.service_name.is_empty() {
                return Ok(None);
            }
            let mut ic = InstrumentationConfig::new(
                name,
                InstrumentationConfigSpec {
                    service_name: self.service_name.clone(),
                    ..Default::default()
                },
            );
            ic.metadata.namespace = Some(namespace.to_string());
            Ok(Some(ic))
        }

        async fn node_receiver_signals(&self) -> Result<Vec<ObservabilitySignal>> {
            Ok(vec![])
        }
    }

    fn details(pod: &str) -> ContainerDetails {
        ContainerDetails {
            pod_name: pod.to_string(),
            pod_namespace: "default".to_string(),
            container_name: "app".to_string(),
            containers_in_pod: 1,
        }
    }

    async fn cache_with(
        lister: Arc<CountingLister>,
        service_name: &str,
    ) -> DeviceIdentityCache {
        let cluster = Arc::new(FakeCluster {
            service_name: service_name.to_string(),
        });
        DeviceIdentityCache::new(lister, WorkloadIdentityResolver::new(cluster))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_hit_does_not_relist() {
        let lister = Arc::new(CountingLister::new(&[("dev-1", "checkout-abc")]));
        let cache = cache_with(lister.clone(), "").await;
        assert_eq!(lister.calls(), 1);

        let details = cache.container_details("dev-1").await.unwrap();
        assert_eq!(details.pod_name, "checkout-abc");
        assert_eq!(lister.calls(), 1);
    }

    #[tokio::test]
    async fn test_miss_triggers_exactly_one_resnapshot() {
        let lister = Arc::new(CountingLister::new(&[]));
        let cache = cache_with(lister.clone(), "").await;
        assert_eq!(lister.calls(), 1);

        let err = cache.container_details("dev-unknown").await.unwrap_err();
        assert!(matches!(err, IdentityError::UnknownDevice(_)));
        assert_eq!(lister.calls(), 2);

        // No negative caching: the same absent id re-lists once more
        cache.container_details("dev-unknown").await.unwrap_err();
        assert_eq!(lister.calls(), 3);
    }

    #[tokio::test]
    async fn test_miss_resolves_after_resnapshot() {
        let lister = Arc::new(CountingLister::new(&[]));
        let cache = cache_with(lister.clone(), "").await;

        lister.add("dev-2", "checkout-def");
        let details = cache.container_details("dev-2").await.unwrap();
        assert_eq!(details.pod_name, "checkout-def");
        assert_eq!(lister.calls(), 2);

        // Now memoized
        cache.container_details("dev-2").await.unwrap();
        assert_eq!(lister.calls(), 2);
    }

    #[tokio::test]
    async fn test_resolve_walks_owner_and_defaults_service_name() {
        let lister = Arc::new(CountingLister::new(&[("dev-1", "checkout-abc")]));
        let cache = cache_with(lister, "").await;

        let resolved = cache.resolve("dev-1").await.unwrap();
        assert_eq!(resolved.identity.workload_kind, WorkloadKind::Deployment);
        assert_eq!(resolved.identity.workload_name, "checkout");
        assert_eq!(resolved.identity.service_name, "checkout");
        assert_eq!(resolved.identity.container_name, "app");
    }

    #[tokio::test]
    async fn test_resolve_uses_service_name_override() {
        let lister = Arc::new(CountingLister::new(&[("dev-1", "checkout-abc")]));
        let cache = cache_with(lister, "checkout-api").await;

        let resolved = cache.resolve("dev-1").await.unwrap();
        assert_eq!(resolved.identity.service_name, "checkout-api");
    }
}
