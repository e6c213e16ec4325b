//! Device id -> workload identity resolution
//!
//! Agents identify themselves only by an opaque device id handed out by the
//! node device plugin. This module maps it back to the container, pod and
//! owning workload:
//! - `kubelet`: full allocation snapshots from the kubelet pod-resources API
//! - `resolver`: pod owner walk and service-name lookup
//! - `cache`: memoized device -> container snapshot with re-list on miss

mod cache;
mod kubelet;
mod resolver;

pub use cache::{DeviceIdentityCache, ResolvedDevice};
pub use kubelet::{
    snapshot_from_response, KubeletConfig, KubeletPodResources, DEFAULT_POD_RESOURCES_SOCKET,
    DEFAULT_RESOURCE_NAME_PREFIX,
};
pub use resolver::{workload_from_pod, WorkloadIdentityResolver};

use crate::models::{ContainerDetails, DeviceId};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Source of device allocation snapshots
#[async_trait]
pub trait AllocationLister: Send + Sync {
    /// List every allocated device on the node belonging to this system
    async fn list_allocations(&self) -> Result<HashMap<DeviceId, ContainerDetails>>;
}
