//! Tests for the OpAMP session flow
//!
//! These tests verify:
//! - Handshake, recovery and rejection paths
//! - Fan-out reaching an open connection without reconnecting
//! - Disconnect and staleness cleanup, including eBPF unload

use super::*;
use crate::cluster::ClusterReader;
use crate::connection::ConnectionRegistry;
use crate::crd::InstrumentationConfig;
use crate::deviceid::{AllocationLister, DeviceIdentityCache, WorkloadIdentityResolver};
use crate::ebpf::{EbpfHooks, UnloadHandle};
use crate::error::ServerError;
use crate::models::{
    ContainerDetails, DeviceId, EnabledSignals, ObservabilitySignal, ResourceAttribute,
};
use crate::observability::StructuredLogger;
use crate::proto::{
    AgentDescription, AgentDisconnect, AgentToServer, ComponentHealth, KeyValue,
    RemoteConfigStatus, ServerToAgentFlags,
};
use crate::reconcile::ConfigFanout;
use crate::sdkconfig::{RemoteConfigComputer, RemoteConfigSdk, SDK_SECTION_NAME};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::http::StatusCode;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct StaticLister {
    devices: HashMap<DeviceId, ContainerDetails>,
}

#[async_trait]
impl AllocationLister for StaticLister {
    async fn list_allocations(&self) -> Result<HashMap<DeviceId, ContainerDetails>> {
        Ok(self.devices.clone())
    }
}

struct MockCluster {
    signals: Mutex<Vec<ObservabilitySignal>>,
}

#[async_trait]
impl ClusterReader for MockCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        Ok(Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                uid: Some("pod-uid".to_string()),
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
        _namespace: &str,
        _name: &str,
    ) -> Result<Option<InstrumentationConfig>> {
        Ok(None)
    }

    async fn node_receiver_signals(&self) -> Result<Vec<ObservabilitySignal>> {
        Ok(self.signals.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct MockStatusWriter {
    persisted: Mutex<Vec<(String, StatusUpdate)>>,
    deleted: AtomicUsize,
}

#[async_trait]
impl StatusWriter for MockStatusWriter {
    async fn persist(&self, target: &InstanceTarget, update: StatusUpdate) -> Result<()> {
        self.persisted
            .lock()
            .unwrap()
            .push((target.instance_name(), update));
        Ok(())
    }

    async fn delete(&self, _target: &InstanceTarget) -> Result<()> {
        self.deleted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct MockHooks {
    fail: bool,
    attached: AtomicUsize,
    unloaded: Arc<AtomicUsize>,
    /// Fan-out to run while the handshake is waiting on the hook
    fanout_during_attach: Mutex<Option<(ConfigFanout, EnabledSignals)>>,
}

#[async_trait]
impl EbpfHooks for MockHooks {
    async fn on_new_instrumented_process(
        &self,
        _language: &str,
        _pid: i64,
        _service_name: &str,
        _resource_attributes: &[ResourceAttribute],
    ) -> Result<UnloadHandle> {
        if self.fail {
            return Err(anyhow!("attach failed: symbol not found"));
        }
        self.attached.fetch_add(1, Ordering::SeqCst);
        let pending = self.fanout_during_attach.lock().unwrap().take();
        if let Some((fanout, signals)) = pending {
            fanout.signals_changed(signals);
        }
        let unloaded = self.unloaded.clone();
        Ok(UnloadHandle::new(move || {
            unloaded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }
}

struct Harness {
    server: OpampServer,
    fanout: ConfigFanout,
    cluster: Arc<MockCluster>,
    status: Arc<MockStatusWriter>,
    hooks: Option<Arc<MockHooks>>,
}

impl Harness {
    async fn new() -> Self {
        Self::build(None, HEARTBEAT).await
    }

    async fn with_hooks(hooks: MockHooks) -> Self {
        Self::build(Some(Arc::new(hooks)), HEARTBEAT).await
    }

    async fn build(hooks: Option<Arc<MockHooks>>, heartbeat: Duration) -> Self {
        let lister = Arc::new(StaticLister {
            devices: HashMap::from([(
                "dev-1".to_string(),
                ContainerDetails {
                    pod_name: "checkout-5f6d7-abc".to_string(),
                    pod_namespace: "default".to_string(),
                    container_name: "app".to_string(),
                    containers_in_pod: 1,
                },
            )]),
        });
        let cluster = Arc::new(MockCluster {
            signals: Mutex::new(vec![]),
        });
        let devices = Arc::new(
            DeviceIdentityCache::new(lister, WorkloadIdentityResolver::new(cluster.clone()))
                .await
                .unwrap(),
        );
        let computer = Arc::new(RemoteConfigComputer::new(cluster.clone(), "node-a"));
        let registry = Arc::new(ConnectionRegistry::new(heartbeat));
        let status = Arc::new(MockStatusWriter::default());
        let logger = StructuredLogger::new("node-a");

        let mut handlers = ConnectionHandlers::new(
            devices,
            computer.clone(),
            registry.clone(),
            status.clone(),
            logger.clone(),
        );
        if let Some(hooks) = &hooks {
            handlers = handlers.with_ebpf_hooks(hooks.clone());
        }

        Self {
            server: OpampServer::new(Arc::new(handlers)),
            fanout: ConfigFanout::new(registry, computer, logger),
            cluster,
            status,
            hooks,
        }
    }

    fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.server.handlers().registry()
    }

    fn attached(&self) -> usize {
        self.hooks
            .as_ref()
            .map(|h| h.attached.load(Ordering::SeqCst))
            .unwrap_or_default()
    }

    fn unloaded(&self) -> usize {
        self.hooks
            .as_ref()
            .map(|h| h.unloaded.load(Ordering::SeqCst))
            .unwrap_or_default()
    }
}

const HEARTBEAT: Duration = Duration::from_secs(30);

fn first_message(pid: Option<i64>) -> AgentToServer {
    let mut attributes = vec![KeyValue::string("telemetry.sdk.language", "python")];
    if let Some(pid) = pid {
        attributes.push(KeyValue::int("process.pid", pid));
    }
    AgentToServer {
        instance_uid: b"instance-1".to_vec(),
        agent_description: Some(AgentDescription {
            identifying_attributes: attributes,
            non_identifying_attributes: vec![],
        }),
        ..Default::default()
    }
}

fn heartbeat(applied_hash: Option<Vec<u8>>) -> AgentToServer {
    AgentToServer {
        instance_uid: b"instance-1".to_vec(),
        remote_config_status: applied_hash.map(|hash| RemoteConfigStatus {
            last_remote_config_hash: hash,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn disconnect(healthy: bool) -> AgentToServer {
    AgentToServer {
        instance_uid: b"instance-1".to_vec(),
        agent_disconnect: Some(AgentDisconnect {}),
        health: Some(ComponentHealth {
            healthy,
            last_error: if healthy { String::new() } else { "crashed".to_string() },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn sdk_of(response: &crate::proto::ServerToAgent) -> RemoteConfigSdk {
    let config = response
        .remote_config
        .as_ref()
        .and_then(|rc| rc.config.as_ref())
        .unwrap();
    serde_json::from_slice(&config.config_map[SDK_SECTION_NAME].body).unwrap()
}

#[tokio::test]
async fn test_handshake_then_signal_fanout_without_reconnect() {
    let h = Harness::new().await;

    let response = h
        .server
        .handle_message(Some("dev-1"), first_message(Some(123)))
        .await
        .unwrap();
    assert_eq!(response.instance_uid, b"instance-1".to_vec());
    assert!(!sdk_of(&response).trace_signal.enabled);

    let info = h.registry().get("dev-1").unwrap();
    assert_eq!(info.pid, 123);
    assert_eq!(info.workload.name, "checkout");
    assert_eq!(info.pod_name(), "checkout-5f6d7-abc");
    assert_eq!(info.instrumented_app_name, "deployment-checkout");
    let applied = info.config_hash().to_vec();

    // Agent confirms the config: nothing to resend
    let response = h
        .server
        .handle_message(Some("dev-1"), heartbeat(Some(applied.clone())))
        .await
        .unwrap();
    assert!(response.remote_config.is_none());

    // A destination enabling traces updates the collectors group
    *h.cluster.signals.lock().unwrap() = vec![ObservabilitySignal::Traces];
    let outcome = h.fanout.refresh_signals().await.unwrap().unwrap();
    assert_eq!(outcome.updated, 1);

    let response = h
        .server
        .handle_message(Some("dev-1"), heartbeat(Some(applied)))
        .await
        .unwrap();
    assert!(sdk_of(&response).trace_signal.enabled);
    assert_eq!(h.registry().len(), 1);
}

#[tokio::test]
async fn test_missing_description_requests_full_state() {
    let h = Harness::new().await;

    let response = h
        .server
        .handle_message(Some("dev-1"), heartbeat(None))
        .await
        .unwrap();
    assert_eq!(response.flags, ServerToAgentFlags::ReportFullState as u64);
    assert!(response.remote_config.is_none());
    assert!(h.registry().is_empty());

    let response = h
        .server
        .handle_message(Some("dev-1"), first_message(Some(123)))
        .await
        .unwrap();
    assert!(response.remote_config.is_some());
    assert_eq!(h.registry().len(), 1);
}

#[tokio::test]
async fn test_older_agent_gets_config_on_every_message() {
    let h = Harness::new().await;
    h.server
        .handle_message(Some("dev-1"), first_message(Some(123)))
        .await
        .unwrap();

    let response = h
        .server
        .handle_message(Some("dev-1"), heartbeat(None))
        .await
        .unwrap();
    assert!(response.remote_config.is_some());
}

#[tokio::test]
async fn test_rejections() {
    let h = Harness::new().await;

    let err = h
        .server
        .handle_message(Some("dev-1"), first_message(None))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

    let err = h
        .server
        .handle_message(Some("dev-unknown"), first_message(Some(123)))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

    let err = h
        .server
        .handle_message(None, first_message(Some(123)))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::MissingDeviceId));

    let mut no_uid = first_message(Some(123));
    no_uid.instance_uid.clear();
    let err = h
        .server
        .handle_message(Some("dev-1"), no_uid)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::ProtocolViolation(_)));

    assert!(h.registry().is_empty());
}

#[tokio::test]
async fn test_hook_failure_rejects_connection() {
    let h = Harness::with_hooks(MockHooks {
        fail: true,
        ..Default::default()
    })
    .await;

    let err = h
        .server
        .handle_message(Some("dev-1"), first_message(Some(123)))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::ExtensionHook(_)));
    assert!(h.registry().is_empty());
}

#[tokio::test]
async fn test_healthy_disconnect_unloads_once_and_deletes_status() {
    let h = Harness::with_hooks(MockHooks::default()).await;
    h.server
        .handle_message(Some("dev-1"), first_message(Some(123)))
        .await
        .unwrap();
    assert_eq!(h.hooks.as_ref().unwrap().attached.load(Ordering::SeqCst), 1);

    h.server
        .handle_message(Some("dev-1"), disconnect(true))
        .await
        .unwrap();
    assert!(h.registry().is_empty());
    assert_eq!(h.unloaded(), 1);
    assert_eq!(h.status.deleted.load(Ordering::SeqCst), 1);

    // Shutdown afterwards must not unload again
    assert_eq!(h.server.handlers().unload_all(), 0);
    assert_eq!(h.unloaded(), 1);
}

#[tokio::test]
async fn test_unhealthy_disconnect_keeps_status() {
    let h = Harness::new().await;
    h.server
        .handle_message(Some("dev-1"), first_message(Some(123)))
        .await
        .unwrap();

    h.server
        .handle_message(Some("dev-1"), disconnect(false))
        .await
        .unwrap();
    assert_eq!(h.status.deleted.load(Ordering::SeqCst), 0);

    let persisted = h.status.persisted.lock().unwrap();
    let (name, update) = persisted.last().unwrap();
    assert_eq!(name, "checkout-5f6d7-abc-123");
    assert_eq!(update.healthy, Some(false));
    assert_eq!(update.message.as_deref(), Some("crashed"));
}

#[tokio::test]
async fn test_new_instance_uid_replaces_session() {
    let h = Harness::with_hooks(MockHooks::default()).await;
    h.server
        .handle_message(Some("dev-1"), first_message(Some(123)))
        .await
        .unwrap();

    let mut restarted = first_message(Some(456));
    restarted.instance_uid = b"instance-2".to_vec();
    h.server
        .handle_message(Some("dev-1"), restarted)
        .await
        .unwrap();

    let info = h.registry().get("dev-1").unwrap();
    assert_eq!(info.pid, 456);
    assert_eq!(h.registry().len(), 1);
    // The old process's instrumentation is detached
    assert_eq!(h.unloaded(), 1);
}

#[tokio::test]
async fn test_reattach_with_same_pid_unloads_previous_session() {
    let h = Harness::with_hooks(MockHooks::default()).await;
    h.server
        .handle_message(Some("dev-1"), first_message(Some(123)))
        .await
        .unwrap();

    // Same process re-running its handshake under a fresh instance uid
    let mut again = first_message(Some(123));
    again.instance_uid = b"instance-2".to_vec();
    h.server
        .handle_message(Some("dev-1"), again)
        .await
        .unwrap();

    assert_eq!(h.attached(), 2);
    assert_eq!(h.unloaded(), 1);
    assert_eq!(h.registry().get("dev-1").unwrap().instance_uid, b"instance-2".to_vec());

    assert_eq!(h.server.handlers().unload_all(), 1);
    assert_eq!(h.unloaded(), h.attached());
}

#[tokio::test]
async fn test_signals_changed_during_handshake_reach_new_connection() {
    let h = Harness::with_hooks(MockHooks::default()).await;
    let traces = EnabledSignals {
        traces: true,
        ..Default::default()
    };
    *h.hooks.as_ref().unwrap().fanout_during_attach.lock().unwrap() =
        Some((h.fanout.clone(), traces));

    let response = h
        .server
        .handle_message(Some("dev-1"), first_message(Some(123)))
        .await
        .unwrap();

    // The fan-out ran before the connection was stored
    assert!(h.hooks.as_ref().unwrap().fanout_during_attach.lock().unwrap().is_none());

    let info = h.registry().get("dev-1").unwrap();
    let stored: RemoteConfigSdk = serde_json::from_slice(
        &info.agent_remote_config.config.as_ref().unwrap().config_map[SDK_SECTION_NAME].body,
    )
    .unwrap();
    assert!(stored.trace_signal.enabled);

    // The handshake response already carries the stored config
    assert!(sdk_of(&response).trace_signal.enabled);
    let sent = response.remote_config.as_ref().unwrap().config_hash.clone();
    assert_eq!(sent, info.config_hash().to_vec());

    let response = h
        .server
        .handle_message(Some("dev-1"), heartbeat(Some(sent)))
        .await
        .unwrap();
    assert!(response.remote_config.is_none());
}

#[tokio::test]
async fn test_sweep_marks_stale_connections() {
    let h = Harness::build(Some(Arc::new(MockHooks::default())), Duration::from_millis(4)).await;
    h.server
        .handle_message(Some("dev-1"), first_message(Some(123)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    let sweeper = StaleConnectionSweeper::new(h.server.handlers().clone());
    assert_eq!(sweeper.sweep_once().await, 1);
    assert!(h.registry().is_empty());
    assert_eq!(h.unloaded(), 1);

    let persisted = h.status.persisted.lock().unwrap();
    let (_, update) = persisted.last().unwrap();
    assert_eq!(update.reason.as_deref(), Some(REASON_NO_HEARTBEAT));
    assert_eq!(update.healthy, Some(false));
}

#[tokio::test]
async fn test_sweep_period_never_zero() {
    let h = Harness::build(None, Duration::ZERO).await;
    let sweeper = StaleConnectionSweeper::new(h.server.handlers().clone());
    assert!(sweeper.period() > Duration::ZERO);

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let handle = tokio::spawn(sweeper.run(shutdown_tx.subscribe()));
    tokio::time::sleep(Duration::from_millis(5)).await;
    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_unchanged_signals_do_not_touch_connections() {
    let h = Harness::new().await;
    h.server
        .handle_message(Some("dev-1"), first_message(Some(123)))
        .await
        .unwrap();
    let before = h.registry().get("dev-1").unwrap().config_hash_hex();

    assert!(h.fanout.signals_changed(EnabledSignals::default()).is_none());
    assert_eq!(h.registry().get("dev-1").unwrap().config_hash_hex(), before);
}
