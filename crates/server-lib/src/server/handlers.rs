//! OpAMP connection handlers
//!
//! Handshake, steady-state messages, disconnects and stale connections.
//! Handshake failures reject only the connection being established.

use super::status::{status_update_from_message, InstanceTarget, StatusUpdate, StatusWriter};
use crate::connection::{ConnectionInfo, ConnectionRegistry};
use crate::deviceid::DeviceIdentityCache;
use crate::ebpf::EbpfHooks;
use crate::error::{IdentityError, ServerError};
use crate::models::EnabledSignals;
use crate::observability::{ServerMetrics, StructuredLogger};
use crate::proto::{AgentDescription, AgentToServer, ServerToAgent, ServerToAgentFlags};
use crate::sdkconfig::RemoteConfigComputer;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const PROCESS_PID: &str = "process.pid";
const PROCESS_VPID: &str = "process.vpid";
const TELEMETRY_SDK_LANGUAGE: &str = "telemetry.sdk.language";

/// Upper bound on identity resolution during a handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A handshake that was accepted but not yet stored
#[derive(Debug)]
pub struct NewConnection {
    pub info: ConnectionInfo,
    /// Signals the handshake config was built from
    pub signals: EnabledSignals,
}

pub struct ConnectionHandlers {
    devices: Arc<DeviceIdentityCache>,
    computer: Arc<RemoteConfigComputer>,
    registry: Arc<ConnectionRegistry>,
    status: Arc<dyn StatusWriter>,
    ebpf: Option<Arc<dyn EbpfHooks>>,
    logger: StructuredLogger,
    metrics: ServerMetrics,
    handshake_timeout: Duration,
}

impl ConnectionHandlers {
    pub fn new(
        devices: Arc<DeviceIdentityCache>,
        computer: Arc<RemoteConfigComputer>,
        registry: Arc<ConnectionRegistry>,
        status: Arc<dyn StatusWriter>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            devices,
            computer,
            registry,
            status,
            ebpf: None,
            logger,
            metrics: ServerMetrics::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Attach eBPF instrumentation to every new process
    pub fn with_ebpf_hooks(mut self, hooks: Arc<dyn EbpfHooks>) -> Self {
        self.ebpf = Some(hooks);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    /// Handle the first message of a session.
    ///
    /// Returns no connection when the agent is asked to resend its full
    /// state; the caller stores the connection otherwise.
    pub async fn on_new_connection(
        &self,
        device_id: &str,
        message: &AgentToServer,
    ) -> Result<(Option<NewConnection>, ServerToAgent), ServerError> {
        let Some(description) = &message.agent_description else {
            // Typically a reconnect after this server restarted
            info!(device_id = %device_id, "Agent description missing, requesting full state");
            return Ok((
                None,
                ServerToAgent {
                    flags: ServerToAgentFlags::ReportFullState as u64,
                    ..Default::default()
                },
            ));
        };

        let pid = process_pid(description).ok_or_else(|| {
            ServerError::ProtocolViolation("missing process pid in agent description".to_string())
        })?;
        let language = sdk_language(description);

        let started = Instant::now();
        let resolved = tokio::time::timeout(self.handshake_timeout, self.devices.resolve(device_id))
            .await
            .map_err(|_| IdentityError::Timeout(self.handshake_timeout, "identity resolution"))??;
        let identity = resolved.identity;
        let workload = identity.workload();

        let full = self.computer.build_full_config(&identity, &language).await?;

        let unload = match &self.ebpf {
            Some(hooks) => Some(
                hooks
                    .on_new_instrumented_process(
                        &language,
                        pid,
                        &identity.service_name,
                        &full.resource_attributes,
                    )
                    .await
                    .map_err(ServerError::ExtensionHook)?,
            ),
            None => None,
        };

        self.metrics
            .observe_handshake_latency(started.elapsed().as_secs_f64());

        let info = ConnectionInfo {
            device_id: device_id.to_string(),
            instance_uid: message.instance_uid.clone(),
            pod: resolved.pod,
            pid,
            programming_language: language,
            container_name: identity.container_name.clone(),
            instrumented_app_name: workload.instrumented_app_name(),
            workload,
            remote_resource_attributes: full.resource_attributes,
            agent_remote_config: full.remote_config.clone(),
            last_message_time: Instant::now(),
            unload,
        };

        self.logger.log_agent_connected(
            device_id,
            &info.workload.to_string(),
            info.pod_name(),
            pid,
            &info.config_hash_hex(),
        );

        let response = ServerToAgent {
            remote_config: Some(full.remote_config),
            ..Default::default()
        };
        let accepted = NewConnection {
            info,
            signals: full.signals,
        };
        Ok((Some(accepted), response))
    }

    /// Handle a message on an established connection.
    ///
    /// The stored config is resent whenever the agent has not confirmed it.
    pub fn on_agent_message(&self, message: &AgentToServer, info: &ConnectionInfo) -> ServerToAgent {
        let resend = match &message.remote_config_status {
            // Older agents never report a status
            None => true,
            Some(status) => status.last_remote_config_hash != info.agent_remote_config.config_hash,
        };

        if resend {
            debug!(
                device_id = %info.device_id,
                workload = %info.workload,
                config_hash = %info.config_hash_hex(),
                "Sending remote config to agent"
            );
        }

        ServerToAgent {
            remote_config: resend.then(|| info.agent_remote_config.clone()),
            ..Default::default()
        }
    }

    /// Record a message's self-reported status. Failures are logged only.
    pub async fn persist_status(&self, message: &AgentToServer, info: &ConnectionInfo) {
        let update = status_update_from_message(message, &chrono::Utc::now().to_rfc3339());
        if update.is_empty() {
            return;
        }
        self.write_status(info, update).await;
    }

    async fn write_status(&self, info: &ConnectionInfo, update: StatusUpdate) {
        let target = InstanceTarget::from_connection(info);
        if let Err(e) = self.status.persist(&target, update).await {
            self.metrics.inc_status_write_failures();
            warn!(
                device_id = %info.device_id,
                instance = %target.instance_name(),
                error = %e,
                "Failed to persist instrumentation instance status"
            );
        }
    }

    /// The agent announced it is going away.
    ///
    /// A healthy agent's status is deleted; an unhealthy one's is kept for
    /// troubleshooting.
    pub async fn on_agent_disconnect(&self, message: &AgentToServer, info: &ConnectionInfo) {
        self.registry.remove(&info.device_id);
        self.update_live_connections();
        info.run_unload();

        let healthy = message.health.as_ref().map(|h| h.healthy);
        self.logger.log_agent_disconnected(
            &info.device_id,
            info.pod_name(),
            info.pid,
            healthy.unwrap_or(false),
        );

        match healthy {
            Some(true) => {
                let target = InstanceTarget::from_connection(info);
                if let Err(e) = self.status.delete(&target).await {
                    self.metrics.inc_status_write_failures();
                    warn!(instance = %target.instance_name(), error = %e, "Failed to delete instrumentation instance");
                }
            }
            Some(false) => self.persist_status(message, info).await,
            None => warn!(
                device_id = %info.device_id,
                "Agent disconnected without reporting health, keeping status"
            ),
        }
    }

    /// A connection evicted by the staleness sweep
    pub async fn on_connection_no_heartbeat(&self, info: &ConnectionInfo) {
        self.logger.log_connection_stale(
            &info.device_id,
            info.pod_name(),
            info.pid,
            info.last_message_time.elapsed().as_secs(),
        );
        info.run_unload();
        self.write_status(info, StatusUpdate::no_heartbeat()).await;
    }

    /// Store a new connection, cleaning up whatever it replaces.
    ///
    /// Returns the stored entry, which carries the current signals even if
    /// they changed while the handshake was in flight.
    pub fn register(&self, accepted: NewConnection) -> ConnectionInfo {
        let NewConnection { info, signals } = accepted;
        let device_id = info.device_id.clone();
        let instance_uid = info.instance_uid.clone();

        // The hook attached again for the new session, so every displaced
        // handle is released
        for displaced in self.registry.add(info.clone()) {
            displaced.run_unload();
        }
        self.update_live_connections();

        // A fan-out that ran before the add could not see this entry
        if self.computer.cached_signals().is_some_and(|current| current != signals) {
            let outcome = self.registry.update_matching(
                |c| c.device_id == device_id && c.instance_uid == instance_uid,
                |c| {
                    // Read again under the registry lock
                    let current = self.computer.cached_signals().unwrap_or(signals);
                    RemoteConfigComputer::sdk_update(&c.remote_resource_attributes, current)
                },
            );
            debug!(
                device_id = %device_id,
                updated = outcome.updated,
                "Re-applied signals changed during handshake"
            );
        }

        self.registry
            .get(&device_id)
            .filter(|c| c.instance_uid == instance_uid)
            .unwrap_or(info)
    }

    pub fn update_live_connections(&self) {
        self.metrics.set_live_connections(self.registry.len());
    }

    pub fn record_rejection(&self, device_id: &str, error: &ServerError) {
        self.metrics.inc_handshake_failures(error.reason());
        self.logger
            .log_agent_rejected(device_id, error.reason(), &error.to_string());
    }

    /// Detach every live connection; used at shutdown
    pub fn unload_all(&self) -> usize {
        let connections = self.registry.drain();
        for info in &connections {
            info.run_unload();
        }
        self.metrics.set_live_connections(0);
        connections.len()
    }
}

fn process_pid(description: &AgentDescription) -> Option<i64> {
    description
        .identifying_attributes
        .iter()
        .find(|kv| kv.key == PROCESS_PID || kv.key == PROCESS_VPID)
        .and_then(|kv| kv.value.as_ref())
        .and_then(|v| v.as_int())
        .filter(|pid| *pid > 0)
}

fn sdk_language(description: &AgentDescription) -> String {
    description
        .identifying_attributes
        .iter()
        .find(|kv| kv.key == TELEMETRY_SDK_LANGUAGE)
        .and_then(|kv| kv.value.as_ref())
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}
