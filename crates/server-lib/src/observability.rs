//! Observability infrastructure for the OpAMP server
//!
//! Provides:
//! - Prometheus metrics (live connections, handshake latency, fan-out, evictions)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Default histogram buckets for handshake latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ServerMetricsInner> = OnceLock::new();

struct ServerMetricsInner {
    live_connections: IntGauge,
    handshake_latency_seconds: Histogram,
    handshake_failures: IntCounterVec,
    stale_evictions: IntCounter,
    device_resnapshots: IntCounter,
    fanout_updates: IntCounter,
    status_write_failures: IntCounter,
}

impl ServerMetricsInner {
    fn new() -> Self {
        Self {
            live_connections: register_int_gauge!(
                "opamp_server_live_connections",
                "Number of agent connections currently in the registry"
            )
            .expect("Failed to register live_connections"),

            handshake_latency_seconds: register_histogram!(
                "opamp_server_handshake_latency_seconds",
                "Time spent resolving identity and building the initial remote config",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register handshake_latency_seconds"),

            handshake_failures: register_int_counter_vec!(
                "opamp_server_handshake_failures_total",
                "Rejected agent handshakes by reason",
                &["reason"]
            )
            .expect("Failed to register handshake_failures"),

            stale_evictions: register_int_counter!(
                "opamp_server_stale_evictions_total",
                "Connections evicted after missing heartbeats"
            )
            .expect("Failed to register stale_evictions"),

            device_resnapshots: register_int_counter!(
                "opamp_server_device_resnapshots_total",
                "Full pod-resources listings taken after the initial one"
            )
            .expect("Failed to register device_resnapshots"),

            fanout_updates: register_int_counter!(
                "opamp_server_fanout_updates_total",
                "Connections whose remote config was updated by a reconcile"
            )
            .expect("Failed to register fanout_updates"),

            status_write_failures: register_int_counter!(
                "opamp_server_status_write_failures_total",
                "Failed writes of instrumentation instance status"
            )
            .expect("Failed to register status_write_failures"),
        }
    }
}

/// Server metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ServerMetrics {
    _private: (),
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ServerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ServerMetricsInner {
        GLOBAL_METRICS.get_or_init(ServerMetricsInner::new)
    }

    pub fn set_live_connections(&self, count: usize) {
        self.inner().live_connections.set(count as i64);
    }

    pub fn observe_handshake_latency(&self, duration_secs: f64) {
        self.inner().handshake_latency_seconds.observe(duration_secs);
    }

    pub fn inc_handshake_failures(&self, reason: &str) {
        self.inner()
            .handshake_failures
            .with_label_values(&[reason])
            .inc();
    }

    pub fn inc_stale_evictions(&self, count: usize) {
        self.inner().stale_evictions.inc_by(count as u64);
    }

    pub fn inc_device_resnapshots(&self) {
        self.inner().device_resnapshots.inc();
    }

    pub fn inc_fanout_updates(&self, count: usize) {
        self.inner().fanout_updates.inc_by(count as u64);
    }

    pub fn inc_status_write_failures(&self) {
        self.inner().status_write_failures.inc();
    }
}

/// Structured logger for server lifecycle events
///
/// Every event carries a stable `event` field so log pipelines can filter
/// on it independently of the human-readable message.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn log_startup(&self, version: &str, port: u16) {
        info!(
            event = "server_started",
            node = %self.node_name,
            server_version = %version,
            port = port,
            "OpAMP server started"
        );
    }

    pub fn log_shutdown(&self, reason: &str, open_connections: usize) {
        info!(
            event = "server_shutdown",
            node = %self.node_name,
            reason = %reason,
            open_connections = open_connections,
            "OpAMP server shutting down"
        );
    }

    pub fn log_agent_connected(
        &self,
        device_id: &str,
        workload: &str,
        pod_name: &str,
        pid: i64,
        config_hash: &str,
    ) {
        info!(
            event = "agent_connected",
            node = %self.node_name,
            device_id = %device_id,
            workload = %workload,
            pod_name = %pod_name,
            pid = pid,
            config_hash = %config_hash,
            "Agent connected"
        );
    }

    pub fn log_agent_rejected(&self, device_id: &str, reason: &str, error: &str) {
        warn!(
            event = "agent_rejected",
            node = %self.node_name,
            device_id = %device_id,
            reason = %reason,
            error = %error,
            "Agent handshake rejected"
        );
    }

    pub fn log_agent_disconnected(&self, device_id: &str, pod_name: &str, pid: i64, healthy: bool) {
        info!(
            event = "agent_disconnected",
            node = %self.node_name,
            device_id = %device_id,
            pod_name = %pod_name,
            pid = pid,
            healthy = healthy,
            "Agent disconnected"
        );
    }

    pub fn log_connection_stale(&self, device_id: &str, pod_name: &str, pid: i64, silent_secs: u64) {
        warn!(
            event = "connection_stale",
            node = %self.node_name,
            device_id = %device_id,
            pod_name = %pod_name,
            pid = pid,
            silent_secs = silent_secs,
            "Connection missed heartbeats, evicted"
        );
    }

    pub fn log_fanout(&self, trigger: &str, target: &str, updated: usize, failed: usize) {
        if failed > 0 {
            error!(
                event = "remote_config_fanout",
                node = %self.node_name,
                trigger = %trigger,
                target = %target,
                updated = updated,
                failed = failed,
                "Remote config fan-out finished with failures"
            );
        } else {
            info!(
                event = "remote_config_fanout",
                node = %self.node_name,
                trigger = %trigger,
                target = %target,
                updated = updated,
                "Remote config fanned out"
            );
        }
    }
}
