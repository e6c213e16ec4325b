//! Registry of live agent connections
//!
//! All state sits behind one mutex. The lock is never held across an await
//! point, so callers do their cluster I/O first and hand the registry a
//! synchronous compute closure.

use super::hash::calc_config_hash;
use super::info::ConnectionInfo;
use crate::error::ConfigError;
use crate::models::{DeviceId, PodWorkload, ResourceAttribute};
use crate::proto::{AgentConfigFile, AgentConfigMap};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Expected interval between agent messages
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Silence longer than this many heartbeat intervals means the agent is gone
const STALE_FACTOR: f64 = 2.5;

/// New config sections for one connection, merged by section name
#[derive(Debug, Clone, Default)]
pub struct SectionUpdate {
    pub sections: BTreeMap<String, AgentConfigFile>,
    /// Replaces the stored resource attributes when set
    pub resource_attributes: Option<Vec<ResourceAttribute>>,
}

impl SectionUpdate {
    pub fn new(sections: BTreeMap<String, AgentConfigFile>) -> Self {
        Self {
            sections,
            resource_attributes: None,
        }
    }

    pub fn with_resource_attributes(mut self, attributes: Vec<ResourceAttribute>) -> Self {
        self.resource_attributes = Some(attributes);
        self
    }
}

/// Result of a fan-out pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Connections whose config hash changed
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

pub struct ConnectionRegistry {
    connections: Mutex<HashMap<DeviceId, ConnectionInfo>>,
    heartbeat_interval: Duration,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(HEARTBEAT_INTERVAL)
    }
}

impl ConnectionRegistry {
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            heartbeat_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DeviceId, ConnectionInfo>> {
        // A panic while holding the lock cannot leave an entry half-written.
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn stale_threshold(&self) -> Duration {
        self.heartbeat_interval.mul_f64(STALE_FACTOR)
    }

    /// Copy of the connection for a device
    pub fn get(&self, device_id: &str) -> Option<ConnectionInfo> {
        self.lock().get(device_id).cloned()
    }

    /// Store a connection.
    ///
    /// Returns the entries it displaced: a previous session on the same
    /// device, and any other device's entry for the same pod and pid.
    pub fn add(&self, info: ConnectionInfo) -> Vec<ConnectionInfo> {
        let mut connections = self.lock();

        let same_process: Vec<DeviceId> = connections
            .iter()
            .filter(|(id, existing)| {
                **id != info.device_id
                    && existing.pid == info.pid
                    && existing.pod_name() == info.pod_name()
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut displaced: Vec<ConnectionInfo> = same_process
            .iter()
            .filter_map(|id| connections.remove(id))
            .collect();

        if let Some(previous) = connections.insert(info.device_id.clone(), info) {
            displaced.push(previous);
        }

        if !displaced.is_empty() {
            debug!(displaced = displaced.len(), "Replaced existing connections");
        }
        displaced
    }

    pub fn remove(&self, device_id: &str) -> Option<ConnectionInfo> {
        self.lock().remove(device_id)
    }

    /// Mark a message received now. Unknown devices are ignored.
    pub fn record_heartbeat(&self, device_id: &str) -> bool {
        self.record_heartbeat_at(device_id, Instant::now())
    }

    /// Never moves `last_message_time` backwards.
    pub fn record_heartbeat_at(&self, device_id: &str, at: Instant) -> bool {
        match self.lock().get_mut(device_id) {
            Some(info) => {
                if at > info.last_message_time {
                    info.last_message_time = at;
                }
                true
            }
            None => false,
        }
    }

    /// Evict connections silent for longer than the stale threshold
    pub fn cleanup_stale(&self) -> Vec<ConnectionInfo> {
        self.cleanup_stale_at(Instant::now())
    }

    pub fn cleanup_stale_at(&self, now: Instant) -> Vec<ConnectionInfo> {
        let threshold = self.stale_threshold();
        let mut connections = self.lock();

        let stale: Vec<DeviceId> = connections
            .iter()
            .filter(|(_, info)| now.saturating_duration_since(info.last_message_time) > threshold)
            .map(|(id, _)| id.clone())
            .collect();

        stale
            .iter()
            .filter_map(|id| connections.remove(id))
            .collect()
    }

    /// Recompute config for every matching connection.
    ///
    /// Sections returned by `compute` are upserted into the existing config
    /// map; sections it does not mention are left alone. A failure for one
    /// connection is logged and skipped.
    pub fn update_matching<P, F>(&self, matches: P, mut compute: F) -> UpdateOutcome
    where
        P: Fn(&ConnectionInfo) -> bool,
        F: FnMut(&ConnectionInfo) -> Result<SectionUpdate, ConfigError>,
    {
        let mut outcome = UpdateOutcome::default();
        let mut connections = self.lock();

        for info in connections.values_mut().filter(|info| matches(info)) {
            let update = match compute(info) {
                Ok(update) => update,
                Err(e) => {
                    warn!(
                        device_id = %info.device_id,
                        pod = %info.pod_name(),
                        error = %e,
                        "Failed to compute remote config update, skipping connection"
                    );
                    outcome.failed += 1;
                    continue;
                }
            };

            if let Some(attributes) = update.resource_attributes {
                info.remote_resource_attributes = attributes;
            }

            let config = info
                .agent_remote_config
                .config
                .get_or_insert_with(AgentConfigMap::default);
            config.config_map.extend(update.sections);

            let new_hash = calc_config_hash(config);
            if new_hash == info.agent_remote_config.config_hash {
                outcome.unchanged += 1;
            } else {
                info.agent_remote_config.config_hash = new_hash;
                outcome.updated += 1;
            }
        }

        outcome
    }

    /// [`Self::update_matching`] restricted to one workload
    pub fn update_workload<F>(&self, workload: &PodWorkload, compute: F) -> UpdateOutcome
    where
        F: FnMut(&ConnectionInfo) -> Result<SectionUpdate, ConfigError>,
    {
        self.update_matching(|info| info.workload == *workload, compute)
    }

    /// Copies of every connection
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.lock().values().cloned().collect()
    }

    /// Remove and return every connection
    pub fn drain(&self) -> Vec<ConnectionInfo> {
        self.lock().drain().map(|(_, info)| info).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
