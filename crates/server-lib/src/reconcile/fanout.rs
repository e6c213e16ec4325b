//! Pushes recomputed config sections to live connections

use crate::connection::{ConnectionRegistry, UpdateOutcome};
use crate::crd::InstrumentationConfig;
use crate::error::ConfigError;
use crate::models::{EnabledSignals, PodWorkload};
use crate::observability::{ServerMetrics, StructuredLogger};
use crate::sdkconfig::RemoteConfigComputer;
use std::sync::Arc;

/// Entry point for reconcilers.
///
/// Cluster reads happen here, before the registry lock is taken; the
/// registry only ever runs synchronous section computation.
#[derive(Clone)]
pub struct ConfigFanout {
    registry: Arc<ConnectionRegistry>,
    computer: Arc<RemoteConfigComputer>,
    logger: StructuredLogger,
    metrics: ServerMetrics,
}

impl ConfigFanout {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        computer: Arc<RemoteConfigComputer>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            registry,
            computer,
            logger,
            metrics: ServerMetrics::new(),
        }
    }

    fn record(&self, trigger: &str, target: &str, outcome: UpdateOutcome) -> UpdateOutcome {
        self.metrics.inc_fanout_updates(outcome.updated);
        self.logger
            .log_fanout(trigger, target, outcome.updated, outcome.failed);
        outcome
    }

    /// New receiver signals from the collectors group.
    ///
    /// Returns `None` when the signals did not change and nothing was sent.
    pub fn signals_changed(&self, signals: EnabledSignals) -> Option<UpdateOutcome> {
        if !self.computer.set_signals(signals) {
            return None;
        }

        let outcome = self.registry.update_matching(
            |_| true,
            |info| RemoteConfigComputer::sdk_update(&info.remote_resource_attributes, signals),
        );
        Some(self.record("collectors_group", "all", outcome))
    }

    /// Re-read the collectors group and fan out if its signals changed
    pub async fn refresh_signals(&self) -> Result<Option<UpdateOutcome>, ConfigError> {
        let signals = self.computer.read_signals().await?;
        Ok(self.signals_changed(signals))
    }

    /// An instrumentation config was applied (`Some`) or deleted (`None`)
    pub async fn instrumentation_config_changed(
        &self,
        workload: &PodWorkload,
        config: Option<&InstrumentationConfig>,
    ) -> Result<UpdateOutcome, ConfigError> {
        let signals = self.computer.current_signals().await?;

        let outcome = self.registry.update_workload(workload, |info| {
            RemoteConfigComputer::instrumentation_config_update(
                workload,
                config,
                &info.programming_language,
                &info.remote_resource_attributes,
                signals,
            )
        });
        Ok(self.record("instrumentation_config", &workload.to_string(), outcome))
    }
}
