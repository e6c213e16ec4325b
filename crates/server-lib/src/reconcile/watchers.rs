//! Kubernetes watchers driving config fan-out

use super::ConfigFanout;
use crate::crd::{CollectorsGroup, Destination, InstrumentationConfig};
use crate::health::{components, HealthRegistry};
use crate::models::{EnabledSignals, PodWorkload};
use futures::{Stream, StreamExt};
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use std::pin::pin;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Where the node collectors group lives
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub namespace: String,
    pub collectors_group_name: String,
}

/// The three reconcilers, sharing one fan-out
pub struct Reconcilers {
    client: Client,
    config: ReconcilerConfig,
    fanout: ConfigFanout,
    health: HealthRegistry,
}

impl Reconcilers {
    pub fn new(
        client: Client,
        config: ReconcilerConfig,
        fanout: ConfigFanout,
        health: HealthRegistry,
    ) -> Self {
        Self {
            client,
            config,
            fanout,
            health,
        }
    }

    /// Spawn one task per watched resource type
    pub fn spawn(self, shutdown: &broadcast::Sender<()>) -> Vec<tokio::task::JoinHandle<()>> {
        let collectors = CollectorsGroupReconciler {
            api: Api::namespaced(self.client.clone(), &self.config.namespace),
            name: self.config.collectors_group_name.clone(),
            fanout: self.fanout.clone(),
            health: self.health.clone(),
        };
        let destinations = DestinationReconciler {
            api: Api::namespaced(self.client.clone(), &self.config.namespace),
            fanout: self.fanout.clone(),
            health: self.health.clone(),
        };
        let configs = InstrumentationConfigReconciler {
            api: Api::all(self.client),
            fanout: self.fanout,
            health: self.health,
        };

        vec![
            tokio::spawn(collectors.run(shutdown.subscribe())),
            tokio::spawn(destinations.run(shutdown.subscribe())),
            tokio::spawn(configs.run(shutdown.subscribe())),
        ]
    }
}

/// Drive a watch stream until shutdown, handing each event to `handle`.
///
/// Stream errors are retried with backoff by the stream itself; they only
/// degrade the reconcilers health component until the next good event.
async fn drive<K, S, F, Fut>(
    kind: &'static str,
    stream: S,
    health: &HealthRegistry,
    mut shutdown: broadcast::Receiver<()>,
    mut handle: F,
) where
    S: Stream<Item = Result<Event<K>, watcher::Error>>,
    F: FnMut(Event<K>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    info!(kind = kind, "Starting reconciler");
    let mut stream = pin!(stream);
    let mut degraded = false;

    loop {
        tokio::select! {
            next = stream.next() => match next {
                Some(Ok(event)) => {
                    if degraded {
                        health.set_healthy(components::RECONCILERS).await;
                        degraded = false;
                    }
                    handle(event).await;
                }
                Some(Err(e)) => {
                    warn!(kind = kind, error = %e, "Watch stream error, retrying");
                    health
                        .set_degraded(components::RECONCILERS, format!("{kind} watch failed: {e}"))
                        .await;
                    degraded = true;
                }
                None => {
                    warn!(kind = kind, "Watch stream ended");
                    break;
                }
            },
            _ = shutdown.recv() => {
                info!(kind = kind, "Shutting down reconciler");
                break;
            }
        }
    }
}

struct CollectorsGroupReconciler {
    api: Api<CollectorsGroup>,
    name: String,
    fanout: ConfigFanout,
    health: HealthRegistry,
}

impl CollectorsGroupReconciler {
    async fn run(self, shutdown: broadcast::Receiver<()>) {
        let config = watcher::Config::default().fields(&format!("metadata.name={}", self.name));
        let stream = watcher(self.api.clone(), config).default_backoff();
        let fanout = &self.fanout;

        drive("CollectorsGroup", stream, &self.health, shutdown, |event| async move {
            let group = match event {
                Event::Applied(group) => Some(group),
                Event::Restarted(groups) => groups.into_iter().next(),
                // Without the group nothing is received
                Event::Deleted(_) => None,
            };
            let signals = group
                .and_then(|g| g.status)
                .map(|s| EnabledSignals::from_signals(&s.receiver_signals))
                .unwrap_or_default();

            if fanout.signals_changed(signals).is_none() {
                debug!("Collectors group changed without affecting signals");
            }
        })
        .await;
    }
}

struct DestinationReconciler {
    api: Api<Destination>,
    fanout: ConfigFanout,
    health: HealthRegistry,
}

impl DestinationReconciler {
    async fn run(self, shutdown: broadcast::Receiver<()>) {
        let stream = watcher(self.api.clone(), watcher::Config::default()).default_backoff();
        let fanout = &self.fanout;

        drive("Destination", stream, &self.health, shutdown, |event| async move {
            if let Event::Applied(dest) | Event::Deleted(dest) = &event {
                debug!(destination = %dest.name_any(), "Destination changed");
            }
            // Destinations only reach agents through the collectors group status
            if let Err(e) = fanout.refresh_signals().await {
                warn!(error = %e, "Failed to refresh collector signals after destination change");
            }
        })
        .await;
    }
}

struct InstrumentationConfigReconciler {
    api: Api<InstrumentationConfig>,
    fanout: ConfigFanout,
    health: HealthRegistry,
}

impl InstrumentationConfigReconciler {
    async fn run(self, shutdown: broadcast::Receiver<()>) {
        let stream = watcher(self.api.clone(), watcher::Config::default()).default_backoff();
        let fanout = &self.fanout;

        drive("InstrumentationConfig", stream, &self.health, shutdown, |event| async move {
            let changes: Vec<(InstrumentationConfig, bool)> = match event {
                Event::Applied(ic) => vec![(ic, true)],
                Event::Deleted(ic) => vec![(ic, false)],
                Event::Restarted(ics) => ics.into_iter().map(|ic| (ic, true)).collect(),
            };

            for (ic, applied) in changes {
                let namespace = ic.namespace().unwrap_or_default();
                let name = ic.name_any();
                let Some(workload) = PodWorkload::from_instrumented_app_name(&namespace, &name)
                else {
                    debug!(namespace = %namespace, name = %name, "Ignoring instrumentation config with unrecognized name");
                    continue;
                };

                let config = applied.then_some(&ic);
                if let Err(e) = fanout.instrumentation_config_changed(&workload, config).await {
                    warn!(workload = %workload, error = %e, "Failed to fan out instrumentation config change");
                }
            }
        })
        .await;
    }
}
