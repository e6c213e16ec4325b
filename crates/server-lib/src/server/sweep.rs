//! Staleness sweep
//!
//! Notices connections whose transport went away without the server
//! seeing a disconnect message.

use super::handlers::ConnectionHandlers;
use crate::observability::ServerMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant};
use tracing::{debug, info};

const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(1);

pub struct StaleConnectionSweeper {
    handlers: Arc<ConnectionHandlers>,
    metrics: ServerMetrics,
}

impl StaleConnectionSweeper {
    pub fn new(handlers: Arc<ConnectionHandlers>) -> Self {
        Self {
            handlers,
            metrics: ServerMetrics::new(),
        }
    }

    /// Sweep period: half the stale threshold, never zero
    pub fn period(&self) -> Duration {
        (self.handlers.registry().stale_threshold() / 2).max(MIN_SWEEP_PERIOD)
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.period();
        info!(period_ms = period.as_millis() as u64, "Starting staleness sweep");

        let mut ticker = interval(period);
        // The first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    let evicted = self.sweep_once().await;
                    if evicted > 0 {
                        debug!(
                            evicted = evicted,
                            elapsed_ms = start.elapsed().as_millis(),
                            "Sweep complete"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down staleness sweep");
                    break;
                }
            }
        }
    }

    /// Evict stale connections once; returns how many were evicted
    pub async fn sweep_once(&self) -> usize {
        let stale = self.handlers.registry().cleanup_stale();
        if stale.is_empty() {
            return 0;
        }

        self.metrics.inc_stale_evictions(stale.len());
        self.handlers.update_live_connections();
        for info in &stale {
            self.handlers.on_connection_no_heartbeat(info).await;
        }
        stale.len()
    }
}
