//! Reconcilers
//!
//! This module provides:
//! - Config fan-out to live connections when cluster state changes
//! - Kubernetes watchers for collectors groups, destinations and
//!   instrumentation configs

mod fanout;
mod watchers;


pub use fanout::ConfigFanout;
pub use watchers::{ReconcilerConfig, Reconcilers};
