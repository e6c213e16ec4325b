//! Node-local OpAMP control plane for instrumented workloads
//!
//! This crate provides the core functionality for:
//! - Resolving agent device ids to Kubernetes workloads
//! - Computing and delivering remote SDK configuration
//! - Tracking live agent connections and their health
//! - Reconciling cluster changes into config updates
//! - Health checks and observability

pub mod api;
pub mod cluster;
pub mod connection;
pub mod crd;
pub mod deviceid;
pub mod ebpf;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod proto;
pub mod reconcile;
pub mod sdkconfig;
pub mod server;

pub use error::{ConfigError, IdentityError, ServerError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ServerMetrics, StructuredLogger};
