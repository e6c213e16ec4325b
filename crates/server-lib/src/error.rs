//! Error taxonomy for the control plane
//!
//! Handshake errors abort only the connection being established; they
//! never touch the registry or other connections.

use axum::http::StatusCode;

/// Failures while turning a device id into a workload identity
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("device {0} not found in pod-resources allocations")]
    UnknownDevice(String),

    #[error("failed to list device allocations: {0}")]
    DevicePlugin(#[source] anyhow::Error),

    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(std::time::Duration, &'static str),

    #[error("kubernetes api request failed: {0}")]
    KubeApi(#[source] anyhow::Error),
}

/// Failures while computing a remote config document
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to serialize config section {section}: {source}")]
    Serialization {
        section: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to read cluster state: {0}")]
    Cluster(#[source] anyhow::Error),
}

/// Top-level error returned by the protocol handlers
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("identity resolution failed: {0}")]
    IdentityResolution(#[from] IdentityError),

    #[error("config computation failed: {0}")]
    ConfigComputation(#[from] ConfigError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("missing device id header")]
    MissingDeviceId,

    #[error("instrumentation hook failed: {0}")]
    ExtensionHook(#[source] anyhow::Error),
}

impl ServerError {
    /// HTTP status returned to the agent when its message is rejected
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::ProtocolViolation(_) => StatusCode::BAD_REQUEST,
            ServerError::MissingDeviceId => StatusCode::UNAUTHORIZED,
            ServerError::IdentityResolution(IdentityError::UnknownDevice(_)) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used for metrics and structured logs
    pub fn reason(&self) -> &'static str {
        match self {
            ServerError::IdentityResolution(_) => "identity_resolution",
            ServerError::ConfigComputation(_) => "config_computation",
            ServerError::ProtocolViolation(_) => "protocol_violation",
            ServerError::MissingDeviceId => "missing_device_id",
            ServerError::ExtensionHook(_) => "extension_hook",
        }
    }
}
