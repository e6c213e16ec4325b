//! OpAMP protocol server
//!
//! This module provides:
//! - Connection handlers for handshake, steady state, disconnect and staleness
//! - The `POST /v1/opamp` HTTP endpoint
//! - A periodic sweep evicting connections that stopped heartbeating
//! - InstrumentationInstance status persistence

mod handlers;
mod http;
mod status;
mod sweep;

#[cfg(test)]
mod tests;

pub use handlers::{ConnectionHandlers, NewConnection, DEFAULT_HANDSHAKE_TIMEOUT};
pub use http::{
    opamp_router, serve, OpampServer, DEVICE_ID_HEADER, OPAMP_PATH, PROTOBUF_CONTENT_TYPE,
};
pub use status::{
    status_update_from_message, InstanceTarget, KubeStatusWriter, StatusUpdate, StatusWriter,
    LABEL_INSTRUMENTED_APP, LABEL_OWNER_POD, MAX_INSTANCES_PER_POD, REASON_NO_HEARTBEAT,
};
pub use sweep::StaleConnectionSweeper;
