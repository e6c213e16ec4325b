//! OpAMP over plain HTTP
//!
//! Every agent exchange is a single `POST /v1/opamp` carrying a protobuf
//! `AgentToServer`; the response body is a protobuf `ServerToAgent`.

use super::handlers::ConnectionHandlers;
use crate::error::ServerError;
use crate::proto::{AgentToServer, ServerToAgent};
use axum::{
    body::Bytes,
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use prost::Message;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info};

pub const OPAMP_PATH: &str = "/v1/opamp";
pub const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";
pub const DEVICE_ID_HEADER: &str = "X-Odigos-DeviceId";

/// Session state machine over the connection handlers
pub struct OpampServer {
    handlers: Arc<ConnectionHandlers>,
}

impl OpampServer {
    pub fn new(handlers: Arc<ConnectionHandlers>) -> Self {
        Self { handlers }
    }

    pub fn handlers(&self) -> &Arc<ConnectionHandlers> {
        &self.handlers
    }

    /// Process one inbound message and build the response
    pub async fn handle_message(
        &self,
        device_id: Option<&str>,
        message: AgentToServer,
    ) -> Result<ServerToAgent, ServerError> {
        if message.instance_uid.is_empty() {
            return Err(ServerError::ProtocolViolation(
                "empty instance uid".to_string(),
            ));
        }
        let device_id = device_id
            .filter(|id| !id.is_empty())
            .ok_or(ServerError::MissingDeviceId)?;

        let registry = self.handlers.registry();
        // A new instance uid on a known device is a restarted process
        let existing = registry
            .get(device_id)
            .filter(|info| info.instance_uid == message.instance_uid);

        let mut response = match existing {
            Some(info) if message.agent_disconnect.is_some() => {
                self.handlers.on_agent_disconnect(&message, &info).await;
                ServerToAgent::default()
            }
            Some(info) => {
                registry.record_heartbeat(device_id);
                self.handlers.persist_status(&message, &info).await;
                self.handlers.on_agent_message(&message, &info)
            }
            None => self.handshake(device_id, &message).await?,
        };

        response.instance_uid = message.instance_uid;
        Ok(response)
    }

    async fn handshake(
        &self,
        device_id: &str,
        message: &AgentToServer,
    ) -> Result<ServerToAgent, ServerError> {
        let (accepted, mut response) =
            match self.handlers.on_new_connection(device_id, message).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    self.handlers.record_rejection(device_id, &e);
                    return Err(e);
                }
            };

        if let Some(accepted) = accepted {
            let info = self.handlers.register(accepted);
            if response.remote_config.is_some() {
                response.remote_config = Some(info.agent_remote_config.clone());
            }
            self.handlers.persist_status(message, &info).await;
            if message.agent_disconnect.is_some() {
                self.handlers.on_agent_disconnect(message, &info).await;
            }
        }
        Ok(response)
    }
}

async fn opamp(
    State(server): State<Arc<OpampServer>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with(PROTOBUF_CONTENT_TYPE) {
        return (
            StatusCode::BAD_REQUEST,
            format!("unsupported content type {content_type:?}"),
        )
            .into_response();
    }

    let message = match AgentToServer::decode(body) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "Failed to decode AgentToServer");
            return (StatusCode::BAD_REQUEST, format!("invalid message: {e}")).into_response();
        }
    };

    let device_id = headers
        .get(DEVICE_ID_HEADER)
        .and_then(|v| v.to_str().ok());

    match server.handle_message(device_id, message).await {
        Ok(response) => (
            StatusCode::OK,
            [(CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)],
            response.encode_to_vec(),
        )
            .into_response(),
        Err(e) => (e.status_code(), e.to_string()).into_response(),
    }
}

/// Router exposing the OpAMP endpoint
pub fn opamp_router(server: Arc<OpampServer>) -> Router {
    Router::new()
        .route(OPAMP_PATH, post(opamp))
        .with_state(server)
}

/// Serve OpAMP on an already bound listener until shutdown is broadcast
pub async fn serve(
    listener: TcpListener,
    server: Arc<OpampServer>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = opamp_router(server);
    info!(addr = %listener.local_addr()?, "Starting OpAMP server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    info!("OpAMP server stopped");
    Ok(())
}
