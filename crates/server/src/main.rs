//! OpAMP server - node-local instrumentation control plane
//!
//! This binary runs as a DaemonSet on each Kubernetes node, serving
//! remote configuration to instrumented processes on that node.

use anyhow::{Context, Result};
use server_lib::{
    api::{self, AppState},
    cluster::{ClusterReader, KubeClusterReader},
    connection::ConnectionRegistry,
    deviceid::{DeviceIdentityCache, KubeletConfig, KubeletPodResources, WorkloadIdentityResolver},
    health::{components, HealthRegistry},
    observability::{ServerMetrics, StructuredLogger},
    reconcile::{ConfigFanout, ReconcilerConfig, Reconcilers},
    sdkconfig::RemoteConfigComputer,
    server::{ConnectionHandlers, KubeStatusWriter, OpampServer, StaleConnectionSweeper},
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting opamp-server");

    // Load configuration
    let config = config::ServerConfig::load()?;
    info!(
        node_name = %config.node_name,
        namespace = %config.odigos_namespace,
        "Server configured"
    );

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::DEVICE_CACHE).await;
    health_registry.register(components::OPAMP_SERVER).await;
    health_registry.register(components::RECONCILERS).await;

    // Register metrics before the first scrape
    let _metrics = ServerMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Health and metrics come up first so kubelet checks see the startup
    let api_listener = TcpListener::bind(("0.0.0.0", config.api_port))
        .await
        .with_context(|| format!("binding API port {}", config.api_port))?;
    let app_state = Arc::new(AppState::new(health_registry.clone()));
    let api_handle = tokio::spawn(api::serve(
        api_listener,
        app_state,
        shutdown_tx.subscribe(),
    ));

    let client = kube::Client::try_default().await?;
    let cluster: Arc<dyn ClusterReader> = Arc::new(KubeClusterReader::new(
        client.clone(),
        &config.odigos_namespace,
        &config.collectors_group_name,
        config.kube_api_timeout(),
    ));

    // Without the device plugin no agent can be identified
    let kubelet = KubeletPodResources::connect(KubeletConfig {
        socket_path: PathBuf::from(&config.pod_resources_socket),
        resource_name_prefix: config.resource_name_prefix.clone(),
        connect_timeout: config.kubelet_timeout(),
        list_timeout: config.kubelet_timeout(),
    })
    .await?;
    let devices = Arc::new(
        DeviceIdentityCache::new(
            Arc::new(kubelet),
            WorkloadIdentityResolver::new(cluster.clone()),
        )
        .await?,
    );
    health_registry.set_healthy(components::DEVICE_CACHE).await;

    let computer = Arc::new(RemoteConfigComputer::new(cluster, &config.node_name));
    let registry = Arc::new(ConnectionRegistry::new(config.heartbeat_interval()));
    let status_writer = Arc::new(KubeStatusWriter::new(
        client.clone(),
        config.kube_api_timeout(),
    ));

    let handlers = Arc::new(ConnectionHandlers::new(
        devices,
        computer.clone(),
        registry.clone(),
        status_writer,
        logger.clone(),
    ));

    let fanout = ConfigFanout::new(registry, computer, logger.clone());
    let reconcilers = Reconcilers::new(
        client,
        ReconcilerConfig {
            namespace: config.odigos_namespace.clone(),
            collectors_group_name: config.collectors_group_name.clone(),
        },
        fanout,
        health_registry.clone(),
    );
    let reconciler_handles = reconcilers.spawn(&shutdown_tx);
    health_registry.set_healthy(components::RECONCILERS).await;

    let sweeper = StaleConnectionSweeper::new(handlers.clone());
    let sweep_handle = tokio::spawn(sweeper.run(shutdown_tx.subscribe()));

    // Agents cannot be served without the port, so a bind failure aborts startup
    let opamp_listener = TcpListener::bind(("0.0.0.0", config.opamp_port))
        .await
        .with_context(|| format!("binding OpAMP port {}", config.opamp_port))?;
    let server = Arc::new(OpampServer::new(handlers.clone()));
    let opamp_handle = tokio::spawn(server_lib::server::serve(
        opamp_listener,
        server,
        shutdown_tx.subscribe(),
    ));
    health_registry.set_healthy(components::OPAMP_SERVER).await;

    logger.log_startup(SERVER_VERSION, config.opamp_port);

    // Mark server as ready after initialization
    health_registry.set_ready(true).await;

    // Wait for shutdown signal
    let mut sigterm = signal(SignalKind::terminate())?;
    let reason = tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT received",
        _ = sigterm.recv() => "SIGTERM received",
    };

    health_registry.set_ready(false).await;
    logger.log_shutdown(reason, handlers.registry().len());
    let _ = shutdown_tx.send(());

    for handle in [opamp_handle, api_handle] {
        match handle.await {
            Ok(Err(e)) => warn!(error = %e, "HTTP server exited with error"),
            Err(e) => warn!(error = %e, "HTTP server task panicked"),
            Ok(Ok(())) => {}
        }
    }
    let _ = sweep_handle.await;
    for handle in reconciler_handles {
        let _ = handle.await;
    }

    let unloaded = handlers.unload_all();
    info!(connections = unloaded, "Shutdown complete");

    Ok(())
}
