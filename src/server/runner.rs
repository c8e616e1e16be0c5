//! Server execution logic.

use std::{net::SocketAddr, sync::Arc};

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::broker::{AuthValidator, Broker, BrokerConfig, ChannelTransport, HeartbeatSupervisor};
use crate::common::time::SystemClock;

use super::{
    handler::{get_rooms, health_check, websocket_handler},
    signal::shutdown_signal,
    state::AppState,
};

/// Run the WebSocket broker server
///
/// # Arguments
///
/// * `host` - The host address to bind to (e.g., "127.0.0.1")
/// * `port` - The port number to bind to (e.g., 8080)
/// * `config` - Broker tuning parameters
/// * `auth` - Credential validator for AUTHENTICATE frames
pub async fn run_server(
    host: String,
    port: u16,
    config: BrokerConfig,
    auth: Arc<dyn AuthValidator>,
) -> Result<(), Box<dyn std::error::Error>> {
    let transport = ChannelTransport::new();
    let broker = Arc::new(Broker::new(
        config,
        transport.clone(),
        auth,
        Arc::new(SystemClock),
    ));

    let heartbeat = HeartbeatSupervisor::new(broker.clone()).spawn();

    let app_state = Arc::new(AppState { broker, transport });

    let app = Router::new()
        .route("/ws", get(websocket_handler))
        .route("/api/health", get(health_check))
        .route("/api/rooms", get(get_rooms))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let bind_addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    tracing::info!(
        "WebSocket broker server listening on {}",
        listener.local_addr()?
    );
    tracing::info!("Connect to: ws://{}/ws", bind_addr);
    tracing::info!("Press Ctrl+C to shutdown gracefully");

    // Set up graceful shutdown signal handler
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    heartbeat.abort();
    tracing::info!("Server shutdown complete");

    Ok(())
}
