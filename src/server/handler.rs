//! WebSocket connection handlers and HTTP introspection endpoints.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json,
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::broker::Outbound;

use super::state::AppState;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>, remote_addr: SocketAddr) {
    let connection_id = state.broker.connect(&remote_addr.to_string()).await;

    // The writer task owns the receiving end; the broker reaches this socket
    // only through the transport.
    let (tx, mut rx) = mpsc::channel(state.broker.config().send_buffer);
    state.transport.attach(connection_id, tx).await;

    let (mut sender, mut receiver) = socket.split();

    // Receive frames from this client and feed them to the broker
    let broker = state.broker.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!("WebSocket error on '{}': {}", connection_id, e);
                    break;
                }
            };

            match msg {
                Message::Text(text) => {
                    broker.handle_frame(connection_id, text.as_str()).await;
                }
                Message::Pong(_) => {
                    broker.touch(connection_id).await;
                }
                Message::Ping(_) => {
                    // The protocol pongs automatically; it still proves life
                    broker.touch(connection_id).await;
                }
                Message::Close(_) => {
                    tracing::info!("Connection '{}' requested close", connection_id);
                    break;
                }
                _ => {}
            }
        }
    });

    // Drain the broker's outbound channel into the socket. The channel
    // closing (overflow detach or broker-initiated close) ends this task.
    let mut send_task = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let result = match item {
                Outbound::Text(frame) => sender.send(Message::Text(frame.into())).await,
                Outbound::Ping => sender.send(Message::Ping(Vec::new().into())).await,
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    // If any one of the tasks completes, abort the other
    tokio::select! {
        _ = &mut recv_task => send_task.abort(),
        _ = &mut send_task => recv_task.abort(),
    };

    state.transport.detach(connection_id).await;
    state.broker.disconnect(connection_id).await;
}

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let connections = state.broker.connection_count().await;
    Json(serde_json::json!({"status": "ok", "connections": connections}))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: String,
    pub name: String,
    pub visibility: crate::domain::Visibility,
    pub member_count: usize,
    pub created_at: i64,
}

/// Get list of rooms
pub async fn get_rooms(State(state): State<Arc<AppState>>) -> Json<Vec<RoomSummary>> {
    let mut rooms: Vec<RoomSummary> = state
        .broker
        .rooms_snapshot()
        .await
        .into_iter()
        .map(|room| RoomSummary {
            id: room.id.to_string(),
            name: room.name,
            visibility: room.visibility,
            member_count: room.members.len(),
            created_at: room.created_at,
        })
        .collect();
    rooms.sort_by(|a, b| a.id.cmp(&b.id));
    Json(rooms)
}
