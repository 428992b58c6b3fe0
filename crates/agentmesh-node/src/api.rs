//! Local control plane for a co-located client process.
//!
//! Four operations, HTTP + WebSocket:
//!   GET  /ws/events      — event stream; first frame is `ready`
//!   POST /messages/send  — send a message, returns { messageId }
//!   GET  /agents         — directory snapshot
//!   POST /stop           — graceful shutdown
//!
//! The channel is expected to be local; there is no client authentication.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use agentmesh_protocol::Address;

use crate::node::{NodeHandle, SendError};

// ============================================================================
// Events
// ============================================================================

/// Events fanned out to connected API streams, in the order the node
/// observed them. Delivery is lossy: a slow or disconnected client misses
/// events, there is no replay.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum P2PEvent {
    Ready { peer_id: String },
    PeerConnected { peer_id: String },
    Message {
        message_id: String,
        from: String,
        to: String,
        content: String,
        timestamp_ms: u64,
    },
    Error { code: String, message: String },
}

// ============================================================================
// Request / response bodies
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub to: String,
    pub content: String,
    pub conversation_id: Option<String>,
    pub reply_to: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub message_id: String,
}

// ============================================================================
// Server
// ============================================================================

pub async fn serve(handle: NodeHandle, addr: SocketAddr) {
    let router = Router::new()
        .route("/ws/events", get(ws_events_handler))
        .route("/messages/send", post(send_message))
        .route("/agents", get(list_agents))
        .route("/stop", post(stop))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(handle);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("API listener bind failed on {addr}: {e}");
            return;
        }
    };
    tracing::info!("local API listening on http://{addr}");

    if let Err(e) = axum::serve(listener, router).await {
        tracing::error!("API server error: {e}");
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn ws_events_handler(
    ws: WebSocketUpgrade,
    State(handle): State<NodeHandle>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| ws_events_task(socket, handle))
}

async fn ws_events_task(mut socket: WebSocket, handle: NodeHandle) {
    // Subscribe before the ready frame so nothing published in between is
    // missed by this stream.
    let mut rx = handle.subscribe();

    let ready = P2PEvent::Ready { peer_id: handle.peer_id().to_string() };
    if send_event(&mut socket, &ready).await.is_err() {
        return;
    }

    loop {
        match rx.recv().await {
            Ok(event) => {
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
            // This stream lagged; drop the missed events and move on.
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &P2PEvent) -> Result<(), ()> {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.map_err(|_| ()),
        Err(e) => {
            tracing::warn!("event serialize error: {e}");
            Ok(())
        }
    }
}

async fn send_message(
    State(handle): State<NodeHandle>,
    Json(req): Json<SendMessageRequest>,
) -> impl IntoResponse {
    let to: Address = match req.to.parse() {
        Ok(address) => address,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("to: {e}") })),
            );
        }
    };

    match handle
        .send_message(to, req.content.into_bytes(), req.conversation_id, req.reply_to)
        .await
    {
        Ok(message_id) => (
            StatusCode::OK,
            Json(serde_json::json!(SendMessageResponse { message_id })),
        ),
        Err(e) => {
            let status = match &e {
                SendError::NoRoute(_) => StatusCode::NOT_FOUND,
                SendError::Encryption(_) => StatusCode::INTERNAL_SERVER_ERROR,
                SendError::PublishFailed(_) => StatusCode::BAD_GATEWAY,
            };
            (status, Json(serde_json::json!({ "error": e.to_string(), "code": e.code() })))
        }
    }
}

async fn list_agents(State(handle): State<NodeHandle>) -> impl IntoResponse {
    let agents = handle.list_agents().await;
    Json(serde_json::json!({ "agents": agents }))
}

async fn stop(State(handle): State<NodeHandle>) -> impl IntoResponse {
    handle.stop().await;
    Json(serde_json::json!({}))
}
