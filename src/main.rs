//! Spacedeck coordinator.
//!
//! Hosts the authoritative live registry of a shared spatial session and
//! fans accepted changes out to every connected replica over a binary
//! WebSocket protocol, with a JSON text fallback for debugging.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use spacedeck::sync::protocol::{ClientMessage, ServerMessage, WireProtocol, PROTOCOL_VERSION};
use spacedeck::sync::{SyncServer, SyncServerConfig};

/// Shared application state
pub struct AppState {
    sync_server: Arc<SyncServer>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    protocol_version: u8,
    uptime_seconds: u64,
    live_objects: usize,
    active_peers: usize,
    present_users: usize,
}

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.sync_server.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: stats.uptime_seconds,
        live_objects: stats.live_objects,
        active_peers: stats.active_peers,
        present_users: stats.present_users,
    })
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle one replica connection for its whole lifetime.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let peer_id = uuid::Uuid::new_v4().to_string();
    info!("New WebSocket connection: peer={}", peer_id);

    // Channel the coordinator pushes outbound messages into
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Registration sends the Welcome / FullSnapshot / PresenceRoster
    // bootstrap sequence into the channel before the peer is visible.
    if let Err(e) = state.sync_server.register_peer(&peer_id, tx) {
        error!("Failed to register peer {}: {}", peer_id, e);
        return;
    }

    let peer_id_recv = peer_id.clone();
    let peer_id_send = peer_id.clone();
    let state_recv = state.clone();

    // Forward coordinator messages to the socket as binary frames
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match WireProtocol::encode_server(&msg) {
                Ok(bytes) => {
                    if ws_sender.send(Message::Binary(bytes.to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to encode message: {}", e);
                }
            }
        }
        debug!("Send task ended for peer {}", peer_id_send);
    });

    // Decode inbound frames and hand them to the sync server
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => match WireProtocol::decode_client(&data) {
                    Ok(client_msg) => {
                        state_recv.sync_server.handle_message(&peer_id_recv, client_msg);
                    }
                    Err(e) => {
                        warn!("Failed to decode binary message from {}: {}", peer_id_recv, e);
                    }
                },
                Message::Text(text) => {
                    // JSON fallback for debugging clients
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(client_msg) => {
                            state_recv.sync_server.handle_message(&peer_id_recv, client_msg);
                        }
                        Err(e) => {
                            warn!("Failed to decode text message from {}: {}", peer_id_recv, e);
                        }
                    }
                }
                Message::Close(_) => {
                    info!("WebSocket closed by client: {}", peer_id_recv);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
        debug!("Receive task ended for peer {}", peer_id_recv);
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    state.sync_server.unregister_peer(&peer_id);
    info!("Peer {} disconnected", peer_id);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spacedeck=info,tower_http=info".into()),
        )
        .init();

    dotenvy::dotenv().ok();

    let sync_server = Arc::new(SyncServer::new(SyncServerConfig::default()));
    let _cleanup_handle = sync_server.clone().start_background_tasks();

    let state = Arc::new(AppState {
        sync_server: sync_server.clone(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("Spacedeck coordinator v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Protocol version: {}", PROTOCOL_VERSION);
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
