//! WebSocket and control server.
//!
//! Exposes `/ws` for viewer sessions, `/health` for liveness, and
//! `POST /shutdown` as the administrative trigger for the shutdown
//! coordinator. Each accepted socket gets its own send task fed from
//! the session's outbound queue, so the hub never blocks on a slow
//! socket.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    routing::{get, post},
    Json, Router,
};
use colored::Colorize;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::hub::{BroadcastHub, OutboundFrame};

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub shutdown_tx: mpsc::Sender<()>,
}

/// Build the router for the sync server.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "docsync server" }))
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/shutdown", post(shutdown))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until a shutdown is requested via `POST /shutdown`
/// or the returned trigger channel.
pub async fn serve(port: u16, hub: Arc<BroadcastHub>, mut shutdown_rx: mpsc::Receiver<()>, shutdown_tx: mpsc::Sender<()>) -> Result<()> {
    let state = AppState {
        hub,
        shutdown_tx,
    };
    let app = router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    println!(
        "{} Sync server listening at {}",
        "✓".green(),
        format!("ws://{}/ws", addr).bright_blue()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            debug!("serve loop stopping");
        })
        .await?;
    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.hub.session_count(),
        "session_stats": state.hub.session_stats(),
    }))
}

async fn shutdown(State(state): State<AppState>) -> Json<&'static str> {
    let _ = state.shutdown_tx.send(()).await;
    Json("shutting down")
}

async fn ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(state, socket))
}

async fn handle_ws(state: AppState, socket: WebSocket) {
    let (id, mut outbound_rx) = state.hub.register();
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Drain the session's queue onto the socket. Ends on Close frame,
    // socket failure, or the session being unregistered (queue closed).
    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            match frame {
                OutboundFrame::Text(text) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        debug!("socket write failed, client gone");
                        break;
                    }
                }
                OutboundFrame::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // This subsystem defines no client → server messages; inbound
    // frames only feed liveness tracking until the peer closes.
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Close(_)) => break,
            Ok(_) => state.hub.touch(id),
            Err(err) => {
                warn!("session {} socket error: {}", id, err);
                break;
            }
        }
    }

    state.hub.unregister(id);
    // Unregistering dropped the queue sender, so the send task ends on
    // its own; await it to finish the close handshake.
    let _ = send_task.await;
    debug!("session {} task finished", id);
}
