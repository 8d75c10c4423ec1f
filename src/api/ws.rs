//! WebSocket upgrade handler for the Broadcaster (C7). Grounded on
//! `proxy/streaming.rs`'s accept-then-forward-until-disconnect shape; the
//! outbound side drains this peer's individually addressed `mpsc` queue
//! (registered with `Broadcaster`) instead of a shared broadcast receiver.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use serde_json::json;

use crate::AppState;

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let (peer_id, mut rx) = state.broadcaster.register().await;

    let counters = state.telemetry.counters().await;
    state
        .broadcaster
        .send_to(
            peer_id,
            "connection_established",
            json!({
                "total_logs": counters.total,
                "errors": counters.errors,
                "warnings": counters.warnings,
                "peer_count": state.broadcaster.peer_count().await,
            }),
        )
        .await;

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(envelope) => {
                        let text = envelope.to_string();
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if text.trim() == "ping" || text.contains("\"ping\"") {
                            let pong = json!({"type": "pong", "data": {}, "timestamp": chrono::Utc::now()});
                            if socket.send(Message::Text(pong.to_string().into())).await.is_err() {
                                break;
                            }
                        }
                        // Per-feature subscribe messages are ignored; this
                        // port broadcasts universally (SPEC_FULL §4.6, §9).
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.broadcaster.remove_peer(peer_id).await;
}
