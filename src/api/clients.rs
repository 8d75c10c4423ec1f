use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::AppState;

/// GET /api/clients — list with `status` refreshed from `last_seen`.
pub async fn list_clients(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({"clients": state.telemetry.list_clients().await}))
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatBody {
    pub client_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// POST /api/clients/heartbeat — upsert client device/config info.
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<std::net::SocketAddr>>,
    Json(body): Json<HeartbeatBody>,
) -> impl IntoResponse {
    let ip = connect_info.map(|c| c.0.ip().to_string());
    state
        .telemetry
        .touch_client(&body.client_id, body.display_name.as_deref(), ip.as_deref(), 0)
        .await;
    state
        .broadcaster
        .broadcast("client_update", json!({"client_id": body.client_id}))
        .await;
    Json(json!({"ok": true}))
}
