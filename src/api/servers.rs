use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::model::UpstreamServer;
use crate::AppState;

/// GET /api/servers — probe each upstream concurrently, return status +
/// response_time_ms.
pub async fn list_servers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let servers: Vec<UpstreamServer> = state.servers.read().await.values().cloned().collect();

    let probes = servers.into_iter().map(|server| async move {
        let start = Instant::now();
        let healthy = crate::upstream::tts_health(&server.base_url).await;
        let elapsed_ms = start.elapsed().as_millis();
        json!({
            "id": server.id,
            "name": server.name,
            "base_url": server.base_url,
            "status": if healthy { "online" } else { "offline" },
            "response_time_ms": elapsed_ms,
        })
    });

    let results: Vec<_> = join_all(probes).await;
    Json(json!({"servers": results}))
}

#[derive(Debug, Deserialize)]
pub struct AddServerBody {
    pub id: String,
    pub name: String,
    pub base_url: String,
}

/// POST /api/servers — add an entry to the upstream registry.
pub async fn add_server(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddServerBody>,
) -> ApiResult<impl IntoResponse> {
    if body.id.trim().is_empty() {
        return Err(ApiError::Validation("id is required".to_string()));
    }
    let server = UpstreamServer {
        id: body.id.clone(),
        name: body.name,
        base_url: body.base_url,
    };
    state.servers.write().await.insert(body.id, server.clone());
    state
        .broadcaster
        .broadcast("server_added", serde_json::to_value(&server).unwrap_or(serde_json::Value::Null))
        .await;
    Ok(Json(json!({"ok": true})))
}

/// DELETE /api/servers/{id} — remove an entry from the upstream registry.
pub async fn remove_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let removed = state.servers.write().await.remove(&id);
    if removed.is_none() {
        return Err(ApiError::NotFound(format!("no such server '{id}'")));
    }
    state.broadcaster.broadcast("server_deleted", json!({"id": id})).await;
    Ok(Json(json!({"ok": true})))
}
