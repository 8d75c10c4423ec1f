use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::AppState;

/// GET /api/resources/current
pub async fn current(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.resource_monitor.snapshot_current().await {
        Some((power, processes)) => Json(json!({"power": power, "processes": processes})),
        None => Json(json!({"power": null, "processes": []})),
    }
}

/// GET /api/resources/summary
pub async fn summary(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!(state.resource_monitor.summary().await))
}

#[derive(Debug, Deserialize, Default)]
pub struct HistoryParams {
    pub limit: Option<usize>,
}

/// GET /api/resources/history
pub async fn history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    let (power, processes) = state.resource_monitor.history(params.limit.unwrap_or(60)).await;
    Json(json!({"power": power, "processes": processes}))
}
