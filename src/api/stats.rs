use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde_json::json;

use crate::AppState;

/// GET /health — liveness probe.
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /api/stats — aggregate counters, uptime, and a recent-hour
/// derivation drawn straight from the metrics history aggregator.
pub async fn api_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let counters = state.telemetry.counters().await;
    let uptime_seconds = (Utc::now() - state.start_time).num_seconds().max(0);
    let current_tier = state.idle.current_tier().await;
    let resource_summary = state.resource_monitor.summary().await;

    Json(json!({
        "uptime_seconds": uptime_seconds,
        "total_logs_received": counters.total,
        "warnings_count": counters.warnings,
        "errors_count": counters.errors,
        "power_tier": current_tier,
        "resources": resource_summary,
        "connected_clients": state.telemetry.list_clients().await.len(),
    }))
}
