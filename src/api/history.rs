use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct DaysParams {
    pub days: Option<i64>,
}

/// GET /api/metrics-history/hourly — last N days of hourly buckets.
pub async fn hourly(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DaysParams>,
) -> impl IntoResponse {
    Json(json!({"buckets": state.metrics_history.hourly_history(params.days.unwrap_or(7)).await}))
}

/// GET /api/metrics-history/daily — last N days of daily buckets.
pub async fn daily(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DaysParams>,
) -> impl IntoResponse {
    Json(json!({"buckets": state.metrics_history.daily_history(params.days.unwrap_or(30)).await}))
}

/// GET /api/metrics-history/summary — today/yesterday/this-week view.
pub async fn summary(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics_history.summary().await)
}
