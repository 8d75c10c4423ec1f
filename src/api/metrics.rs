use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::telemetry::NewMetricsSnapshot;
use crate::AppState;

#[derive(Debug, Deserialize)]
struct MetricsBody {
    client_id: Option<String>,
    #[serde(default)]
    stt_latency_ms: Option<f64>,
    #[serde(default)]
    llm_ttft_ms: Option<f64>,
    #[serde(default)]
    tts_ttfb_ms: Option<f64>,
    #[serde(default)]
    end_to_end_ms: Option<f64>,
    #[serde(default)]
    cost_usd: Option<f64>,
    #[serde(default)]
    thermal_events: u32,
    #[serde(default)]
    network_events: u32,
    #[serde(default)]
    raw: Value,
}

/// POST /api/metrics — ingest one `MetricsSnapshot`.
pub async fn ingest_metrics(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MetricsBody>,
) -> ApiResult<impl IntoResponse> {
    let client_id = body
        .client_id
        .clone()
        .ok_or_else(|| ApiError::Validation("client_id is required".to_string()))?;

    let snapshots = state
        .telemetry
        .ingest_metrics(
            &client_id,
            vec![NewMetricsSnapshot {
                stt_latency_ms: body.stt_latency_ms,
                llm_ttft_ms: body.llm_ttft_ms,
                tts_ttfb_ms: body.tts_ttfb_ms,
                end_to_end_ms: body.end_to_end_ms,
                cost_usd: body.cost_usd,
                thermal_events: body.thermal_events,
                network_events: body.network_events,
                raw: body.raw,
            }],
        )
        .await;

    if let Some(snap) = snapshots.first() {
        state
            .broadcaster
            .broadcast("metrics", serde_json::to_value(snap).unwrap_or(Value::Null))
            .await;
    }

    Ok(Json(json!({"ingested": snapshots.len()})))
}

#[derive(Debug, Deserialize, Default)]
pub struct MetricsListParams {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

/// GET /api/metrics — paged snapshots plus derived medians/totals.
pub async fn list_metrics(
    State(state): State<Arc<AppState>>,
    Query(params): Query<MetricsListParams>,
) -> impl IntoResponse {
    let (page, total) = state
        .telemetry
        .recent_metrics(params.limit.unwrap_or(100), params.offset.unwrap_or(0))
        .await;

    let mut e2e: Vec<f64> = page.iter().filter_map(|m| m.end_to_end_ms).collect();
    let mut llm: Vec<f64> = page.iter().filter_map(|m| m.llm_ttft_ms).collect();
    let mut stt: Vec<f64> = page.iter().filter_map(|m| m.stt_latency_ms).collect();
    let mut tts: Vec<f64> = page.iter().filter_map(|m| m.tts_ttfb_ms).collect();
    let total_cost: f64 = page.iter().filter_map(|m| m.cost_usd).sum();

    Json(json!({
        "metrics": page,
        "total": total,
        "averages": {
            "end_to_end_ms_median": median(&mut e2e),
            "llm_ttft_ms_median": median(&mut llm),
            "stt_latency_ms_median": median(&mut stt),
            "tts_ttfb_ms_median": median(&mut tts),
            "total_cost_usd": total_cost,
        }
    }))
}
