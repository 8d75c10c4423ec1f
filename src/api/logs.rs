use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::model::LogLevel;
use crate::telemetry::{LogQuery, NewLogEntry};
use crate::AppState;

fn client_identity(headers: &HeaderMap) -> (String, Option<String>) {
    let id = headers
        .get("X-Client-ID")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let name = headers
        .get("X-Client-Name")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    (id, name)
}

#[derive(Debug, Deserialize)]
struct LogEntryBody {
    #[serde(default)]
    wall_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default = "default_level")]
    level: LogLevel,
    #[serde(default)]
    label: String,
    message: String,
    #[serde(default)]
    source_file: Option<String>,
    #[serde(default)]
    source_function: Option<String>,
    #[serde(default)]
    source_line: Option<u32>,
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

fn default_level() -> LogLevel {
    LogLevel::Info
}

impl From<LogEntryBody> for NewLogEntry {
    fn from(b: LogEntryBody) -> Self {
        NewLogEntry {
            wall_timestamp: b.wall_timestamp,
            level: b.level,
            label: b.label,
            message: b.message,
            source_file: b.source_file,
            source_function: b.source_function,
            source_line: b.source_line,
            metadata: b.metadata,
        }
    }
}

/// POST /api/logs (alias /log) — ingest one entry or a batch array.
pub async fn ingest_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let (client_id, client_name) = client_identity(&headers);

    let entries: Vec<NewLogEntry> = if body.is_array() {
        serde_json::from_value::<Vec<LogEntryBody>>(body)
            .map_err(|e| ApiError::Validation(format!("invalid log batch: {e}")))?
            .into_iter()
            .map(Into::into)
            .collect()
    } else {
        let entry: LogEntryBody = serde_json::from_value(body)
            .map_err(|e| ApiError::Validation(format!("invalid log entry: {e}")))?;
        vec![entry.into()]
    };

    let finished = state
        .telemetry
        .ingest_logs(&client_id, client_name.as_deref(), entries)
        .await;

    for entry in &finished {
        state
            .broadcaster
            .broadcast("log", serde_json::to_value(entry).unwrap_or(Value::Null))
            .await;
    }
    state
        .broadcaster
        .broadcast(
            "client_update",
            json!({"client_id": client_id}),
        )
        .await;

    Ok(Json(json!({"ingested": finished.len()})))
}

#[derive(Debug, Deserialize, Default)]
pub struct LogListParams {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub level: Option<String>,
    pub search: Option<String>,
    pub client_id: Option<String>,
    pub label: Option<String>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
}

/// GET /api/logs
pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogListParams>,
) -> impl IntoResponse {
    let levels = params.level.map(|s| {
        s.split(',')
            .filter_map(|l| serde_json::from_value(Value::String(l.trim().to_uppercase())).ok())
            .collect::<Vec<LogLevel>>()
    });

    let query = LogQuery {
        levels,
        search: params.search,
        client_id: params.client_id,
        label_prefix: params.label,
        since: params.since,
        limit: params.limit.unwrap_or(100),
        offset: params.offset.unwrap_or(0),
    };

    let (entries, total) = state.telemetry.query_logs(&query).await;
    Json(json!({"logs": entries, "total": total}))
}

/// DELETE /api/logs — clear ring, reset counters, broadcast `logs_cleared`.
pub async fn clear_logs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.telemetry.clear_logs().await;
    state.broadcaster.broadcast("logs_cleared", json!({})).await;
    Json(json!({"cleared": true}))
}
