use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// GET /api/services — supervised-services table with refreshed status and
/// memory accounting.
pub async fn list_services(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.supervisor.reconcile().await;
    let services: Vec<_> = state
        .supervisor
        .list()
        .await
        .into_iter()
        .map(|(spec, runtime)| json!({"spec": spec, "runtime": runtime}))
        .collect();
    Json(json!({
        "services": services,
        "total_memory_mb": state.supervisor.memory_totals_mb().await,
    }))
}

/// POST /api/services/{id}/{action} — start/stop/restart a single service.
pub async fn service_action(
    State(state): State<Arc<AppState>>,
    Path((id, action)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let result = match action.as_str() {
        "start" => state.supervisor.start(&id).await,
        "stop" => state.supervisor.stop(&id).await,
        "restart" => state.supervisor.restart(&id).await,
        other => return Err(ApiError::Validation(format!("unknown action '{other}'"))),
    };
    result?;
    state
        .broadcaster
        .broadcast("service_update", json!({"service": id, "action": action}))
        .await;
    Ok(Json(json!({"ok": true})))
}

/// POST /api/services/{start-all|stop-all} — bulk operation.
pub async fn bulk_action(
    State(state): State<Arc<AppState>>,
    Path(bulk_action): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let results = match bulk_action.as_str() {
        "start-all" => state.supervisor.start_all().await,
        "stop-all" => state.supervisor.stop_all().await,
        other => return Err(ApiError::Validation(format!("unknown bulk action '{other}'"))),
    };
    let failures: Vec<String> = results
        .iter()
        .filter_map(|(id, r)| r.as_ref().err().map(|e| format!("{id}: {e}")))
        .collect();
    state
        .broadcaster
        .broadcast("service_update", json!({"bulk_action": bulk_action}))
        .await;
    Ok(Json(json!({"ok": true, "failures": failures})))
}
