use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiResult;
use crate::model::{EnergyTier, PowerProfile};
use crate::AppState;

/// GET /api/power/profiles
pub async fn list_profiles(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "profiles": state.idle.list_profiles().await,
        "active": state.idle.status().await.get("active_profile").cloned(),
    }))
}

/// POST /api/power/profiles — create a custom profile.
pub async fn create_profile(
    State(state): State<Arc<AppState>>,
    Json(profile): Json<PowerProfile>,
) -> ApiResult<impl IntoResponse> {
    state.idle.create_profile(profile).await?;
    Ok(Json(json!({"ok": true})))
}

/// PUT /api/power/profiles/{id}
pub async fn update_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<PowerProfile>,
) -> ApiResult<impl IntoResponse> {
    state.idle.update_profile(&id, update).await?;
    Ok(Json(json!({"ok": true})))
}

/// DELETE /api/power/profiles/{id}
pub async fn delete_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.idle.delete_profile(&id).await?;
    Ok(Json(json!({"ok": true})))
}

/// POST /api/power/profiles/{id}/activate
pub async fn activate_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.idle.activate_profile(&id).await?;
    state
        .broadcaster
        .broadcast("power_tier_changed", json!({"active_profile": id}))
        .await;
    Ok(Json(json!({"ok": true})))
}

/// GET /api/power/status
pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.idle.status().await)
}

#[derive(Debug, Deserialize)]
pub struct ActivityBody {
    pub kind: String,
}

/// POST /api/power/activity
pub async fn activity(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ActivityBody>,
) -> impl IntoResponse {
    state.idle.record_activity(&body.kind).await;
    Json(json!({"ok": true}))
}

#[derive(Debug, Deserialize)]
pub struct KeepAwakeBody {
    pub duration_seconds: u64,
}

/// POST /api/power/keep-awake
pub async fn keep_awake(
    State(state): State<Arc<AppState>>,
    Json(body): Json<KeepAwakeBody>,
) -> impl IntoResponse {
    state
        .idle
        .keep_awake(Duration::from_secs(body.duration_seconds))
        .await;
    Json(json!({"ok": true}))
}

/// DELETE /api/power/keep-awake
pub async fn cancel_keep_awake(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.idle.cancel_keep_awake().await;
    Json(json!({"ok": true}))
}

#[derive(Debug, Deserialize)]
pub struct ForceTierBody {
    pub tier: EnergyTier,
}

/// POST /api/power/force-tier
pub async fn force_tier(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ForceTierBody>,
) -> impl IntoResponse {
    state.idle.force_tier(body.tier).await;
    state
        .broadcaster
        .broadcast("power_tier_changed", json!({"tier": body.tier}))
        .await;
    Json(json!({"ok": true}))
}
