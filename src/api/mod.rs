pub mod clients;
pub mod history;
pub mod logs;
pub mod metrics;
pub mod power;
pub mod resources;
pub mod servers;
pub mod services;
pub mod stats;
pub mod ws;

use std::sync::Arc;

use axum::http::Method;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Assembles the full HTTP/WS surface (C8). Stateless translation layer:
/// every handler below does method/path dispatch and JSON (de)serialization
/// only, delegating all actual behavior to the core subsystems reachable
/// through `AppState` (SPEC_FULL §4.7).
pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(stats::health))
        .route("/api/stats", get(stats::api_stats))
        .route(
            "/api/logs",
            get(logs::list_logs).post(logs::ingest_logs).delete(logs::clear_logs),
        )
        .route("/log", axum::routing::post(logs::ingest_logs))
        .route(
            "/api/metrics",
            get(metrics::list_metrics).post(metrics::ingest_metrics),
        )
        .route("/api/clients", get(clients::list_clients))
        .route("/api/clients/heartbeat", axum::routing::post(clients::heartbeat))
        .route(
            "/api/servers",
            get(servers::list_servers).post(servers::add_server),
        )
        .route("/api/servers/{id}", axum::routing::delete(servers::remove_server))
        .route("/api/services", get(services::list_services))
        .route(
            "/api/services/{id}/{action}",
            axum::routing::post(services::service_action),
        )
        .route(
            "/api/services/{bulk_action}",
            axum::routing::post(services::bulk_action),
        )
        .route(
            "/api/power/profiles",
            get(power::list_profiles).post(power::create_profile),
        )
        .route(
            "/api/power/profiles/{id}",
            axum::routing::put(power::update_profile).delete(power::delete_profile),
        )
        .route(
            "/api/power/profiles/{id}/activate",
            axum::routing::post(power::activate_profile),
        )
        .route("/api/power/status", get(power::status))
        .route("/api/power/activity", axum::routing::post(power::activity))
        .route(
            "/api/power/keep-awake",
            axum::routing::post(power::keep_awake).delete(power::cancel_keep_awake),
        )
        .route("/api/power/force-tier", axum::routing::post(power::force_tier))
        .route("/api/resources/current", get(resources::current))
        .route("/api/resources/summary", get(resources::summary))
        .route("/api/resources/history", get(resources::history))
        .route("/api/metrics-history/hourly", get(history::hourly))
        .route("/api/metrics-history/daily", get(history::daily))
        .route("/api/metrics-history/summary", get(history::summary))
        .route("/ws", get(ws::upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers(Any),
        )
        .with_state(state)
}
