mod api;
mod broadcast;
mod config;
mod error;
mod idle;
mod metrics_history;
mod model;
mod persist;
mod resource_monitor;
mod supervisor;
mod telemetry;
mod upstream;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::info;

use crate::broadcast::Broadcaster;
use crate::config::AppConfig;
use crate::idle::IdleStateMachine;
use crate::metrics_history::MetricsHistory;
use crate::model::{ServiceKind, ServiceSpec, UpstreamServer};
use crate::resource_monitor::ResourceMonitor;
use crate::supervisor::ServiceSupervisor;
use crate::telemetry::TelemetryIngest;

/// Shared application state available to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub resource_monitor: ResourceMonitor,
    pub metrics_history: MetricsHistory,
    pub idle: IdleStateMachine,
    pub supervisor: ServiceSupervisor,
    pub telemetry: TelemetryIngest,
    pub broadcaster: Broadcaster,
    pub servers: Arc<RwLock<HashMap<String, UpstreamServer>>>,
    pub start_time: DateTime<Utc>,
}

/// The services this daemon is willing to spawn and supervise directly.
/// Mirrors `original_source/server/management/server.py`'s
/// `_init_managed_services`: only the TTS server and the web dashboard are
/// ever spawned by this process; the LLM runtime and STT service are always
/// treated as externally-managed upstreams (see `default_servers`).
fn default_services() -> Vec<ServiceSpec> {
    vec![
        ServiceSpec {
            id: "vibevoice".to_string(),
            display_name: "VibeVoice TTS".to_string(),
            kind: ServiceKind::Tts,
            command: std::env::var("VOICELEARN_VIBEVOICE_CMD")
                .map(|cmd| cmd.split_whitespace().map(str::to_string).collect())
                .unwrap_or_else(|_| {
                    vec![
                        "python3".to_string(),
                        "vibevoice_realtime_openai_api.py".to_string(),
                        "--port".to_string(),
                        "8880".to_string(),
                    ]
                }),
            working_dir: std::env::var("VOICELEARN_VIBEVOICE_DIR").unwrap_or_else(|_| ".".to_string()),
            port: 8880,
            health_url: "http://127.0.0.1:8880/health".to_string(),
            auto_restart: true,
            env: HashMap::new(),
        },
        ServiceSpec {
            id: "dashboard".to_string(),
            display_name: "Web Dashboard".to_string(),
            kind: ServiceKind::Dashboard,
            command: std::env::var("VOICELEARN_DASHBOARD_CMD")
                .map(|cmd| cmd.split_whitespace().map(str::to_string).collect())
                .unwrap_or_else(|_| vec!["npx".to_string(), "next".to_string(), "dev".to_string()]),
            working_dir: std::env::var("VOICELEARN_DASHBOARD_DIR").unwrap_or_else(|_| ".".to_string()),
            port: 3000,
            health_url: "http://127.0.0.1:3000".to_string(),
            auto_restart: false,
            env: HashMap::new(),
        },
    ]
}

/// Upstream servers this daemon only ever probes, never spawns: the LLM
/// runtime, the STT service, and (for completeness) the gateway and
/// alternate TTS backend the original registry carried.
fn default_servers(config: &AppConfig) -> HashMap<String, UpstreamServer> {
    let mut servers = HashMap::new();
    for (id, name, base_url) in [
        ("ollama", "Ollama LLM", config.llm_base_url.clone()),
        (
            "whisper",
            "Whisper STT",
            std::env::var("VOICELEARN_STT_URL").unwrap_or_else(|_| "http://127.0.0.1:11401".to_string()),
        ),
        ("vibevoice", "VibeVoice TTS", config.tts_base_url.clone()),
    ] {
        servers.insert(
            id.to_string(),
            UpstreamServer {
                id: id.to_string(),
                name: name.to_string(),
                base_url,
            },
        );
    }
    servers
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voicelearn_mgmtd=info,tower_http=info".into()),
        )
        .init();

    info!("Starting voicelearn-mgmtd v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::from_env()?;
    info!(listen_addr = %config.listen_addr(), data_dir = %config.data_dir, "Configuration loaded");

    let resource_monitor = ResourceMonitor::new(
        default_services()
            .iter()
            .map(|s| (s.id.clone(), s.port))
            .collect(),
        HashMap::new(),
    );
    let metrics_history = MetricsHistory::new(config.metrics_hourly_path(), config.metrics_daily_path());
    let idle = IdleStateMachine::new(config.power_profiles_path());
    let supervisor = ServiceSupervisor::new(default_services());
    let telemetry = TelemetryIngest::new();
    let broadcaster = Broadcaster::new();

    wire_idle_callbacks(&idle, &config);

    supervisor.detect_existing().await;

    let servers = default_servers(&config);

    let state = Arc::new(AppState {
        config,
        resource_monitor,
        metrics_history,
        idle,
        supervisor,
        telemetry,
        broadcaster,
        servers: Arc::new(RwLock::new(servers)),
        start_time: Utc::now(),
    });

    // Top-level cancellation signal: every background loop selects on this
    // alongside its own timer so a single `ctrl_c` fans out to all of them.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    state.resource_monitor.clone().spawn_collector(
        state.metrics_history.clone(),
        state.idle.clone(),
        shutdown_rx.clone(),
    );
    state
        .metrics_history
        .clone()
        .spawn_flush_loop(shutdown_rx.clone());
    state.idle.clone().spawn_timer(shutdown_rx.clone());

    let app = build_router(state.clone());

    let addr = state.config.listen_addr().parse::<std::net::SocketAddr>()?;
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown_state = state.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping background tasks");
        let _ = shutdown_tx.send(true);
        shutdown_state.broadcaster.shutdown().await;
        shutdown_state.supervisor.stop_all().await;
        shutdown_state.metrics_history.finalize_and_flush().await;
    })
    .await?;

    Ok(())
}

fn wire_idle_callbacks(idle: &IdleStateMachine, config: &AppConfig) {
    let tts_url = config.tts_base_url.clone();
    let llm_url = config.llm_base_url.clone();
    let tts_url_prewarm = config.tts_base_url.clone();

    let unload_tts = {
        let tts_url = tts_url.clone();
        move || {
            let tts_url = tts_url.clone();
            Box::pin(async move {
                if !upstream::tts_unload(&tts_url).await {
                    tracing::warn!("TTS unload request failed or was refused");
                }
            }) as futures::future::BoxFuture<'static, ()>
        }
    };
    let unload_llm = move || {
        let llm_url = llm_url.clone();
        Box::pin(async move {
            upstream::llm_unload_all(&llm_url).await;
        }) as futures::future::BoxFuture<'static, ()>
    };
    let prewarm_tts = move || {
        let tts_url = tts_url_prewarm.clone();
        Box::pin(async move {
            upstream::tts_prewarm(&tts_url).await;
        }) as futures::future::BoxFuture<'static, ()>
    };

    let idle = idle.clone();
    tokio::spawn(async move {
        idle.set_callbacks(crate::idle::UnloadCallbacks {
            unload_tts: Some(Arc::new(unload_tts)),
            unload_llm: Some(Arc::new(unload_llm)),
            prewarm_tts: Some(Arc::new(prewarm_tts)),
        })
        .await;
    });
}

fn build_router(state: Arc<AppState>) -> Router {
    api::routes(state)
}
