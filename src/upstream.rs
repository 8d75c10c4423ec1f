//! Upstream protocol helpers: the LLM runtime and TTS HTTP protocols used by
//! C5's health probes and C4's unload/pre-warm fallbacks when no in-process
//! callback has been registered.
//!
//! Grounded on `docker/llamacpp.rs::check_llamacpp_health`'s
//! never-propagate-the-network-error idiom
//! (`match reqwest::get(...).await { Ok(r) => Ok(r.status().is_success()),
//! Err(_) => Ok(false) }`), applied uniformly to every probe in this module
//! since an unreachable upstream is a routine, expected condition here
//! (the whole point of the idle tiers is that upstreams are sometimes
//! deliberately not running), not an error worth bubbling up.

use serde::Deserialize;
use std::time::Duration;

const UNLOAD_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
pub struct LoadedModel {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PsResponse {
    #[serde(default)]
    models: Vec<LoadedModel>,
}

fn client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .expect("reqwest client")
}

/// `GET {base_url}/api/ps` — list of currently-loaded LLM runtime models.
/// Swallows any transport/parse failure into an empty list, since "nothing
/// loaded" and "runtime unreachable" both mean there's nothing to unload.
pub async fn llm_loaded_models(base_url: &str) -> Vec<LoadedModel> {
    let url = format!("{}/api/ps", base_url.trim_end_matches('/'));
    match client(HEALTH_TIMEOUT).get(&url).send().await {
        Ok(resp) => resp
            .json::<PsResponse>()
            .await
            .map(|p| p.models)
            .unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

/// Unloads a single LLM runtime model via `POST /api/generate` with
/// `{model, keep_alive: 0}` (SPEC_FULL §4.4, §6). Returns whether the
/// request was accepted; failures are logged by the caller, never panic.
pub async fn llm_unload_model(base_url: &str, model: &str) -> bool {
    let url = format!("{}/api/generate", base_url.trim_end_matches('/'));
    let body = serde_json::json!({"model": model, "keep_alive": 0});
    match client(UNLOAD_TIMEOUT).post(&url).json(&body).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

/// Unloads every model the LLM runtime currently reports as loaded. Best
/// effort: a failure on one model does not stop the rest.
pub async fn llm_unload_all(base_url: &str) {
    for model in llm_loaded_models(base_url).await {
        if !llm_unload_model(base_url, &model.name).await {
            tracing::warn!(model = %model.name, "failed to unload LLM runtime model");
        }
    }
}

/// `GET {base_url}/health` — true iff the TTS service responds 2xx.
pub async fn tts_health(base_url: &str) -> bool {
    let url = format!("{}/health", base_url.trim_end_matches('/'));
    match client(HEALTH_TIMEOUT).get(&url).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

/// `POST {base_url}/admin/unload` — best-effort TTS model unload.
pub async fn tts_unload(base_url: &str) -> bool {
    let url = format!("{}/admin/unload", base_url.trim_end_matches('/'));
    match client(UNLOAD_TIMEOUT).post(&url).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

/// Pre-warms the TTS service by issuing a cheap health probe, which on most
/// TTS servers triggers lazy model load on first request. Mirrors the
/// unload helpers' error-swallowing discipline: a failed pre-warm is never
/// fatal to the tier transition (SPEC_FULL §4.4).
pub async fn tts_prewarm(base_url: &str) {
    if !tts_health(base_url).await {
        tracing::warn!(base_url, "TTS pre-warm probe did not succeed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_llm_runtime_yields_empty_model_list() {
        let models = llm_loaded_models("http://127.0.0.1:1").await;
        assert!(models.is_empty());
    }

    #[tokio::test]
    async fn unreachable_llm_runtime_unload_returns_false_not_err() {
        assert!(!llm_unload_model("http://127.0.0.1:1", "llama3").await);
    }

    #[tokio::test]
    async fn unreachable_tts_health_returns_false_not_err() {
        assert!(!tts_health("http://127.0.0.1:1").await);
    }

    #[tokio::test]
    async fn unreachable_tts_unload_returns_false_not_err() {
        assert!(!tts_unload("http://127.0.0.1:1").await);
    }

    #[tokio::test]
    async fn prewarm_on_unreachable_tts_does_not_panic() {
        tts_prewarm("http://127.0.0.1:1").await;
    }
}
