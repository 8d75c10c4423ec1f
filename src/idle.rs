//! Idle State Machine (C4): tracks the daemon's single energy tier and
//! dispatches unload/pre-warm side effects on transition. Grounded on
//! `original_source/server/management/idle_manager.py`'s `IdleManager`.
//!
//! Callback registries replace the original's function-object lists per
//! `SPEC_FULL.md` §9: an `UnloadCallbacks` struct carries pluggable
//! TTS/LLM hooks so tests can inject stubs instead of hitting real upstreams.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{ApiError, ApiResult};
use crate::model::{EnergyTier, IdleThresholds, PowerProfile};

const TRANSITION_HISTORY_CAPACITY: usize = 100;
const TIMER_INTERVAL_SECS: u64 = 10;

pub fn builtin_profiles() -> Vec<PowerProfile> {
    vec![
        PowerProfile {
            id: "performance".into(),
            display_name: "Performance".into(),
            description: "Never idle-manage; everything stays hot.".into(),
            thresholds: IdleThresholds {
                warm: None,
                cool: None,
                cold: None,
                dormant: None,
            },
            enabled: false,
            builtin: true,
        },
        PowerProfile {
            id: "balanced".into(),
            display_name: "Balanced".into(),
            description: "Default tradeoff between latency and power.".into(),
            thresholds: IdleThresholds {
                warm: Some(30),
                cool: Some(300),
                cold: Some(1800),
                dormant: Some(7200),
            },
            enabled: true,
            builtin: true,
        },
        PowerProfile {
            id: "power_saver".into(),
            display_name: "Power Saver".into(),
            description: "Aggressively unload idle models.".into(),
            thresholds: IdleThresholds {
                warm: Some(10),
                cool: Some(60),
                cold: Some(300),
                dormant: Some(1800),
            },
            enabled: true,
            builtin: true,
        },
        PowerProfile {
            id: "development".into(),
            display_name: "Development".into(),
            description: "Moderate idle-down for local iteration.".into(),
            thresholds: IdleThresholds {
                warm: Some(60),
                cool: Some(180),
                cold: Some(600),
                dormant: Some(3600),
            },
            enabled: true,
            builtin: true,
        },
        PowerProfile {
            id: "presentation".into(),
            display_name: "Presentation".into(),
            description: "Stays warm through long pauses between demos.".into(),
            thresholds: IdleThresholds {
                warm: Some(300),
                cool: Some(900),
                cold: Some(3600),
                dormant: Some(7200),
            },
            enabled: true,
            builtin: true,
        },
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Activity,
    Timeout,
    Manual,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StateTransition {
    pub t: DateTime<Utc>,
    pub from: EnergyTier,
    pub to: EnergyTier,
    pub idle_seconds: u64,
    pub trigger: Trigger,
}

/// Pluggable unload/pre-warm hooks. Default is a no-op so unit tests never
/// need network access; the real binary wires in upstream HTTP calls.
#[derive(Clone, Default)]
pub struct UnloadCallbacks {
    pub unload_tts: Option<Arc<dyn Fn() -> futures::future::BoxFuture<'static, ()> + Send + Sync>>,
    pub unload_llm: Option<Arc<dyn Fn() -> futures::future::BoxFuture<'static, ()> + Send + Sync>>,
    pub prewarm_tts: Option<Arc<dyn Fn() -> futures::future::BoxFuture<'static, ()> + Send + Sync>>,
}

type TierHandler = Arc<dyn Fn(EnergyTier, EnergyTier) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

struct State {
    current_tier: EnergyTier,
    last_activity_t: DateTime<Utc>,
    last_activity_kind: Option<String>,
    profiles: HashMap<String, PowerProfile>,
    active_profile_id: String,
    keep_awake_until: Option<DateTime<Utc>>,
    history: VecDeque<StateTransition>,
    tier_handlers: HashMap<EnergyTier, Vec<TierHandler>>,
    global_handlers: Vec<TierHandler>,
}

/// Cloning is cheap — clones share the same underlying data via `Arc`.
#[derive(Clone)]
pub struct IdleStateMachine {
    state: Arc<RwLock<State>>,
    callbacks: Arc<RwLock<UnloadCallbacks>>,
    profiles_path: std::path::PathBuf,
}

impl IdleStateMachine {
    pub fn new(profiles_path: std::path::PathBuf) -> Self {
        let mut profiles: HashMap<String, PowerProfile> = builtin_profiles()
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        let custom: HashMap<String, PowerProfile> = crate::persist::load_json_or_default(&profiles_path);
        profiles.extend(custom);

        Self {
            state: Arc::new(RwLock::new(State {
                current_tier: EnergyTier::Active,
                last_activity_t: Utc::now(),
                last_activity_kind: None,
                profiles,
                active_profile_id: "balanced".to_string(),
                keep_awake_until: None,
                history: VecDeque::with_capacity(TRANSITION_HISTORY_CAPACITY),
                tier_handlers: HashMap::new(),
                global_handlers: Vec::new(),
            })),
            callbacks: Arc::new(RwLock::new(UnloadCallbacks::default())),
            profiles_path,
        }
    }

    pub async fn set_callbacks(&self, callbacks: UnloadCallbacks) {
        *self.callbacks.write().await = callbacks;
    }

    pub async fn on_transition(&self, handler: TierHandler) {
        self.state.write().await.global_handlers.push(handler);
    }

    pub async fn current_tier(&self) -> EnergyTier {
        self.state.read().await.current_tier
    }

    pub async fn record_activity(&self, kind: &str) {
        let now = Utc::now();
        let (was_idle, enabled) = {
            let mut state = self.state.write().await;
            state.last_activity_t = now;
            state.last_activity_kind = Some(kind.to_string());
            let enabled = state
                .profiles
                .get(&state.active_profile_id)
                .map(|p| p.enabled)
                .unwrap_or(false);
            (state.current_tier != EnergyTier::Active, enabled)
        };
        if was_idle && enabled {
            self.transition(EnergyTier::Active, Trigger::Activity).await;
        }
    }

    pub async fn keep_awake(&self, duration: Duration) {
        let until = Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default();
        self.state.write().await.keep_awake_until = Some(until);
        self.transition(EnergyTier::Active, Trigger::Manual).await;
    }

    pub async fn cancel_keep_awake(&self) {
        self.state.write().await.keep_awake_until = None;
    }

    pub async fn force_tier(&self, tier: EnergyTier) {
        self.transition(tier, Trigger::Manual).await;
    }

    /// One timer tick (called every 10s by `spawn_timer`).
    async fn tick(&self) {
        let target = {
            let mut state = self.state.write().await;
            let Some(profile) = state.profiles.get(&state.active_profile_id).cloned() else {
                return;
            };
            if !profile.enabled {
                return;
            }
            if let Some(until) = state.keep_awake_until {
                let now = Utc::now();
                if until > now {
                    return;
                }
                tracing::info!("keep-awake window expired");
                state.keep_awake_until = None;
            }
            let idle_seconds = (Utc::now() - state.last_activity_t).num_seconds().max(0) as u64;
            profile.thresholds.tier_for(idle_seconds)
        };
        let current = self.current_tier().await;
        if target != current {
            self.transition(target, Trigger::Timeout).await;
        }
    }

    async fn transition(&self, new_tier: EnergyTier, trigger: Trigger) {
        let (old_tier, idle_seconds) = {
            let mut state = self.state.write().await;
            let old = state.current_tier;
            if old == new_tier && trigger != Trigger::Manual {
                return;
            }
            let idle_seconds = (Utc::now() - state.last_activity_t).num_seconds().max(0) as u64;
            state.history.push_back(StateTransition {
                t: Utc::now(),
                from: old,
                to: new_tier,
                idle_seconds,
                trigger,
            });
            if state.history.len() > TRANSITION_HISTORY_CAPACITY {
                state.history.pop_front();
            }
            state.current_tier = new_tier;
            (old, idle_seconds)
        };
        let _ = idle_seconds;

        self.run_builtin_side_effects(old_tier, new_tier).await;

        let handlers: Vec<TierHandler> = {
            let state = self.state.read().await;
            let mut h = state.tier_handlers.get(&new_tier).cloned().unwrap_or_default();
            h.extend(state.global_handlers.iter().cloned());
            h
        };
        for handler in handlers {
            handler(old_tier, new_tier).await;
        }
    }

    async fn run_builtin_side_effects(&self, old_tier: EnergyTier, new_tier: EnergyTier) {
        let callbacks = self.callbacks.read().await.clone();

        let entering = |tier: EnergyTier| old_tier != tier && new_tier == tier;
        if entering(EnergyTier::Cool) {
            if let Some(cb) = &callbacks.unload_tts {
                cb().await;
            }
        }
        if entering(EnergyTier::Cold) || entering(EnergyTier::Dormant) {
            if let Some(cb) = &callbacks.unload_tts {
                cb().await;
            }
            if let Some(cb) = &callbacks.unload_llm {
                cb().await;
            }
        }
        let leaving_deep_idle = old_tier.level() > new_tier.level()
            && (old_tier == EnergyTier::Cold || old_tier == EnergyTier::Dormant);
        if leaving_deep_idle {
            if let Some(cb) = callbacks.prewarm_tts.clone() {
                tokio::spawn(async move { cb().await });
            }
        }
    }

    pub async fn status(&self) -> serde_json::Value {
        let state = self.state.read().await;
        let idle_seconds = (Utc::now() - state.last_activity_t).num_seconds().max(0);
        serde_json::json!({
            "tier": state.current_tier,
            "idle_seconds": idle_seconds,
            "active_profile": state.active_profile_id,
            "keep_awake_until": state.keep_awake_until,
            "last_activity_kind": state.last_activity_kind,
        })
    }

    pub async fn transition_history(&self) -> Vec<StateTransition> {
        self.state.read().await.history.iter().cloned().collect()
    }

    pub async fn list_profiles(&self) -> Vec<PowerProfile> {
        self.state.read().await.profiles.values().cloned().collect()
    }

    pub async fn create_profile(&self, profile: PowerProfile) -> ApiResult<()> {
        let mut state = self.state.write().await;
        if state.profiles.contains_key(&profile.id) {
            return Err(ApiError::Conflict(format!("profile '{}' already exists", profile.id)));
        }
        state.profiles.insert(profile.id.clone(), profile);
        drop(state);
        self.persist_custom_profiles().await
    }

    pub async fn update_profile(&self, id: &str, update: PowerProfile) -> ApiResult<()> {
        {
            let mut state = self.state.write().await;
            match state.profiles.get(id) {
                Some(p) if p.builtin => {
                    return Err(ApiError::Conflict("cannot modify a builtin profile".into()))
                }
                Some(_) => {}
                None => return Err(ApiError::NotFound(format!("no such profile '{id}'"))),
            }
            state.profiles.insert(id.to_string(), update);
        }
        self.persist_custom_profiles().await
    }

    pub async fn delete_profile(&self, id: &str) -> ApiResult<()> {
        {
            let mut state = self.state.write().await;
            match state.profiles.get(id) {
                Some(p) if p.builtin => {
                    return Err(ApiError::Conflict("cannot delete a builtin profile".into()))
                }
                Some(_) => {}
                None => return Err(ApiError::NotFound(format!("no such profile '{id}'"))),
            }
            state.profiles.remove(id);
            if state.active_profile_id == id {
                state.active_profile_id = "balanced".to_string();
            }
        }
        self.persist_custom_profiles().await
    }

    pub async fn duplicate_profile(&self, id: &str, new_id: &str) -> ApiResult<()> {
        let source = {
            let state = self.state.read().await;
            state
                .profiles
                .get(id)
                .cloned()
                .ok_or_else(|| ApiError::NotFound(format!("no such profile '{id}'")))?
        };
        let copy = PowerProfile {
            id: new_id.to_string(),
            builtin: false,
            display_name: format!("{} (copy)", source.display_name),
            ..source
        };
        self.create_profile(copy).await
    }

    pub async fn activate_profile(&self, id: &str) -> ApiResult<()> {
        {
            let mut state = self.state.write().await;
            if !state.profiles.contains_key(id) {
                return Err(ApiError::NotFound(format!("no such profile '{id}'")));
            }
            state.active_profile_id = id.to_string();
        }
        Ok(())
    }

    async fn persist_custom_profiles(&self) -> ApiResult<()> {
        let state = self.state.read().await;
        let custom: HashMap<String, PowerProfile> = state
            .profiles
            .iter()
            .filter(|(_, p)| !p.builtin)
            .map(|(id, p)| (id.clone(), p.clone()))
            .collect();
        crate::persist::save_json(&self.profiles_path, &custom)
            .map_err(ApiError::Internal)
    }

    /// Spawns the 10s idle-check timer.
    pub fn spawn_timer(self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(TIMER_INTERVAL_SECS));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                self.tick().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_profiles_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("voicelearn-idle-test-{}.json", uuid::Uuid::new_v4()))
    }

    async fn machine_with_profile(thresholds: IdleThresholds) -> IdleStateMachine {
        let m = IdleStateMachine::new(temp_profiles_path());
        m.create_profile(PowerProfile {
            id: "lab".into(),
            display_name: "Lab".into(),
            description: "test profile".into(),
            thresholds,
            enabled: true,
            builtin: false,
        })
        .await
        .unwrap();
        m.activate_profile("lab").await.unwrap();
        m
    }

    #[tokio::test]
    async fn starts_active() {
        let m = IdleStateMachine::new(temp_profiles_path());
        assert_eq!(m.current_tier().await, EnergyTier::Active);
    }

    #[tokio::test]
    async fn timer_tick_transitions_by_threshold() {
        let m = machine_with_profile(IdleThresholds {
            warm: Some(0),
            cool: Some(10),
            cold: Some(15),
            dormant: Some(20),
        })
        .await;
        // back-date last activity to simulate elapsed idle time
        m.state.write().await.last_activity_t = Utc::now() - chrono::Duration::seconds(16);
        m.tick().await;
        assert_eq!(m.current_tier().await, EnergyTier::Cold);

        m.state.write().await.last_activity_t = Utc::now() - chrono::Duration::seconds(21);
        m.tick().await;
        assert_eq!(m.current_tier().await, EnergyTier::Dormant);
    }

    #[tokio::test]
    async fn record_activity_resets_to_active_immediately() {
        let m = machine_with_profile(IdleThresholds {
            warm: Some(0),
            cool: Some(1),
            cold: Some(2),
            dormant: Some(3),
        })
        .await;
        m.force_tier(EnergyTier::Dormant).await;
        assert_eq!(m.current_tier().await, EnergyTier::Dormant);

        m.record_activity("request").await;
        assert_eq!(m.current_tier().await, EnergyTier::Active);
    }

    #[tokio::test]
    async fn keep_awake_suppresses_timer_transitions() {
        let m = machine_with_profile(IdleThresholds {
            warm: Some(0),
            cool: Some(0),
            cold: Some(0),
            dormant: Some(0),
        })
        .await;
        m.keep_awake(Duration::from_secs(3600)).await;
        m.state.write().await.last_activity_t = Utc::now() - chrono::Duration::seconds(10_000);
        m.tick().await;
        assert_eq!(m.current_tier().await, EnergyTier::Active);
    }

    #[tokio::test]
    async fn entering_cold_unloads_tts_and_llm_not_on_leave() {
        let m = machine_with_profile(IdleThresholds {
            warm: Some(0),
            cool: Some(1),
            cold: Some(2),
            dormant: Some(100),
        })
        .await;
        let tts_calls = Arc::new(AtomicUsize::new(0));
        let llm_calls = Arc::new(AtomicUsize::new(0));
        let prewarm_calls = Arc::new(AtomicUsize::new(0));

        let tts_c = tts_calls.clone();
        let llm_c = llm_calls.clone();
        let prewarm_c = prewarm_calls.clone();
        m.set_callbacks(UnloadCallbacks {
            unload_tts: Some(Arc::new(move || {
                let c = tts_c.clone();
                Box::pin(async move {
                    c.fetch_add(1, Ordering::SeqCst);
                })
            })),
            unload_llm: Some(Arc::new(move || {
                let c = llm_c.clone();
                Box::pin(async move {
                    c.fetch_add(1, Ordering::SeqCst);
                })
            })),
            prewarm_tts: Some(Arc::new(move || {
                let c = prewarm_c.clone();
                Box::pin(async move {
                    c.fetch_add(1, Ordering::SeqCst);
                })
            })),
        })
        .await;

        m.force_tier(EnergyTier::Cold).await;
        assert_eq!(tts_calls.load(Ordering::SeqCst), 1);
        assert_eq!(llm_calls.load(Ordering::SeqCst), 1);

        // S2: activity while COLD pre-warms TTS but never the LLM runtime.
        m.record_activity("request").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(prewarm_calls.load(Ordering::SeqCst), 1);
        assert_eq!(llm_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transition_history_is_bounded() {
        let m = machine_with_profile(IdleThresholds {
            warm: Some(0),
            cool: Some(0),
            cold: Some(0),
            dormant: Some(0),
        })
        .await;
        for _ in 0..(TRANSITION_HISTORY_CAPACITY + 20) {
            m.force_tier(EnergyTier::Warm).await;
            m.force_tier(EnergyTier::Active).await;
        }
        let history = m.transition_history().await;
        assert_eq!(history.len(), TRANSITION_HISTORY_CAPACITY);
    }

    #[tokio::test]
    async fn deleting_active_custom_profile_reverts_to_balanced() {
        let m = machine_with_profile(IdleThresholds {
            warm: Some(5),
            cool: Some(10),
            cold: Some(15),
            dormant: Some(20),
        })
        .await;
        m.delete_profile("lab").await.unwrap();
        assert_eq!(m.state.read().await.active_profile_id, "balanced");
    }

    #[tokio::test]
    async fn builtin_profile_cannot_be_modified_or_deleted() {
        let m = IdleStateMachine::new(temp_profiles_path());
        let err = m
            .update_profile(
                "balanced",
                PowerProfile {
                    id: "balanced".into(),
                    display_name: "x".into(),
                    description: "x".into(),
                    thresholds: IdleThresholds {
                        warm: Some(1),
                        cool: Some(2),
                        cold: Some(3),
                        dormant: Some(4),
                    },
                    enabled: true,
                    builtin: true,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));

        let err = m.delete_profile("balanced").await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn profile_persists_round_trip_across_restart() {
        let path = temp_profiles_path();
        {
            let m = IdleStateMachine::new(path.clone());
            m.create_profile(PowerProfile {
                id: "lab".into(),
                display_name: "Lab".into(),
                description: "d".into(),
                thresholds: IdleThresholds {
                    warm: Some(5),
                    cool: Some(10),
                    cold: Some(15),
                    dormant: Some(20),
                },
                enabled: true,
                builtin: false,
            })
            .await
            .unwrap();
        }
        let reloaded = IdleStateMachine::new(path.clone());
        let profiles = reloaded.list_profiles().await;
        let lab = profiles.iter().find(|p| p.id == "lab").unwrap();
        assert_eq!(lab.thresholds.warm, Some(5));
        std::fs::remove_file(&path).ok();
    }
}
