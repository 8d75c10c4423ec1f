//! Shared data types for the management daemon: energy tiers, power profiles,
//! service registration/runtime state, samples, buckets, telemetry records,
//! and the broadcast event envelope. Kept in one module because every
//! subsystem reads or writes a subset of these and none of them owns the
//! others' lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ordered energy tier. `ACTIVE < WARM < COOL < COLD < DORMANT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnergyTier {
    Active,
    Warm,
    Cool,
    Cold,
    Dormant,
}

impl EnergyTier {
    pub const ALL: [EnergyTier; 5] = [
        EnergyTier::Active,
        EnergyTier::Warm,
        EnergyTier::Cool,
        EnergyTier::Cold,
        EnergyTier::Dormant,
    ];

    /// Ordinal used for direction comparisons (0 = ACTIVE .. 4 = DORMANT).
    pub fn level(self) -> u8 {
        match self {
            EnergyTier::Active => 0,
            EnergyTier::Warm => 1,
            EnergyTier::Cool => 2,
            EnergyTier::Cold => 3,
            EnergyTier::Dormant => 4,
        }
    }
}

/// Per-tier idle threshold, in seconds since last activity. `None` means the
/// tier is never reached by the timer (the "disabled" sentinel).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IdleThresholds {
    pub warm: Option<u64>,
    pub cool: Option<u64>,
    pub cold: Option<u64>,
    pub dormant: Option<u64>,
}

impl IdleThresholds {
    /// The tier reached after `idle_seconds` of inactivity: the deepest tier
    /// whose threshold is `<= idle_seconds`, checked in descending order.
    pub fn tier_for(&self, idle_seconds: u64) -> EnergyTier {
        if self.dormant.is_some_and(|t| idle_seconds >= t) {
            EnergyTier::Dormant
        } else if self.cold.is_some_and(|t| idle_seconds >= t) {
            EnergyTier::Cold
        } else if self.cool.is_some_and(|t| idle_seconds >= t) {
            EnergyTier::Cool
        } else if self.warm.is_some_and(|t| idle_seconds >= t) {
            EnergyTier::Warm
        } else {
            EnergyTier::Active
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerProfile {
    pub id: String,
    pub display_name: String,
    pub description: String,
    pub thresholds: IdleThresholds,
    pub enabled: bool,
    pub builtin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Llm,
    Tts,
    Stt,
    Dashboard,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub id: String,
    pub display_name: String,
    pub kind: ServiceKind,
    pub command: Vec<String>,
    pub working_dir: String,
    pub port: u16,
    pub health_url: String,
    pub auto_restart: bool,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceRuntime {
    pub status: Option<ServiceStatus>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ServiceRuntime {
    pub fn stopped() -> Self {
        Self {
            status: Some(ServiceStatus::Stopped),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThermalTier {
    Nominal,
    Fair,
    Serious,
    Critical,
}

impl ThermalTier {
    /// Maps the raw `machdep.xcpm.thermal_level` sysctl value (0..3).
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => ThermalTier::Nominal,
            1 => ThermalTier::Fair,
            2 => ThermalTier::Serious,
            _ => ThermalTier::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerSample {
    pub t: DateTime<Utc>,
    pub cpu_temp_c: f64,
    pub gpu_temp_c: f64,
    pub thermal_tier: ThermalTier,
    pub thermal_level: u8,
    pub cpu_usage_pct: f64,
    pub battery_pct: f64,
    pub battery_charging: bool,
    pub battery_power_w: f64,
    pub fan_rpm: u32,
    pub package_power_w: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub service_id: String,
    pub cpu_pct: f64,
    pub memory_mb: f64,
    pub thread_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HourlyBucket {
    pub hour_key: String,
    pub sample_count: u64,
    pub avg_cpu_temp_c: f64,
    pub max_cpu_temp_c: f64,
    pub avg_battery_power_w: f64,
    pub max_battery_power_w: f64,
    pub min_battery_pct: f64,
    pub max_battery_pct: f64,
    pub avg_thermal_level: f64,
    pub max_thermal_level: u8,
    pub avg_cpu_usage_pct: f64,
    pub max_cpu_usage_pct: f64,
    pub service_cpu_avg: HashMap<String, f64>,
    pub service_cpu_max: HashMap<String, f64>,
    pub total_requests: u64,
    pub total_inferences: u64,
    pub idle_state_seconds: HashMap<EnergyTier, f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyBucket {
    pub date_key: String,
    pub avg_cpu_temp_c: f64,
    pub max_cpu_temp_c: f64,
    pub avg_battery_power_w: f64,
    pub max_battery_power_w: f64,
    pub min_battery_pct: f64,
    pub max_battery_pct: f64,
    pub avg_cpu_usage_pct: f64,
    pub max_cpu_usage_pct: f64,
    pub total_requests: u64,
    pub total_inferences: u64,
    pub thermal_events_count: u64,
    pub active_hours: u64,
    pub hours_aggregated: u64,
    pub idle_state_hours: HashMap<EnergyTier, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub client_id: String,
    pub client_name: Option<String>,
    pub wall_timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub level: LogLevel,
    pub label: String,
    pub message: String,
    pub source_file: Option<String>,
    pub source_function: Option<String>,
    pub source_line: Option<u32>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub id: String,
    pub client_id: String,
    pub received_at: DateTime<Utc>,
    pub stt_latency_ms: Option<f64>,
    pub llm_ttft_ms: Option<f64>,
    pub tts_ttfb_ms: Option<f64>,
    pub end_to_end_ms: Option<f64>,
    pub cost_usd: Option<f64>,
    pub thermal_events: u32,
    pub network_events: u32,
    #[serde(default)]
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Online,
    Idle,
    Offline,
}

impl ClientStatus {
    pub fn from_last_seen(last_seen: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let age = (now - last_seen).num_seconds();
        if age <= 60 {
            ClientStatus::Online
        } else if age <= 300 {
            ClientStatus::Idle
        } else {
            ClientStatus::Offline
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteClient {
    pub id: String,
    pub display_name: Option<String>,
    pub device_model: Option<String>,
    pub os_version: Option<String>,
    pub app_version: Option<String>,
    pub ip: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: ClientStatus,
    pub total_sessions: u64,
    pub total_logs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamServer {
    pub id: String,
    pub name: String,
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_ordering_is_total() {
        assert!(EnergyTier::Active < EnergyTier::Warm);
        assert!(EnergyTier::Warm < EnergyTier::Cool);
        assert!(EnergyTier::Cool < EnergyTier::Cold);
        assert!(EnergyTier::Cold < EnergyTier::Dormant);
    }

    #[test]
    fn tier_for_picks_deepest_satisfied_threshold() {
        let t = IdleThresholds {
            warm: Some(30),
            cool: Some(300),
            cold: Some(1800),
            dormant: Some(7200),
        };
        assert_eq!(t.tier_for(0), EnergyTier::Active);
        assert_eq!(t.tier_for(29), EnergyTier::Active);
        assert_eq!(t.tier_for(30), EnergyTier::Warm);
        assert_eq!(t.tier_for(300), EnergyTier::Cool);
        assert_eq!(t.tier_for(1800), EnergyTier::Cold);
        assert_eq!(t.tier_for(7200), EnergyTier::Dormant);
        assert_eq!(t.tier_for(100_000), EnergyTier::Dormant);
    }

    #[test]
    fn tier_for_monotonic_in_idle_seconds() {
        let t = IdleThresholds {
            warm: Some(10),
            cool: Some(60),
            cold: Some(300),
            dormant: Some(1200),
        };
        let mut last = EnergyTier::Active;
        for s in (0..2000).step_by(7) {
            let tier = t.tier_for(s);
            assert!(tier >= last, "tier regressed at {s}s");
            last = tier;
        }
    }

    #[test]
    fn disabled_threshold_is_never_reached() {
        let t = IdleThresholds {
            warm: None,
            cool: None,
            cold: None,
            dormant: None,
        };
        assert_eq!(t.tier_for(10_000_000), EnergyTier::Active);
    }

    #[test]
    fn client_status_thresholds() {
        let now = Utc::now();
        assert_eq!(
            ClientStatus::from_last_seen(now - chrono::Duration::seconds(10), now),
            ClientStatus::Online
        );
        assert_eq!(
            ClientStatus::from_last_seen(now - chrono::Duration::seconds(120), now),
            ClientStatus::Idle
        );
        assert_eq!(
            ClientStatus::from_last_seen(now - chrono::Duration::seconds(600), now),
            ClientStatus::Offline
        );
    }

    #[test]
    fn thermal_tier_from_level_clamps_above_range() {
        assert_eq!(ThermalTier::from_level(0), ThermalTier::Nominal);
        assert_eq!(ThermalTier::from_level(3), ThermalTier::Critical);
        assert_eq!(ThermalTier::from_level(9), ThermalTier::Critical);
    }
}
