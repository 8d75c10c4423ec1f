//! Resource Monitor (C2): periodic host + per-service sampling with bounded
//! rolling history. Grounded on `original_source/server/management/resource_monitor.py`
//! and structurally on the teacher's `metrics::CpuSampler`/`MetricsBroadcaster`
//! spawn-a-collector idiom (`src/metrics.rs`).
//!
//! Every external command invocation is isolated behind a small free
//! function that parses a command's stdout; the OS-calling glue around it is
//! a thin, untested wrapper, mirroring the teacher's own split between
//! `DockerManager`'s thin IO methods and its pure-logic helpers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::model::{PowerSample, ProcessSample, ThermalTier};

const HISTORY_CAPACITY: usize = 720;
const ACTIVITY_WINDOW_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Request,
    Inference,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ResourceSummary {
    pub current: Option<PowerSample>,
    pub avg_package_power_w: f64,
    pub avg_battery_power_w: f64,
    pub service_cpu_avg: HashMap<String, f64>,
}

struct Inner {
    power_history: VecDeque<PowerSample>,
    process_history: VecDeque<Vec<ProcessSample>>,
    activity: HashMap<String, Vec<DateTime<Utc>>>,
    request_count: u64,
    inference_count: u64,
}

/// Cloning is cheap — clones share the same underlying state via `Arc`.
#[derive(Clone)]
pub struct ResourceMonitor {
    inner: Arc<RwLock<Inner>>,
    service_ports: Arc<HashMap<String, u16>>,
    service_patterns: Arc<HashMap<String, String>>,
}

impl ResourceMonitor {
    pub fn new(service_ports: HashMap<String, u16>, service_patterns: HashMap<String, String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                power_history: VecDeque::with_capacity(HISTORY_CAPACITY),
                process_history: VecDeque::with_capacity(HISTORY_CAPACITY),
                activity: HashMap::new(),
                request_count: 0,
                inference_count: 0,
            })),
            service_ports: Arc::new(service_ports),
            service_patterns: Arc::new(service_patterns),
        }
    }

    pub async fn record_service_activity(&self, service_id: &str, kind: ActivityKind) {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let entries = inner.activity.entry(service_id.to_string()).or_default();
        entries.push(now);
        let cutoff = now - chrono::Duration::seconds(ACTIVITY_WINDOW_SECS);
        entries.retain(|t| *t >= cutoff);
        match kind {
            ActivityKind::Request => inner.request_count += 1,
            ActivityKind::Inference => inner.inference_count += 1,
        }
    }

    pub async fn requests_in_window(&self, service_id: &str) -> usize {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::seconds(ACTIVITY_WINDOW_SECS);
        let inner = self.inner.read().await;
        inner
            .activity
            .get(service_id)
            .map(|entries| entries.iter().filter(|t| **t >= cutoff).count())
            .unwrap_or(0)
    }

    /// Drains and resets the request/inference counters accumulated since
    /// the last call. Consumed once per tick by the collector loop and fed
    /// into the Metrics History Aggregator's per-hour activity counters.
    async fn take_activity_counts(&self) -> (u64, u64) {
        let mut inner = self.inner.write().await;
        let r = std::mem::take(&mut inner.request_count);
        let i = std::mem::take(&mut inner.inference_count);
        (r, i)
    }

    /// Runs one full sampling tick: queries the host and per-service process
    /// table, appends to bounded history, and returns the new sample pair
    /// plus the activity counts accumulated since the previous tick.
    pub async fn tick(&self) -> (PowerSample, Vec<ProcessSample>, u64, u64) {
        let thermal_level = probe_thermal_level().await.unwrap_or(0);
        let cpu_usage_pct = probe_cpu_usage_pct().await.unwrap_or(0.0);
        let battery = probe_battery_info().await.unwrap_or_default();

        let mut process_samples = Vec::new();
        for (service_id, &port) in self.service_ports.iter() {
            let pid = match probe_pid_by_port(port).await {
                Some(pid) => Some(pid),
                None => match self.service_patterns.get(service_id) {
                    Some(pattern) => probe_pid_by_pattern(pattern).await,
                    None => None,
                },
            };
            if let Some(pid) = pid {
                if let Some(stats) = probe_process_stats(pid).await {
                    process_samples.push(ProcessSample {
                        pid,
                        service_id: service_id.clone(),
                        cpu_pct: stats.cpu_pct,
                        memory_mb: stats.memory_mb,
                        thread_count: stats.thread_count,
                    });
                }
            }
        }

        let sample = PowerSample {
            t: Utc::now(),
            cpu_temp_c: 0.0,
            gpu_temp_c: 0.0,
            thermal_tier: ThermalTier::from_level(thermal_level),
            thermal_level,
            cpu_usage_pct,
            battery_pct: battery.percent,
            battery_charging: battery.charging,
            battery_power_w: battery.power_w,
            fan_rpm: 0,
            package_power_w: process_samples
                .iter()
                .map(|p| estimate_service_power_w(p.cpu_pct))
                .sum(),
        };

        let (requests, inferences) = self.take_activity_counts().await;

        {
            let mut inner = self.inner.write().await;
            if inner.power_history.len() >= HISTORY_CAPACITY {
                inner.power_history.pop_front();
            }
            inner.power_history.push_back(sample.clone());
            if inner.process_history.len() >= HISTORY_CAPACITY {
                inner.process_history.pop_front();
            }
            inner.process_history.push_back(process_samples.clone());
        }

        (sample, process_samples, requests, inferences)
    }

    pub async fn snapshot_current(&self) -> Option<(PowerSample, Vec<ProcessSample>)> {
        let inner = self.inner.read().await;
        let sample = inner.power_history.back()?.clone();
        let processes = inner.process_history.back().cloned().unwrap_or_default();
        Some((sample, processes))
    }

    /// Averages over the last ~60s window (final 12 samples at 5s cadence).
    pub async fn summary(&self) -> ResourceSummary {
        let inner = self.inner.read().await;
        let window: Vec<&PowerSample> = inner.power_history.iter().rev().take(12).collect();
        if window.is_empty() {
            return ResourceSummary::default();
        }
        let n = window.len() as f64;
        let avg_package_power_w = window.iter().map(|s| s.package_power_w).sum::<f64>() / n;
        let avg_battery_power_w = window.iter().map(|s| s.battery_power_w).sum::<f64>() / n;

        let mut cpu_sums: HashMap<String, f64> = HashMap::new();
        let mut cpu_counts: HashMap<String, f64> = HashMap::new();
        for processes in inner.process_history.iter().rev().take(12) {
            for p in processes {
                *cpu_sums.entry(p.service_id.clone()).or_default() += p.cpu_pct;
                *cpu_counts.entry(p.service_id.clone()).or_default() += 1.0;
            }
        }
        let service_cpu_avg = cpu_sums
            .into_iter()
            .map(|(id, sum)| {
                let count = cpu_counts.get(&id).copied().unwrap_or(1.0);
                (id, sum / count)
            })
            .collect();

        ResourceSummary {
            current: inner.power_history.back().cloned(),
            avg_package_power_w,
            avg_battery_power_w,
            service_cpu_avg,
        }
    }

    pub async fn history(&self, limit: usize) -> (Vec<PowerSample>, Vec<Vec<ProcessSample>>) {
        let inner = self.inner.read().await;
        let power = inner.power_history.iter().rev().take(limit).rev().cloned().collect();
        let process = inner.process_history.iter().rev().take(limit).rev().cloned().collect();
        (power, process)
    }

    /// Spawns the 5s periodic collector. Returns a handle the caller should
    /// hold to keep the task alive; dropping it does not cancel it.
    pub fn spawn_collector(
        self,
        metrics_history: crate::metrics_history::MetricsHistory,
        idle: crate::idle::IdleStateMachine,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let (sample, processes, requests, inferences) = self.tick().await;
                let tier = idle.current_tier().await;
                metrics_history
                    .record_sample(&sample, tier, requests, inferences)
                    .await;
                for process in &processes {
                    metrics_history
                        .record_service_cpu(&process.service_id, process.cpu_pct)
                        .await;
                }
            }
        })
    }
}

#[derive(Debug, Clone, Default)]
struct BatteryInfo {
    percent: f64,
    charging: bool,
    power_w: f64,
}

async fn run_command(program: &str, args: &[&str]) -> Option<String> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok()
}

async fn probe_thermal_level() -> Option<u8> {
    let raw = run_command("sysctl", &["-n", "machdep.xcpm.thermal_level"]).await?;
    parse_thermal_level(&raw)
}

async fn probe_cpu_usage_pct() -> Option<f64> {
    let raw = run_command("ps", &["-A", "-o", "%cpu"]).await?;
    Some(parse_total_cpu_usage(&raw))
}

async fn probe_battery_info() -> Option<BatteryInfo> {
    let batt = run_command("pmset", &["-g", "batt"]).await?;
    let percent = parse_battery_percent(&batt).unwrap_or(0.0);
    let charging = battery_is_charging(&batt);

    let ioreg = run_command("ioreg", &["-r", "-c", "AppleSmartBattery"]).await;
    let power_w = ioreg
        .as_deref()
        .and_then(parse_amperage_voltage)
        .map(|(amperage_a, voltage_v)| (amperage_a * voltage_v).abs())
        .unwrap_or(0.0);

    Some(BatteryInfo {
        percent,
        charging,
        power_w,
    })
}

async fn probe_pid_by_port(port: u16) -> Option<u32> {
    let raw = run_command("lsof", &["-t", "-i", &format!(":{port}"), "-sTCP:LISTEN"]).await?;
    parse_first_pid_line(&raw)
}

async fn probe_pid_by_pattern(pattern: &str) -> Option<u32> {
    let raw = run_command("pgrep", &["-f", pattern]).await?;
    parse_first_pid_line(&raw)
}

#[derive(Debug, Clone, PartialEq)]
struct ProcessStats {
    cpu_pct: f64,
    memory_mb: f64,
    thread_count: u32,
}

async fn probe_process_stats(pid: u32) -> Option<ProcessStats> {
    let raw = run_command(
        "ps",
        &["-p", &pid.to_string(), "-o", "pid,%cpu,%mem,rss,nlwp,command"],
    )
    .await?;
    parse_process_stats_line(&raw)
}

fn parse_thermal_level(raw: &str) -> Option<u8> {
    raw.trim().parse::<u8>().ok().map(|v| v.min(3))
}

fn parse_total_cpu_usage(ps_output: &str) -> f64 {
    ps_output
        .lines()
        .skip(1)
        .filter_map(|line| line.trim().parse::<f64>().ok())
        .sum()
}

fn parse_battery_percent(pmset_output: &str) -> Option<f64> {
    let idx = pmset_output.find('%')?;
    let start = pmset_output[..idx]
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    pmset_output[start..idx].parse::<f64>().ok()
}

fn battery_is_charging(pmset_output: &str) -> bool {
    let lower = pmset_output.to_lowercase();
    lower.contains("charging") || lower.contains("ac power")
}

/// Parses `"Amperage" = N` and `"Voltage" = N` from `ioreg` output, sign-extending
/// the amperage (encoded as an unsigned 64-bit two's-complement value) and
/// scaling mA/mV to A/V.
fn parse_amperage_voltage(ioreg_output: &str) -> Option<(f64, f64)> {
    let raw_amperage = extract_ioreg_u64(ioreg_output, "Amperage")?;
    let raw_voltage = extract_ioreg_u64(ioreg_output, "Voltage")?;

    // The registry reports amperage as an unsigned 64-bit field that is
    // actually a signed two's-complement value; values above 2^63 are
    // negative (discharging). Reinterpreting the bit pattern as i64 performs
    // exactly this sign-extension.
    let signed_amperage = raw_amperage as i64;

    let amperage_a = signed_amperage as f64 / 1000.0;
    let voltage_v = raw_voltage as f64 / 1000.0;
    Some((amperage_a, voltage_v))
}

fn extract_ioreg_u64(output: &str, key: &str) -> Option<u64> {
    let needle = format!("\"{key}\"");
    let idx = output.find(&needle)?;
    let rest = &output[idx + needle.len()..];
    let eq = rest.find('=')?;
    let digits: String = rest[eq + 1..]
        .chars()
        .skip_while(|c| c.is_whitespace())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<u64>().ok()
}

fn parse_first_pid_line(output: &str) -> Option<u32> {
    output.lines().next()?.trim().parse::<u32>().ok()
}

fn parse_process_stats_line(ps_output: &str) -> Option<ProcessStats> {
    let line = ps_output.lines().nth(1)?;
    let fields: Vec<&str> = line.trim().split_whitespace().collect();
    if fields.len() < 5 {
        return None;
    }
    let cpu_pct = fields[1].parse::<f64>().ok()?;
    let mem_pct_unused = fields.get(2);
    let _ = mem_pct_unused;
    let rss_kb = fields[3].parse::<f64>().ok()?;
    let thread_count = fields[4].parse::<u32>().ok()?;
    Some(ProcessStats {
        cpu_pct,
        memory_mb: rss_kb / 1024.0,
        thread_count,
    })
}

fn estimate_service_power_w(cpu_pct: f64) -> f64 {
    let watts = 0.5 + 0.3 * cpu_pct;
    (watts * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_thermal_level_clamps_to_3() {
        assert_eq!(parse_thermal_level("0\n"), Some(0));
        assert_eq!(parse_thermal_level("2"), Some(2));
        assert_eq!(parse_thermal_level("9"), Some(3));
        assert_eq!(parse_thermal_level("not a number"), None);
    }

    #[test]
    fn parse_total_cpu_usage_sums_rows_skipping_header() {
        let output = "%CPU\n 1.2\n 3.4\n 0.0\n";
        assert!((parse_total_cpu_usage(output) - 4.6).abs() < 1e-9);
    }

    #[test]
    fn parse_battery_percent_extracts_integer_before_percent_sign() {
        assert_eq!(
            parse_battery_percent("Now drawing from 'Battery Power' -InternalBattery-0 (id=1)\t87%; discharging;"),
            Some(87.0)
        );
    }

    #[test]
    fn battery_is_charging_detects_either_phrase() {
        assert!(battery_is_charging("87%; charging; 0:30 remaining"));
        assert!(battery_is_charging("Now drawing from 'AC Power'"));
        assert!(!battery_is_charging("87%; discharging; 2:00 remaining"));
    }

    #[test]
    fn amperage_sign_extension_for_discharging_battery() {
        // 2^64 - 1500 encodes -1500 mA in two's complement.
        let raw_amperage = u64::MAX - 1499;
        let output = format!(
            "\"Amperage\" = {raw_amperage}\n\"Voltage\" = 11800\n"
        );
        let (amperage_a, voltage_v) = parse_amperage_voltage(&output).unwrap();
        assert!((amperage_a + 1.5).abs() < 1e-6);
        assert!((voltage_v - 11.8).abs() < 1e-6);
        assert!(((amperage_a * voltage_v).abs() - 17.7).abs() < 1e-3);
    }

    #[test]
    fn amperage_positive_for_charging_battery() {
        let output = "\"Amperage\" = 2000\n\"Voltage\" = 12000\n";
        let (amperage_a, voltage_v) = parse_amperage_voltage(output).unwrap();
        assert!((amperage_a - 2.0).abs() < 1e-6);
        assert!((voltage_v - 12.0).abs() < 1e-6);
    }

    #[test]
    fn parse_first_pid_line_takes_first_of_multiple() {
        assert_eq!(parse_first_pid_line("1234\n5678\n"), Some(1234));
        assert_eq!(parse_first_pid_line(""), None);
    }

    #[test]
    fn parse_process_stats_line_reads_fixed_columns() {
        let output = "  PID %CPU %MEM    RSS NLWP COMMAND\n 4242  3.5  1.2 204800    7 /usr/bin/ollama serve\n";
        let stats = parse_process_stats_line(output).unwrap();
        assert!((stats.cpu_pct - 3.5).abs() < 1e-9);
        assert!((stats.memory_mb - 200.0).abs() < 1e-6);
        assert_eq!(stats.thread_count, 7);
    }

    #[test]
    fn estimate_service_power_matches_formula() {
        assert!((estimate_service_power_w(0.0) - 0.5).abs() < 1e-9);
        assert!((estimate_service_power_w(10.0) - 3.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn tick_appends_bounded_history() {
        let monitor = ResourceMonitor::new(HashMap::new(), HashMap::new());
        for _ in 0..3 {
            monitor.tick().await;
        }
        let (power, _) = monitor.history(10).await;
        assert_eq!(power.len(), 3);
    }

    #[tokio::test]
    async fn history_capacity_evicts_oldest() {
        let monitor = ResourceMonitor::new(HashMap::new(), HashMap::new());
        for _ in 0..(HISTORY_CAPACITY + 5) {
            monitor.tick().await;
        }
        let (power, _) = monitor.history(HISTORY_CAPACITY + 10).await;
        assert_eq!(power.len(), HISTORY_CAPACITY);
    }

    #[tokio::test]
    async fn activity_window_prunes_old_entries() {
        let monitor = ResourceMonitor::new(HashMap::new(), HashMap::new());
        monitor.record_service_activity("ollama", ActivityKind::Request).await;
        assert_eq!(monitor.requests_in_window("ollama").await, 1);
    }

    #[tokio::test]
    async fn activity_counts_drain_on_take() {
        let monitor = ResourceMonitor::new(HashMap::new(), HashMap::new());
        monitor.record_service_activity("ollama", ActivityKind::Request).await;
        monitor.record_service_activity("ollama", ActivityKind::Inference).await;
        let (requests, inferences) = monitor.take_activity_counts().await;
        assert_eq!(requests, 1);
        assert_eq!(inferences, 1);
        let (requests2, inferences2) = monitor.take_activity_counts().await;
        assert_eq!(requests2, 0);
        assert_eq!(inferences2, 0);
    }
}
