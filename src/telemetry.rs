//! Telemetry Ingest (C6): bounded ring buffers for log entries and metric
//! snapshots, and the `RemoteClient` registry those ingests upsert into.
//!
//! Grounded on `resource_monitor.rs`'s bounded-`VecDeque` ring-buffer idiom
//! (manual `pop_front()` on overflow) and `db/models.rs`'s plain-struct
//! record style for `RemoteClient`.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::model::{ClientStatus, LogEntry, LogLevel, MetricsSnapshot, RemoteClient};

const LOG_CAPACITY: usize = 10_000;
const METRICS_CAPACITY: usize = 1_000;

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct LogCounters {
    pub total: u64,
    pub warnings: u64,
    pub errors: u64,
}

struct Inner {
    logs: VecDeque<LogEntry>,
    metrics: VecDeque<MetricsSnapshot>,
    clients: std::collections::HashMap<String, RemoteClient>,
    counters: LogCounters,
}

/// Cloning is cheap — clones share the same underlying data via `Arc`.
#[derive(Clone)]
pub struct TelemetryIngest {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default, Clone)]
pub struct LogQuery {
    pub levels: Option<Vec<LogLevel>>,
    pub search: Option<String>,
    pub client_id: Option<String>,
    pub label_prefix: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for TelemetryIngest {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryIngest {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                logs: VecDeque::with_capacity(LOG_CAPACITY),
                metrics: VecDeque::with_capacity(METRICS_CAPACITY),
                clients: std::collections::HashMap::new(),
                counters: LogCounters::default(),
            })),
        }
    }

    /// Upserts the `RemoteClient` identified by `client_id`, refreshing
    /// `last_seen`/`status` and incrementing `total_logs` by `log_delta`
    /// (used for both log ingest and plain heartbeats with `log_delta=0`).
    pub async fn touch_client(
        &self,
        client_id: &str,
        client_name: Option<&str>,
        ip: Option<&str>,
        log_delta: u64,
    ) {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let entry = inner
            .clients
            .entry(client_id.to_string())
            .or_insert_with(|| RemoteClient {
                id: client_id.to_string(),
                display_name: client_name.map(str::to_string),
                device_model: None,
                os_version: None,
                app_version: None,
                ip: ip.map(str::to_string),
                first_seen: now,
                last_seen: now,
                status: ClientStatus::Online,
                total_sessions: 1,
                total_logs: 0,
            });
        entry.last_seen = now;
        entry.status = ClientStatus::Online;
        entry.total_logs += log_delta;
        if client_name.is_some() {
            entry.display_name = client_name.map(str::to_string);
        }
        if ip.is_some() {
            entry.ip = ip.map(str::to_string);
        }
    }

    /// Ingests a batch of already-parsed log entries (minting id and
    /// `received_at` per entry), updating counters and the client record.
    /// Returns the finished entries in ingest order for the caller to
    /// broadcast (SPEC_FULL §4.5, §8 scenario S3).
    pub async fn ingest_logs(
        &self,
        client_id: &str,
        client_name: Option<&str>,
        entries: Vec<NewLogEntry>,
    ) -> Vec<LogEntry> {
        let mut finished = Vec::with_capacity(entries.len());
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        for e in entries {
            let entry = LogEntry {
                id: uuid::Uuid::new_v4().to_string(),
                client_id: client_id.to_string(),
                client_name: client_name.map(str::to_string),
                wall_timestamp: e.wall_timestamp.unwrap_or(now),
                received_at: now,
                level: e.level,
                label: e.label,
                message: e.message,
                source_file: e.source_file,
                source_function: e.source_function,
                source_line: e.source_line,
                metadata: e.metadata,
            };
            match entry.level {
                LogLevel::Warning => inner.counters.warnings += 1,
                LogLevel::Error | LogLevel::Critical => inner.counters.errors += 1,
                _ => {}
            }
            inner.counters.total += 1;
            inner.logs.push_back(entry.clone());
            if inner.logs.len() > LOG_CAPACITY {
                inner.logs.pop_front();
            }
            finished.push(entry);
        }
        drop(inner);
        self.touch_client(client_id, client_name, None, finished.len() as u64)
            .await;
        finished
    }

    pub async fn ingest_metrics(&self, client_id: &str, snapshots: Vec<NewMetricsSnapshot>) -> Vec<MetricsSnapshot> {
        let mut finished = Vec::with_capacity(snapshots.len());
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        for s in snapshots {
            let snap = MetricsSnapshot {
                id: uuid::Uuid::new_v4().to_string(),
                client_id: client_id.to_string(),
                received_at: now,
                stt_latency_ms: s.stt_latency_ms,
                llm_ttft_ms: s.llm_ttft_ms,
                tts_ttfb_ms: s.tts_ttfb_ms,
                end_to_end_ms: s.end_to_end_ms,
                cost_usd: s.cost_usd,
                thermal_events: s.thermal_events,
                network_events: s.network_events,
                raw: s.raw,
            };
            inner.metrics.push_back(snap.clone());
            if inner.metrics.len() > METRICS_CAPACITY {
                inner.metrics.pop_front();
            }
            finished.push(snap);
        }
        drop(inner);
        self.touch_client(client_id, None, None, 0).await;
        finished
    }

    pub async fn query_logs(&self, query: &LogQuery) -> (Vec<LogEntry>, usize) {
        let inner = self.inner.read().await;
        let search = query.search.as_ref().map(|s| s.to_lowercase());
        let matched: Vec<&LogEntry> = inner
            .logs
            .iter()
            .rev()
            .filter(|e| {
                query
                    .levels
                    .as_ref()
                    .map(|levels| levels.contains(&e.level))
                    .unwrap_or(true)
            })
            .filter(|e| {
                query
                    .client_id
                    .as_ref()
                    .map(|c| &e.client_id == c)
                    .unwrap_or(true)
            })
            .filter(|e| {
                query
                    .label_prefix
                    .as_ref()
                    .map(|p| e.label.starts_with(p.as_str()))
                    .unwrap_or(true)
            })
            .filter(|e| query.since.map(|s| e.received_at >= s).unwrap_or(true))
            .filter(|e| {
                search
                    .as_ref()
                    .map(|s| {
                        e.message.to_lowercase().contains(s) || e.label.to_lowercase().contains(s)
                    })
                    .unwrap_or(true)
            })
            .collect();
        let total = matched.len();
        let page = matched
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect();
        (page, total)
    }

    pub async fn recent_metrics(&self, limit: usize, offset: usize) -> (Vec<MetricsSnapshot>, usize) {
        let inner = self.inner.read().await;
        let total = inner.metrics.len();
        let page = inner
            .metrics
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        (page, total)
    }

    pub async fn clear_logs(&self) {
        let mut inner = self.inner.write().await;
        inner.logs.clear();
        inner.counters = LogCounters::default();
    }

    pub async fn counters(&self) -> LogCounters {
        self.inner.read().await.counters.clone()
    }

    pub async fn list_clients(&self) -> Vec<RemoteClient> {
        let inner = self.inner.read().await;
        let now = Utc::now();
        inner
            .clients
            .values()
            .cloned()
            .map(|mut c| {
                c.status = ClientStatus::from_last_seen(c.last_seen, now);
                c
            })
            .collect()
    }
}

/// A not-yet-persisted log entry as parsed from a request body, before a
/// `received_at`/`id` is minted.
pub struct NewLogEntry {
    pub wall_timestamp: Option<DateTime<Utc>>,
    pub level: LogLevel,
    pub label: String,
    pub message: String,
    pub source_file: Option<String>,
    pub source_function: Option<String>,
    pub source_line: Option<u32>,
    pub metadata: std::collections::HashMap<String, serde_json::Value>,
}

pub struct NewMetricsSnapshot {
    pub stt_latency_ms: Option<f64>,
    pub llm_ttft_ms: Option<f64>,
    pub tts_ttfb_ms: Option<f64>,
    pub end_to_end_ms: Option<f64>,
    pub cost_usd: Option<f64>,
    pub thermal_events: u32,
    pub network_events: u32,
    pub raw: serde_json::Value,
}

fn new_entry(level: LogLevel, label: &str, message: &str) -> NewLogEntry {
    NewLogEntry {
        wall_timestamp: None,
        level,
        label: label.to_string(),
        message: message.to_string(),
        source_file: None,
        source_function: None,
        source_line: None,
        metadata: std::collections::HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ingesting_a_batch_increments_counters_and_client_record() {
        let ingest = TelemetryIngest::new();
        let batch = vec![
            new_entry(LogLevel::Info, "a", "x"),
            new_entry(LogLevel::Error, "b", "y"),
        ];
        let entries = ingest.ingest_logs("c1", None, batch).await;
        assert_eq!(entries.len(), 2);

        let counters = ingest.counters().await;
        assert_eq!(counters.total, 2);
        assert_eq!(counters.errors, 1);

        let clients = ingest.list_clients().await;
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].total_logs, 2);
    }

    #[tokio::test]
    async fn two_clients_posting_logs_yields_four_entries_and_two_errors() {
        let ingest = TelemetryIngest::new();
        ingest
            .ingest_logs(
                "c1",
                None,
                vec![new_entry(LogLevel::Info, "a", "x"), new_entry(LogLevel::Error, "b", "y")],
            )
            .await;
        ingest
            .ingest_logs(
                "c2",
                None,
                vec![new_entry(LogLevel::Info, "a", "x"), new_entry(LogLevel::Error, "b", "y")],
            )
            .await;

        let (page, total) = ingest
            .query_logs(&LogQuery {
                limit: 100,
                ..Default::default()
            })
            .await;
        assert_eq!(total, 4);
        assert_eq!(page.len(), 4);
        assert_eq!(ingest.counters().await.errors, 2);
    }

    #[tokio::test]
    async fn query_filters_by_level_and_substring() {
        let ingest = TelemetryIngest::new();
        ingest
            .ingest_logs(
                "c1",
                None,
                vec![
                    new_entry(LogLevel::Info, "a", "starting up"),
                    new_entry(LogLevel::Error, "b", "disk full"),
                ],
            )
            .await;

        let (page, _) = ingest
            .query_logs(&LogQuery {
                levels: Some(vec![LogLevel::Error]),
                limit: 100,
                ..Default::default()
            })
            .await;
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].message, "disk full");

        let (page, _) = ingest
            .query_logs(&LogQuery {
                search: Some("STARTING".to_string()),
                limit: 100,
                ..Default::default()
            })
            .await;
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].message, "starting up");
    }

    #[tokio::test]
    async fn results_are_newest_first_and_paginated() {
        let ingest = TelemetryIngest::new();
        ingest
            .ingest_logs(
                "c1",
                None,
                vec![
                    new_entry(LogLevel::Info, "a", "first"),
                    new_entry(LogLevel::Info, "a", "second"),
                    new_entry(LogLevel::Info, "a", "third"),
                ],
            )
            .await;

        let (page, total) = ingest
            .query_logs(&LogQuery {
                limit: 1,
                offset: 0,
                ..Default::default()
            })
            .await;
        assert_eq!(total, 3);
        assert_eq!(page[0].message, "third");
    }

    #[tokio::test]
    async fn ring_buffer_evicts_oldest_beyond_capacity() {
        let ingest = TelemetryIngest::new();
        let batch: Vec<NewLogEntry> = (0..LOG_CAPACITY + 5)
            .map(|i| new_entry(LogLevel::Info, "a", &format!("msg-{i}")))
            .collect();
        ingest.ingest_logs("c1", None, batch).await;

        let (page, total) = ingest
            .query_logs(&LogQuery {
                limit: LOG_CAPACITY + 5,
                ..Default::default()
            })
            .await;
        assert_eq!(total, LOG_CAPACITY);
        assert_eq!(page[0].message, format!("msg-{}", LOG_CAPACITY + 4));
    }

    #[tokio::test]
    async fn clear_logs_resets_entries_and_counters() {
        let ingest = TelemetryIngest::new();
        ingest
            .ingest_logs("c1", None, vec![new_entry(LogLevel::Error, "a", "x")])
            .await;
        ingest.clear_logs().await;

        let (page, total) = ingest
            .query_logs(&LogQuery {
                limit: 100,
                ..Default::default()
            })
            .await;
        assert_eq!(total, 0);
        assert!(page.is_empty());
        assert_eq!(ingest.counters().await.errors, 0);
    }
}
