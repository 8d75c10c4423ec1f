//! Service Supervisor (C5): owns the lifecycle of directly-spawned child
//! processes. Structurally grounded on the teacher's `docker::DockerManager`
//! (a `*Manager` struct wrapping per-resource async operations, bookkept in
//! an `Arc<RwLock<HashMap<...>>>`) and `scheduler::gate::ConcurrencyGate`
//! (per-key serialization so two concurrent `start`s can't both spawn). The
//! container-specific internals are replaced with raw OS process control —
//! `tokio::process::Command` to spawn, `nix` to signal and detach a session,
//! since this daemon supervises real child processes rather than containers.

use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, RwLock};

use crate::error::{ApiError, ApiResult};
use crate::model::{ServiceRuntime, ServiceSpec, ServiceStatus};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const SPAWN_HEALTH_CHECK_DELAY: Duration = Duration::from_secs(2);
const SIGTERM_GRACE: Duration = Duration::from_secs(1);
const OUTPUT_TAIL_BYTES: usize = 500;
const AUTO_RESTART_MAX: usize = 3;
const AUTO_RESTART_WINDOW_SECS: i64 = 300;

struct RunningChild {
    child: tokio::process::Child,
    output_tail: Arc<Mutex<String>>,
}

struct Entry {
    spec: ServiceSpec,
    runtime: ServiceRuntime,
    handle: Option<RunningChild>,
    restart_attempts: Vec<chrono::DateTime<Utc>>,
}

/// Cloning is cheap — clones share the same underlying data via `Arc`.
#[derive(Clone)]
pub struct ServiceSupervisor {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    locks: Arc<RwLock<HashMap<String, Arc<Mutex<()>>>>>,
    http: reqwest::Client,
}

impl ServiceSupervisor {
    pub fn new(specs: Vec<ServiceSpec>) -> Self {
        let entries = specs
            .into_iter()
            .map(|spec| {
                let id = spec.id.clone();
                (
                    id,
                    Entry {
                        spec,
                        runtime: ServiceRuntime::stopped(),
                        handle: None,
                        restart_attempts: Vec::new(),
                    },
                )
            })
            .collect();
        Self {
            entries: Arc::new(RwLock::new(entries)),
            locks: Arc::new(RwLock::new(HashMap::new())),
            http: reqwest::Client::builder()
                .timeout(HEALTH_CHECK_TIMEOUT)
                .build()
                .expect("reqwest client"),
        }
    }

    async fn lock_for(&self, service_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.write().await;
        locks
            .entry(service_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn probe_health(&self, url: &str) -> bool {
        self.http
            .get(url)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// Startup-only reconciliation: probes every `stopped` service's health
    /// URL and adopts it as `running` if already serving (SPEC_FULL §4.4,
    /// testable property 9).
    pub async fn detect_existing(&self) {
        let ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        for id in ids {
            let (health_url, port, is_stopped) = {
                let entries = self.entries.read().await;
                let Some(entry) = entries.get(&id) else { continue };
                (
                    entry.spec.health_url.clone(),
                    entry.spec.port,
                    entry.runtime.status == Some(ServiceStatus::Stopped),
                )
            };
            if !is_stopped {
                continue;
            }
            if self.probe_health(&health_url).await {
                let pid = probe_pid_by_port(port).await;
                let mut entries = self.entries.write().await;
                if let Some(entry) = entries.get_mut(&id) {
                    entry.runtime = ServiceRuntime {
                        status: Some(ServiceStatus::Running),
                        pid,
                        started_at: Some(Utc::now()),
                        last_error: None,
                    };
                    tracing::info!(service = %id, pid = ?pid, "detected externally-running service");
                }
            }
        }
    }

    pub async fn start(&self, service_id: &str) -> ApiResult<()> {
        let lock = self.lock_for(service_id).await;
        let _guard = lock.lock().await;

        let spec = {
            let entries = self.entries.read().await;
            let entry = entries
                .get(service_id)
                .ok_or_else(|| ApiError::NotFound(format!("no such service '{service_id}'")))?;
            match entry.runtime.status {
                Some(ServiceStatus::Stopped) | Some(ServiceStatus::Error) | None => {}
                _ => {
                    return Err(ApiError::Conflict(format!(
                        "service '{service_id}' is already running"
                    )))
                }
            }
            entry.spec.clone()
        };

        if self.probe_health(&spec.health_url).await {
            return Err(ApiError::Conflict(format!(
                "service '{service_id}' is already running"
            )));
        }

        {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get_mut(service_id) {
                entry.runtime = ServiceRuntime {
                    status: Some(ServiceStatus::Starting),
                    ..Default::default()
                };
            }
        }

        let mut cmd = build_command(&spec);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                let mut entries = self.entries.write().await;
                if let Some(entry) = entries.get_mut(service_id) {
                    entry.runtime = ServiceRuntime {
                        status: Some(ServiceStatus::Error),
                        last_error: Some(format!("spawn failed: {err}")),
                        ..Default::default()
                    };
                }
                return Ok(());
            }
        };

        let pid = child.id();
        let output_tail = Arc::new(Mutex::new(String::new()));
        spawn_output_collector(&mut child, output_tail.clone());

        {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get_mut(service_id) {
                entry.handle = Some(RunningChild { child, output_tail });
                entry.runtime.pid = pid;
            }
        }

        tokio::time::sleep(SPAWN_HEALTH_CHECK_DELAY).await;

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(service_id) {
            let exited = entry
                .handle
                .as_mut()
                .map(|h| h.child.try_wait().ok().flatten().is_some())
                .unwrap_or(true);
            if exited {
                let (exit_code, tail) = if let Some(h) = entry.handle.as_mut() {
                    let code = h.child.try_wait().ok().flatten().and_then(|s| s.code());
                    let tail = h.output_tail.lock().await.clone();
                    (code, tail)
                } else {
                    (None, String::new())
                };
                entry.runtime = ServiceRuntime {
                    status: Some(ServiceStatus::Error),
                    last_error: Some(format!(
                        "exited with code {:?}: {}",
                        exit_code,
                        tail_str(&tail, OUTPUT_TAIL_BYTES)
                    )),
                    ..Default::default()
                };
                entry.handle = None;
            } else {
                entry.runtime.status = Some(ServiceStatus::Running);
                entry.runtime.started_at = Some(Utc::now());
            }
        }

        Ok(())
    }

    pub async fn stop(&self, service_id: &str) -> ApiResult<()> {
        let lock = self.lock_for(service_id).await;
        let _guard = lock.lock().await;

        let (pid, port) = {
            let entries = self.entries.read().await;
            let entry = entries
                .get(service_id)
                .ok_or_else(|| ApiError::NotFound(format!("no such service '{service_id}'")))?;
            (entry.runtime.pid, entry.spec.port)
        };

        if let Some(pid) = pid {
            terminate_pid(pid).await;
        }
        if let Some(external_pid) = probe_pid_by_port(port).await {
            terminate_pid(external_pid).await;
        }

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(service_id) {
            if let Some(mut handle) = entry.handle.take() {
                let _ = handle.child.kill().await;
            }
            entry.runtime = ServiceRuntime::stopped();
        }
        Ok(())
    }

    pub async fn restart(&self, service_id: &str) -> ApiResult<()> {
        self.stop(service_id).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.start(service_id).await
    }

    pub async fn start_all(&self) -> HashMap<String, ApiResult<()>> {
        let ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        let mut results = HashMap::new();
        for id in ids {
            results.insert(id.clone(), self.start(&id).await);
        }
        results
    }

    pub async fn stop_all(&self) -> HashMap<String, ApiResult<()>> {
        let ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        let mut results = HashMap::new();
        for id in ids {
            results.insert(id.clone(), self.stop(&id).await);
        }
        results
    }

    /// Reconciles running services against their health URL; called on each
    /// GET of the service list (SPEC_FULL §4.4).
    pub async fn reconcile(&self) {
        let ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        for id in ids {
            let (status, health_url) = {
                let entries = self.entries.read().await;
                let Some(entry) = entries.get(&id) else { continue };
                (entry.runtime.status, entry.spec.health_url.clone())
            };
            if status != Some(ServiceStatus::Running) {
                continue;
            }
            if self.probe_health(&health_url).await {
                continue;
            }
            let mut entries = self.entries.write().await;
            let Some(entry) = entries.get_mut(&id) else { continue };
            let exit_status = match entry.handle.as_mut() {
                Some(h) => h.child.try_wait().ok().flatten(),
                None => None,
            };
            let last_error = match exit_status {
                Some(status) => format!("process exited with code {:?}", status.code()),
                None => "health check failed".to_string(),
            };
            entry.runtime.status = Some(ServiceStatus::Error);
            entry.runtime.last_error = Some(last_error);
            self.maybe_auto_restart(&id, entry);
        }
    }

    fn maybe_auto_restart(&self, service_id: &str, entry: &mut Entry) {
        if !entry.spec.auto_restart {
            return;
        }
        let now = Utc::now();
        let cutoff = now - chrono::Duration::seconds(AUTO_RESTART_WINDOW_SECS);
        entry.restart_attempts.retain(|t| *t >= cutoff);
        if entry.restart_attempts.len() >= AUTO_RESTART_MAX {
            tracing::warn!(service = %service_id, "auto_restart budget exhausted for this window");
            return;
        }
        entry.restart_attempts.push(now);
        let supervisor = self.clone();
        let id = service_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = supervisor.start(&id).await {
                tracing::warn!(service = %id, error = %err, "auto_restart attempt failed");
            }
        });
    }

    pub async fn list(&self) -> Vec<(ServiceSpec, ServiceRuntime)> {
        self.entries
            .read()
            .await
            .values()
            .map(|e| (e.spec.clone(), e.runtime.clone()))
            .collect()
    }

    pub async fn memory_totals_mb(&self) -> f64 {
        let entries = self.entries.read().await;
        let mut total = 0.0;
        for entry in entries.values() {
            if let Some(pid) = entry.runtime.pid {
                if let Some(mb) = probe_rss_mb(pid).await {
                    total += mb;
                }
            }
        }
        total
    }
}

fn build_command(spec: &ServiceSpec) -> tokio::process::Command {
    let (program, args) = spec
        .command
        .split_first()
        .expect("ServiceSpec.command must be non-empty");
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .current_dir(&spec.working_dir)
        .envs(&spec.env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }
    cmd
}

fn spawn_output_collector(child: &mut tokio::process::Child, tail: Arc<Mutex<String>>) {
    if let Some(mut stdout) = child.stdout.take() {
        let tail = tail.clone();
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout.read_to_end(&mut buf).await;
            let mut t = tail.lock().await;
            t.push_str(&String::from_utf8_lossy(&buf));
        });
    }
    if let Some(mut stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            let mut t = tail.lock().await;
            t.push_str(&String::from_utf8_lossy(&buf));
        });
    }
}

fn tail_str(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        s.to_string()
    } else {
        s[s.len() - max_bytes..].to_string()
    }
}

async fn terminate_pid(pid: u32) {
    let nix_pid = Pid::from_raw(pid as i32);
    if signal::kill(nix_pid, Signal::SIGTERM).is_err() {
        return;
    }
    tokio::time::sleep(SIGTERM_GRACE).await;
    if signal::kill(nix_pid, None::<Signal>).is_ok() {
        let _ = signal::kill(nix_pid, Signal::SIGKILL);
    }
}

async fn probe_pid_by_port(port: u16) -> Option<u32> {
    let output = tokio::process::Command::new("lsof")
        .args(["-t", "-i", &format!(":{port}"), "-sTCP:LISTEN"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()?
        .lines()
        .next()?
        .trim()
        .parse()
        .ok()
}

async fn probe_rss_mb(pid: u32) -> Option<f64> {
    let output = tokio::process::Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "rss="])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .map(|kb| kb / 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn spec(id: &str, port: u16) -> ServiceSpec {
        ServiceSpec {
            id: id.to_string(),
            display_name: id.to_string(),
            kind: crate::model::ServiceKind::Other,
            command: vec!["true".to_string()],
            working_dir: "/tmp".to_string(),
            port,
            health_url: format!("http://127.0.0.1:{port}/health"),
            auto_restart: false,
            env: StdHashMap::new(),
        }
    }

    #[tokio::test]
    async fn new_services_start_stopped() {
        let sup = ServiceSupervisor::new(vec![spec("vibevoice", 8880)]);
        let list = sup.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].1.status, Some(ServiceStatus::Stopped));
    }

    #[tokio::test]
    async fn start_unknown_service_is_not_found() {
        let sup = ServiceSupervisor::new(vec![]);
        let err = sup.start("nope").await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn two_concurrent_starts_spawn_at_most_one_process() {
        // The command must still be alive past SPAWN_HEALTH_CHECK_DELAY, or
        // the first call's health check already flips it back to Error
        // before the second call's lock acquisition, and both succeed.
        let long_lived = ServiceSpec {
            command: vec!["sleep".to_string(), "5".to_string()],
            ..spec("echo", 48123)
        };
        let sup = ServiceSupervisor::new(vec![long_lived]);
        let sup_a = sup.clone();
        let sup_b = sup.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { sup_a.start("echo").await }),
            tokio::spawn(async move { sup_b.start("echo").await }),
        );
        let a = a.unwrap();
        let b = b.unwrap();
        let outcomes = [&a, &b];
        let oks = outcomes.iter().filter(|r| r.is_ok()).count();
        let errs: Vec<_> = outcomes.iter().filter_map(|r| r.as_ref().err()).collect();
        assert_eq!(oks, 1, "exactly one concurrent start should spawn");
        assert_eq!(errs.len(), 1);
        assert!(matches!(errs[0], ApiError::Conflict(_)));
        sup.stop("echo").await.ok();
    }

    #[tokio::test]
    async fn stop_is_idempotent_on_stopped_service() {
        let sup = ServiceSupervisor::new(vec![spec("vibevoice", 8881)]);
        sup.stop("vibevoice").await.unwrap();
        sup.stop("vibevoice").await.unwrap();
        assert_eq!(
            sup.list().await[0].1.status,
            Some(ServiceStatus::Stopped)
        );
    }

    #[test]
    fn tail_str_truncates_to_last_n_bytes() {
        let s = "a".repeat(1000);
        assert_eq!(tail_str(&s, 500).len(), 500);
        assert_eq!(tail_str("short", 500), "short");
    }
}
