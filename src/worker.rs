//! Worker process supervision
//!
//! The master owns the worker registry exclusively; every mutation happens
//! through this manager. Workers are OS children of the current executable
//! with `WORKER_ID`/`CLUSTER_MODE` set, speaking IPC over piped stdio.

use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::ipc::IpcBus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Spawning,
    Running,
    Draining,
    Dead,
}

/// The master's record of one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub restart_count: u32,
    pub last_restart_reason: Option<String>,
    pub state: WorkerState,
    pub port: u16,
    pub weight: f64,
}

/// Supervision events
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Spawned {
        worker_id: String,
        pid: u32,
    },
    Exited {
        worker_id: String,
        code: Option<i32>,
        signal: Option<i32>,
    },
    Respawned {
        worker_id: String,
        reason: String,
    },
    RestartBudgetExhausted {
        worker_id: String,
    },
}

struct WorkerHandle {
    record: WorkerRecord,
    index: usize,
    child: Arc<Mutex<Option<Child>>>,
    /// Consecutive over-threshold resource checks
    overage_checks: u32,
}

/// Builds the command used to spawn one worker. Swappable so supervision
/// can be exercised against stand-in processes.
pub type CommandFactory = Arc<dyn Fn(usize, &str, u16) -> Command + Send + Sync>;

fn default_command_factory() -> CommandFactory {
    Arc::new(|index: usize, worker_id: &str, port: u16| {
        let exe = std::env::current_exe().unwrap_or_else(|_| "swarmgate".into());
        let mut cmd = Command::new(exe);
        cmd.env("WORKER_ID", worker_id)
            .env("CLUSTER_MODE", "true")
            .env("WORKER_PORT", port.to_string())
            .env("WORKER_INDEX", index.to_string());
        cmd
    })
}

/// Fork/supervise workers with restart budgets and zombie detection
pub struct WorkerManager {
    config: ClusterConfig,
    bus: Arc<IpcBus>,
    workers: RwLock<HashMap<String, WorkerHandle>>,
    /// Restart timestamps per worker for the per-hour budget
    restart_history: Mutex<HashMap<String, VecDeque<Instant>>>,
    events: broadcast::Sender<WorkerEvent>,
    command_factory: CommandFactory,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerManager {
    pub fn new(config: ClusterConfig, bus: Arc<IpcBus>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            bus,
            workers: RwLock::new(HashMap::new()),
            restart_history: Mutex::new(HashMap::new()),
            events,
            command_factory: default_command_factory(),
            supervisor: Mutex::new(None),
        }
    }

    pub fn with_command_factory(mut self, factory: CommandFactory) -> Self {
        self.command_factory = factory;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub fn worker_port(&self, index: usize) -> u16 {
        self.config.base_port + index as u16
    }

    /// Spawn the worker at `index`. The worker id is stable across
    /// respawns of the same slot.
    pub async fn spawn_worker(&self, index: usize) -> Result<WorkerRecord> {
        let worker_id = format!("w{}", index);
        let port = self.worker_port(index);

        let (restart_count, reason) = {
            let workers = self.workers.read().await;
            match workers.get(&worker_id) {
                Some(handle) => (
                    handle.record.restart_count,
                    handle.record.last_restart_reason.clone(),
                ),
                None => (0, None),
            }
        };

        let mut cmd = (self.command_factory)(index, &worker_id, port);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Transient(format!("worker spawn failed: {}", e)))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Internal("spawned worker has no pid".to_string()))?;

        // Wire stdio into the bus before the worker can emit anything
        if let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) {
            self.bus.attach_peer(&worker_id, stdout, stdin);
        }

        let record = WorkerRecord {
            worker_id: worker_id.clone(),
            pid,
            started_at: Utc::now(),
            restart_count,
            last_restart_reason: reason,
            state: WorkerState::Running,
            port,
            weight: 1.0,
        };

        let handle = WorkerHandle {
            record: record.clone(),
            index,
            child: Arc::new(Mutex::new(Some(child))),
            overage_checks: 0,
        };
        self.workers.write().await.insert(worker_id.clone(), handle);

        info!(worker = %worker_id, pid, port, "worker spawned");
        let _ = self.events.send(WorkerEvent::Spawned { worker_id, pid });
        Ok(record)
    }

    /// Spawn workers 0..count.
    pub async fn spawn_all(&self, count: usize) -> Result<Vec<WorkerRecord>> {
        let mut records = Vec::with_capacity(count);
        for index in 0..count {
            records.push(self.spawn_worker(index).await?);
        }
        Ok(records)
    }

    pub async fn records(&self) -> Vec<WorkerRecord> {
        self.workers
            .read()
            .await
            .values()
            .map(|h| h.record.clone())
            .collect()
    }

    pub async fn record(&self, worker_id: &str) -> Option<WorkerRecord> {
        self.workers
            .read()
            .await
            .get(worker_id)
            .map(|h| h.record.clone())
    }

    pub async fn running_count(&self) -> usize {
        self.workers
            .read()
            .await
            .values()
            .filter(|h| h.record.state == WorkerState::Running)
            .count()
    }

    pub async fn set_state(&self, worker_id: &str, state: WorkerState) {
        if let Some(handle) = self.workers.write().await.get_mut(worker_id) {
            handle.record.state = state;
        }
    }

    pub async fn set_weight(&self, worker_id: &str, weight: f64) {
        if let Some(handle) = self.workers.write().await.get_mut(worker_id) {
            handle.record.weight = weight;
        }
    }

    /// Graceful stop: IPC shutdown, wait, escalate to SIGKILL.
    pub async fn shutdown_worker(&self, worker_id: &str, reason: &str) -> Result<()> {
        {
            let mut workers = self.workers.write().await;
            let handle = workers
                .get_mut(worker_id)
                .ok_or_else(|| Error::Validation(format!("unknown worker: {}", worker_id)))?;
            handle.record.state = WorkerState::Draining;
            handle.record.last_restart_reason = Some(reason.to_string());
        }

        if let Err(e) = self
            .bus
            .send_to_worker(worker_id, "shutdown", serde_json::json!({ "reason": reason }))
            .await
        {
            debug!(worker = %worker_id, error = %e, "shutdown event undeliverable, escalating");
        }

        let graceful = Duration::from_secs(self.config.graceful_shutdown_timeout_secs);
        let kill_after = Duration::from_secs(self.config.kill_timeout_secs);

        if self.wait_for_exit(worker_id, graceful).await {
            self.finalize_exit(worker_id, None, None).await;
            return Ok(());
        }

        warn!(worker = %worker_id, "graceful window elapsed, sending SIGKILL");
        self.kill_worker(worker_id).await;

        if !self.wait_for_exit(worker_id, kill_after).await {
            error!(worker = %worker_id, "worker survived SIGKILL window");
            return Err(Error::Internal(format!(
                "worker {} did not exit after SIGKILL",
                worker_id
            )));
        }
        self.finalize_exit(worker_id, None, Some(9)).await;
        Ok(())
    }

    /// Remove a worker entirely (no respawn).
    pub async fn remove_worker(&self, worker_id: &str, reason: &str) -> Result<()> {
        self.shutdown_worker(worker_id, reason).await?;
        self.workers.write().await.remove(worker_id);
        self.bus.detach_peer(worker_id);
        Ok(())
    }

    async fn kill_worker(&self, worker_id: &str) {
        let child = {
            let workers = self.workers.read().await;
            workers.get(worker_id).map(|h| Arc::clone(&h.child))
        };
        if let Some(child) = child {
            let mut guard = child.lock().await;
            if let Some(child) = guard.as_mut() {
                let _ = child.start_kill();
            }
        }
    }

    async fn wait_for_exit(&self, worker_id: &str, window: Duration) -> bool {
        let deadline = Instant::now() + window;
        loop {
            if self.poll_exit(worker_id).await.is_some() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Non-blocking exit probe; returns (code, signal) once the process is
    /// gone.
    async fn poll_exit(&self, worker_id: &str) -> Option<(Option<i32>, Option<i32>)> {
        let child = {
            let workers = self.workers.read().await;
            workers.get(worker_id).map(|h| Arc::clone(&h.child))
        }?;

        let mut guard = child.lock().await;
        let status = match guard.as_mut() {
            Some(child) => child.try_wait().ok()?,
            None => return Some((None, None)),
        };
        match status {
            Some(status) => {
                *guard = None;
                #[cfg(unix)]
                let signal = {
                    use std::os::unix::process::ExitStatusExt;
                    status.signal()
                };
                #[cfg(not(unix))]
                let signal = None;
                Some((status.code(), signal))
            }
            None => None,
        }
    }

    async fn finalize_exit(&self, worker_id: &str, code: Option<i32>, signal: Option<i32>) {
        self.set_state(worker_id, WorkerState::Dead).await;
        self.bus.detach_peer(worker_id);
        let _ = self.events.send(WorkerEvent::Exited {
            worker_id: worker_id.to_string(),
            code,
            signal,
        });
    }

    /// One supervision sweep: detect exits and zombies, apply respawn
    /// policy. Returns the ids respawned.
    pub async fn supervise_once(&self) -> Vec<String> {
        let worker_ids: Vec<(String, usize, WorkerState)> = {
            let workers = self.workers.read().await;
            workers
                .values()
                .map(|h| (h.record.worker_id.clone(), h.index, h.record.state))
                .collect()
        };

        let mut respawned = Vec::new();
        for (worker_id, index, state) in worker_ids {
            if state == WorkerState::Draining || state == WorkerState::Dead {
                continue;
            }
            let Some((code, signal)) = self.poll_exit(&worker_id).await else {
                continue;
            };

            // Record said running but the pid is gone: zombie or crash
            warn!(worker = %worker_id, ?code, ?signal, "worker exited unexpectedly");
            self.finalize_exit(&worker_id, code, signal).await;

            let clean_exit = code == Some(0);
            if !self.config.respawn || clean_exit {
                continue;
            }

            let reason = match signal {
                Some(sig) => format!("signal_{}", sig),
                None => format!("exit_{}", code.unwrap_or(-1)),
            };
            match self.respawn(&worker_id, index, &reason).await {
                Ok(true) => respawned.push(worker_id),
                Ok(false) => {}
                Err(e) => error!(worker = %worker_id, error = %e, "respawn failed"),
            }
        }
        respawned
    }

    /// Respawn one slot, honouring the hourly budget and exponential
    /// backoff. Returns false when the budget is exhausted.
    pub async fn respawn(&self, worker_id: &str, index: usize, reason: &str) -> Result<bool> {
        if !self.budget_allows(worker_id).await {
            warn!(worker = %worker_id, "restart budget exhausted, worker stays down");
            let _ = self.events.send(WorkerEvent::RestartBudgetExhausted {
                worker_id: worker_id.to_string(),
            });
            return Ok(false);
        }

        let restart_count = {
            let mut workers = self.workers.write().await;
            match workers.get_mut(worker_id) {
                Some(handle) => {
                    handle.record.restart_count += 1;
                    handle.record.last_restart_reason = Some(reason.to_string());
                    handle.record.restart_count
                }
                None => 1,
            }
        };

        let delay = self.backoff_delay(restart_count);
        debug!(worker = %worker_id, restart_count, ?delay, "respawn backoff");
        tokio::time::sleep(delay).await;

        self.spawn_worker(index).await?;
        let _ = self.events.send(WorkerEvent::Respawned {
            worker_id: worker_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(true)
    }

    /// Exponential backoff from the configured delay, capped at 30 s, with
    /// a little jitter against synchronized respawn storms.
    fn backoff_delay(&self, restart_count: u32) -> Duration {
        let base = self.config.restart_delay_ms as f64;
        let exp = base * 2f64.powi(restart_count.saturating_sub(1).min(16) as i32);
        let capped = exp.min(30_000.0);
        let jitter = capped * 0.1 * fastrand::f64();
        Duration::from_millis((capped + jitter) as u64)
    }

    async fn budget_allows(&self, worker_id: &str) -> bool {
        let mut history = self.restart_history.lock().await;
        let entries = history.entry(worker_id.to_string()).or_default();
        let hour_ago = Instant::now() - Duration::from_secs(3_600);
        while entries.front().map(|t| *t < hour_ago).unwrap_or(false) {
            entries.pop_front();
        }
        if entries.len() >= self.config.max_restarts_per_hour as usize {
            return false;
        }
        entries.push_back(Instant::now());
        true
    }

    /// Resource-threshold bookkeeping: sustained overage triggers a
    /// graceful restart with reason `resource_limit`.
    pub async fn note_resource_overage(&self, worker_id: &str, over: bool) -> bool {
        let (should_restart, index) = {
            let mut workers = self.workers.write().await;
            let Some(handle) = workers.get_mut(worker_id) else {
                return false;
            };
            if over {
                handle.overage_checks += 1;
            } else {
                handle.overage_checks = 0;
            }
            (
                handle.overage_checks >= self.config.threshold_check_count,
                handle.index,
            )
        };

        if should_restart {
            info!(worker = %worker_id, "sustained resource overage, restarting");
            if let Err(e) = self.shutdown_worker(worker_id, "resource_limit").await {
                warn!(worker = %worker_id, error = %e, "resource-limit shutdown failed");
            }
            if let Err(e) = self.respawn(worker_id, index, "resource_limit").await {
                error!(worker = %worker_id, error = %e, "resource-limit respawn failed");
            }
        }
        should_restart
    }

    /// Start the periodic supervision loop (exit/zombie polling).
    pub async fn start_supervision(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let interval = Duration::from_secs(self.config.zombie_poll_interval_secs.max(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.supervise_once().await;
            }
        });
        *self.supervisor.lock().await = Some(task);
    }

    /// Stop supervision and shut every worker down.
    pub async fn shutdown_all(&self) {
        if let Some(task) = self.supervisor.lock().await.take() {
            task.abort();
        }
        let ids: Vec<String> = self
            .workers
            .read()
            .await
            .keys()
            .cloned()
            .collect();
        for worker_id in ids {
            if let Err(e) = self.shutdown_worker(&worker_id, "cluster_stop").await {
                warn!(worker = %worker_id, error = %e, "shutdown failed");
            }
        }
        self.workers.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpcConfig;

    fn sleeper_factory() -> CommandFactory {
        Arc::new(|_index, _id, _port| {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg("sleep 30");
            cmd
        })
    }

    fn short_exit_factory() -> CommandFactory {
        Arc::new(|_index, _id, _port| {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg("exit 3");
            cmd
        })
    }

    fn manager(factory: CommandFactory, config: ClusterConfig) -> Arc<WorkerManager> {
        let bus = Arc::new(IpcBus::new(
            crate::ipc::MASTER_ID,
            &IpcConfig::default(),
            None,
        ));
        Arc::new(WorkerManager::new(config, bus).with_command_factory(factory))
    }

    fn fast_config() -> ClusterConfig {
        ClusterConfig {
            enabled: true,
            workers: 2,
            base_port: 9300,
            restart_delay_ms: 1,
            graceful_shutdown_timeout_secs: 1,
            kill_timeout_secs: 2,
            ..ClusterConfig::default()
        }
    }

    #[tokio::test]
    async fn test_spawn_and_record() {
        let manager = manager(sleeper_factory(), fast_config());
        let record = manager.spawn_worker(0).await.unwrap();

        assert_eq!(record.worker_id, "w0");
        assert_eq!(record.port, 9300);
        assert_eq!(record.state, WorkerState::Running);
        assert!(record.pid > 0);
        assert_eq!(manager.running_count().await, 1);

        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_shutdown_escalates_to_kill() {
        // The sleeper ignores the IPC shutdown event, so the manager must
        // escalate to SIGKILL inside the kill window.
        let manager = manager(sleeper_factory(), fast_config());
        manager.spawn_worker(0).await.unwrap();

        manager.shutdown_worker("w0", "test").await.unwrap();
        let record = manager.record("w0").await.unwrap();
        assert_eq!(record.state, WorkerState::Dead);
    }

    #[tokio::test]
    async fn test_supervise_detects_exit_and_respawns() {
        let manager = manager(short_exit_factory(), fast_config());
        manager.spawn_worker(0).await.unwrap();

        // Give the child a moment to exit with code 3
        tokio::time::sleep(Duration::from_millis(200)).await;

        let respawned = manager.supervise_once().await;
        assert_eq!(respawned, vec!["w0".to_string()]);

        let record = manager.record("w0").await.unwrap();
        assert_eq!(record.restart_count, 1);
        assert_eq!(record.last_restart_reason.as_deref(), Some("exit_3"));

        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_restart_budget_exhaustion() {
        let mut config = fast_config();
        config.max_restarts_per_hour = 2;
        let manager = manager(short_exit_factory(), config);
        manager.spawn_worker(0).await.unwrap();

        let mut events = manager.subscribe();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            manager.supervise_once().await;
        }

        let record = manager.record("w0").await.unwrap();
        assert!(record.restart_count <= 2);

        let mut exhausted = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, WorkerEvent::RestartBudgetExhausted { .. }) {
                exhausted = true;
            }
        }
        assert!(exhausted);
    }

    #[tokio::test]
    async fn test_backoff_delay_caps() {
        let manager = manager(sleeper_factory(), fast_config());
        assert!(manager.backoff_delay(1) >= Duration::from_millis(1));
        // Deep restart counts stay capped near 30 s plus jitter
        assert!(manager.backoff_delay(40) <= Duration::from_millis(33_000));
    }

    #[tokio::test]
    async fn test_resource_overage_requires_sustained_checks() {
        let mut config = fast_config();
        config.threshold_check_count = 3;
        let manager = manager(sleeper_factory(), config);
        manager.spawn_worker(1).await.unwrap();

        assert!(!manager.note_resource_overage("w1", true).await);
        assert!(!manager.note_resource_overage("w1", false).await);
        assert!(!manager.note_resource_overage("w1", true).await);
        assert!(!manager.note_resource_overage("w1", true).await);
        // Third consecutive overage triggers the restart
        assert!(manager.note_resource_overage("w1", true).await);

        let record = manager.record("w1").await.unwrap();
        assert_eq!(record.last_restart_reason.as_deref(), Some("resource_limit"));

        manager.shutdown_all().await;
    }
}
