//! Per-worker health monitoring
//!
//! Periodic check rounds score each worker 0-100; consecutive failing
//! rounds escalate to a restart-required event. A stopped monitor emits
//! nothing.

use crate::config::HealthConfig;
use crate::error::Result;
use crate::monitoring::WorkerMetrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const HISTORY_CAP: usize = 100;

/// Health status bands derived from the score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Down,
}

impl HealthStatus {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            Self::Healthy
        } else if score >= 60.0 {
            Self::Warning
        } else if score >= 30.0 {
            Self::Critical
        } else {
            Self::Down
        }
    }
}

/// One check's outcome within a round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub elapsed_ms: u64,
    pub detail: Option<String>,
}

/// A scored health round for one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub worker_id: String,
    pub status: HealthStatus,
    pub score: f64,
    pub consecutive_failures: u32,
    pub last_check_at: i64,
    pub checks: Vec<CheckResult>,
}

/// Worker under probe
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub worker_id: String,
    pub port: u16,
    pub metrics: Option<WorkerMetrics>,
}

/// Where the monitor finds its targets each round
#[async_trait]
pub trait WorkerDirectory: Send + Sync {
    async fn targets(&self) -> Vec<ProbeTarget>;
}

/// A single health check
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;
    /// `Ok(None)` means the check abstained (e.g. no metrics yet).
    async fn check(&self, target: &ProbeTarget) -> Result<Option<bool>>;
}

/// Memory below threshold, judged from the worker's self-reported metrics
pub struct MemoryCheck {
    pub threshold_percent: f64,
}

#[async_trait]
impl HealthCheck for MemoryCheck {
    fn name(&self) -> &str {
        "memory"
    }

    async fn check(&self, target: &ProbeTarget) -> Result<Option<bool>> {
        Ok(target
            .metrics
            .as_ref()
            .map(|m| m.memory.percentage < self.threshold_percent))
    }
}

/// CPU below threshold
pub struct CpuCheck {
    pub threshold_percent: f64,
}

#[async_trait]
impl HealthCheck for CpuCheck {
    fn name(&self) -> &str {
        "cpu"
    }

    async fn check(&self, target: &ProbeTarget) -> Result<Option<bool>> {
        Ok(target
            .metrics
            .as_ref()
            .map(|m| m.cpu.current < self.threshold_percent))
    }
}

/// Event-loop delay under the limit
pub struct EventLoopCheck {
    pub max_delay_ms: f64,
}

#[async_trait]
impl HealthCheck for EventLoopCheck {
    fn name(&self) -> &str {
        "event-loop"
    }

    async fn check(&self, target: &ProbeTarget) -> Result<Option<bool>> {
        Ok(target
            .metrics
            .as_ref()
            .map(|m| m.event_loop.delay_ms < self.max_delay_ms))
    }
}

/// HTTP GET probe against the worker's health endpoint
pub struct HttpCheck {
    pub endpoint: String,
    client: reqwest::Client,
}

impl HttpCheck {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            endpoint: endpoint.to_string(),
            client,
        }
    }
}

#[async_trait]
impl HealthCheck for HttpCheck {
    fn name(&self) -> &str {
        "http"
    }

    async fn check(&self, target: &ProbeTarget) -> Result<Option<bool>> {
        let url = format!("http://127.0.0.1:{}{}", target.port, self.endpoint);
        match self.client.get(&url).send().await {
            Ok(response) => Ok(Some(response.status().is_success())),
            Err(_) => Ok(Some(false)),
        }
    }
}

/// Health transition events
#[derive(Debug, Clone)]
pub enum HealthEvent {
    RestartRequired { worker_id: String, reason: String },
    Warning { worker_id: String },
    Recovered { worker_id: String },
    Critical { worker_id: String },
}

struct WorkerHealthState {
    latest: WorkerHealth,
    history: VecDeque<WorkerHealth>,
    restart_emitted: bool,
}

/// The monitor: owns health scores and failure counters exclusively
pub struct HealthMonitor {
    config: HealthConfig,
    checks: RwLock<Vec<Arc<dyn HealthCheck>>>,
    state: RwLock<HashMap<String, WorkerHealthState>>,
    events: broadcast::Sender<HealthEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs);
        let checks: Vec<Arc<dyn HealthCheck>> = vec![
            Arc::new(MemoryCheck {
                threshold_percent: config.memory_threshold_percent,
            }),
            Arc::new(CpuCheck {
                threshold_percent: config.cpu_threshold_percent,
            }),
            Arc::new(EventLoopCheck {
                max_delay_ms: config.event_loop_delay_ms as f64,
            }),
            Arc::new(HttpCheck::new(&config.endpoint, timeout)),
        ];
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            checks: RwLock::new(checks),
            state: RwLock::new(HashMap::new()),
            events,
            task: Mutex::new(None),
        }
    }

    /// Replace the default check set (tests, custom deployments).
    pub async fn set_checks(&self, checks: Vec<Arc<dyn HealthCheck>>) {
        *self.checks.write().await = checks;
    }

    pub async fn add_check(&self, check: Arc<dyn HealthCheck>) {
        self.checks.write().await.push(check);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Run one round over every target; returns the scored results.
    pub async fn run_round(&self, targets: &[ProbeTarget]) -> Vec<WorkerHealth> {
        let checks = self.checks.read().await.clone();
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let mut results = Vec::with_capacity(targets.len());

        for target in targets {
            let mut check_results = Vec::with_capacity(checks.len());
            for check in &checks {
                let start = Instant::now();
                let outcome = match tokio::time::timeout(timeout, check.check(target)).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(e)) => {
                        debug!(check = check.name(), error = %e, "health check errored");
                        Some(false)
                    }
                    // An individual check timing out is a failure of that check
                    Err(_) => Some(false),
                };
                if let Some(passed) = outcome {
                    check_results.push(CheckResult {
                        name: check.name().to_string(),
                        passed,
                        elapsed_ms: start.elapsed().as_millis() as u64,
                        detail: None,
                    });
                }
            }

            let health = self.score(target, check_results).await;
            results.push(health);
        }
        results
    }

    async fn score(&self, target: &ProbeTarget, checks: Vec<CheckResult>) -> WorkerHealth {
        let total = checks.len();
        let passed = checks.iter().filter(|c| c.passed).count();
        let score = if total == 0 {
            100.0
        } else {
            100.0 * passed as f64 / total as f64
        };
        let status = HealthStatus::from_score(score);
        let round_passed = status == HealthStatus::Healthy;

        let mut state = self.state.write().await;
        let entry = state
            .entry(target.worker_id.clone())
            .or_insert_with(|| WorkerHealthState {
                latest: WorkerHealth {
                    worker_id: target.worker_id.clone(),
                    status: HealthStatus::Healthy,
                    score: 100.0,
                    consecutive_failures: 0,
                    last_check_at: 0,
                    checks: Vec::new(),
                },
                history: VecDeque::new(),
                restart_emitted: false,
            });

        let previous_status = entry.latest.status;
        let consecutive_failures = if round_passed {
            entry.restart_emitted = false;
            0
        } else {
            entry.latest.consecutive_failures + 1
        };

        let health = WorkerHealth {
            worker_id: target.worker_id.clone(),
            status,
            score,
            consecutive_failures,
            last_check_at: chrono::Utc::now().timestamp_millis(),
            checks,
        };

        entry.latest = health.clone();
        entry.history.push_back(health.clone());
        while entry.history.len() > HISTORY_CAP {
            entry.history.pop_front();
        }

        // Transition events
        match (previous_status, status) {
            (HealthStatus::Healthy, HealthStatus::Warning) => {
                let _ = self.events.send(HealthEvent::Warning {
                    worker_id: target.worker_id.clone(),
                });
            }
            (prev, HealthStatus::Healthy) if prev != HealthStatus::Healthy => {
                info!(worker = %target.worker_id, "worker health recovered");
                let _ = self.events.send(HealthEvent::Recovered {
                    worker_id: target.worker_id.clone(),
                });
            }
            (prev, HealthStatus::Critical | HealthStatus::Down)
                if prev == HealthStatus::Healthy || prev == HealthStatus::Warning =>
            {
                warn!(worker = %target.worker_id, score, "worker health critical");
                let _ = self.events.send(HealthEvent::Critical {
                    worker_id: target.worker_id.clone(),
                });
            }
            _ => {}
        }

        if consecutive_failures >= self.config.max_failures && !entry.restart_emitted {
            entry.restart_emitted = true;
            warn!(worker = %target.worker_id, consecutive_failures, "restart required");
            let _ = self.events.send(HealthEvent::RestartRequired {
                worker_id: target.worker_id.clone(),
                reason: "health_check_failure".to_string(),
            });
        }

        health
    }

    pub async fn latest(&self, worker_id: &str) -> Option<WorkerHealth> {
        self.state
            .read()
            .await
            .get(worker_id)
            .map(|s| s.latest.clone())
    }

    pub async fn history(&self, worker_id: &str) -> Vec<WorkerHealth> {
        self.state
            .read()
            .await
            .get(worker_id)
            .map(|s| s.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget a worker (removed or replaced).
    pub async fn forget(&self, worker_id: &str) {
        self.state.write().await.remove(worker_id);
    }

    /// Cluster-level summary over the latest rounds.
    pub async fn overall(&self) -> (HealthStatus, usize, usize) {
        let state = self.state.read().await;
        let total = state.len();
        let healthy = state
            .values()
            .filter(|s| s.latest.status == HealthStatus::Healthy)
            .count();
        let status = if total == 0 || healthy * 2 >= total {
            if healthy == total {
                HealthStatus::Healthy
            } else {
                HealthStatus::Warning
            }
        } else {
            HealthStatus::Critical
        };
        (status, healthy, total)
    }

    /// Start the periodic loop against the given directory. While stopped,
    /// no checks run and no events fire.
    pub async fn start(self: &Arc<Self>, directory: Arc<dyn WorkerDirectory>) {
        let monitor = Arc::clone(self);
        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Workers need one interval to come up before the first probe
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let targets = directory.targets().await;
                monitor.run_round(&targets).await;
            }
        });
        let mut guard = self.task.lock().await;
        if let Some(previous) = guard.take() {
            previous.abort();
        }
        *guard = Some(task);
    }

    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedCheck {
        name: String,
        passes: std::sync::atomic::AtomicBool,
    }

    impl FixedCheck {
        fn new(name: &str, passes: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                passes: std::sync::atomic::AtomicBool::new(passes),
            })
        }

        fn set(&self, passes: bool) {
            self.passes
                .store(passes, std::sync::atomic::Ordering::Relaxed);
        }
    }

    #[async_trait]
    impl HealthCheck for FixedCheck {
        fn name(&self) -> &str {
            &self.name
        }

        async fn check(&self, _target: &ProbeTarget) -> Result<Option<bool>> {
            Ok(Some(self.passes.load(std::sync::atomic::Ordering::Relaxed)))
        }
    }

    fn target(id: &str) -> ProbeTarget {
        ProbeTarget {
            worker_id: id.to_string(),
            port: 0,
            metrics: None,
        }
    }

    fn config(max_failures: u32) -> HealthConfig {
        HealthConfig {
            max_failures,
            ..HealthConfig::default()
        }
    }

    #[tokio::test]
    async fn test_score_bands() {
        assert_eq!(HealthStatus::from_score(100.0), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_score(80.0), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_score(75.0), HealthStatus::Warning);
        assert_eq!(HealthStatus::from_score(50.0), HealthStatus::Critical);
        assert_eq!(HealthStatus::from_score(10.0), HealthStatus::Down);
    }

    #[tokio::test]
    async fn test_all_pass_scores_hundred() {
        let monitor = Arc::new(HealthMonitor::new(config(3)));
        monitor
            .set_checks(vec![FixedCheck::new("a", true), FixedCheck::new("b", true)])
            .await;

        let results = monitor.run_round(&[target("w1")]).await;
        assert_eq!(results[0].score, 100.0);
        assert_eq!(results[0].status, HealthStatus::Healthy);
        assert_eq!(results[0].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_consecutive_failures_trigger_restart_event() {
        let monitor = Arc::new(HealthMonitor::new(config(3)));
        monitor.set_checks(vec![FixedCheck::new("down", false)]).await;
        let mut events = monitor.subscribe();

        for _ in 0..3 {
            monitor.run_round(&[target("w1")]).await;
        }

        let mut restart = None;
        while let Ok(event) = events.try_recv() {
            if let HealthEvent::RestartRequired { worker_id, reason } = event {
                restart = Some((worker_id, reason));
            }
        }
        let (worker_id, reason) = restart.expect("restart event expected");
        assert_eq!(worker_id, "w1");
        assert_eq!(reason, "health_check_failure");

        // The event fires once, not on every subsequent failing round
        monitor.run_round(&[target("w1")]).await;
        let mut again = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, HealthEvent::RestartRequired { .. }) {
                again = true;
            }
        }
        assert!(!again);
    }

    #[tokio::test]
    async fn test_pass_resets_consecutive_failures_and_recovers() {
        let monitor = Arc::new(HealthMonitor::new(config(5)));
        let flaky = FixedCheck::new("flaky", false);
        monitor.set_checks(vec![flaky.clone()]).await;
        let mut events = monitor.subscribe();

        monitor.run_round(&[target("w1")]).await;
        monitor.run_round(&[target("w1")]).await;
        assert_eq!(monitor.latest("w1").await.unwrap().consecutive_failures, 2);

        flaky.set(true);
        let results = monitor.run_round(&[target("w1")]).await;
        assert_eq!(results[0].consecutive_failures, 0);
        assert_eq!(results[0].status, HealthStatus::Healthy);

        let mut recovered = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, HealthEvent::Recovered { .. }) {
                recovered = true;
            }
        }
        assert!(recovered);
    }

    #[tokio::test]
    async fn test_history_capped_at_hundred() {
        let monitor = Arc::new(HealthMonitor::new(config(1_000)));
        monitor.set_checks(vec![FixedCheck::new("ok", true)]).await;

        for _ in 0..130 {
            monitor.run_round(&[target("w1")]).await;
        }
        assert_eq!(monitor.history("w1").await.len(), HISTORY_CAP);
    }

    #[tokio::test]
    async fn test_metrics_checks_abstain_without_snapshot() {
        let monitor = Arc::new(HealthMonitor::new(config(3)));
        monitor
            .set_checks(vec![Arc::new(MemoryCheck {
                threshold_percent: 90.0,
            })])
            .await;

        // No metrics snapshot: the memory check abstains, leaving a clean
        // 100 score rather than a false failure.
        let results = monitor.run_round(&[target("w1")]).await;
        assert_eq!(results[0].score, 100.0);
        assert!(results[0].checks.is_empty());
    }

    #[tokio::test]
    async fn test_overall_summary() {
        let monitor = Arc::new(HealthMonitor::new(config(3)));
        monitor.set_checks(vec![FixedCheck::new("ok", true)]).await;
        monitor.run_round(&[target("w1"), target("w2")]).await;

        let (status, healthy, total) = monitor.overall().await;
        assert_eq!(status, HealthStatus::Healthy);
        assert_eq!(healthy, 2);
        assert_eq!(total, 2);
    }
}
