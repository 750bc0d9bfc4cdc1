//! Cluster manager: one façade over IPC, workers, health, balancing,
//! scaling, and persistence
//!
//! Structural operations (start/stop/add/remove/replace/rolling update)
//! serialize on one internal lock; no two of them ever overlap.

use crate::balancer::{LoadBalancer, Strategy};
use crate::config::Config;
use crate::crypto::CipherSuite;
use crate::error::{Error, Result};
use crate::health::{HealthEvent, HealthMonitor, HealthStatus, ProbeTarget, WorkerDirectory};
use crate::ipc::{EventHandler, FnHandler, IpcBus, RequestTarget, MASTER_ID};
use crate::monitoring::{ClusterMetrics, ExportFormat, MetricsStore, WorkerMetrics};
use crate::persistence::{
    make_store, PersistentClusterState, StateStore, WorkerSummary, STATE_SCHEMA_VERSION,
};
use crate::scaling::{AutoScaler, ScalingDecision, ScalingSignals};
use crate::worker::{CommandFactory, WorkerManager, WorkerState};
use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Cluster lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    Initializing,
    Starting,
    Running,
    Scaling,
    Paused,
    Draining,
    Degraded,
    Stopping,
    Stopped,
}

/// Cluster-level events
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    StateChanged {
        from: ClusterState,
        to: ClusterState,
    },
    WorkerReplaced {
        worker_id: String,
        reason: String,
    },
    RollingUpdateCompleted {
        replaced: usize,
    },
    ScalingApplied {
        from: usize,
        to: usize,
    },
}

struct ClusterDirectory {
    workers: Arc<WorkerManager>,
    metrics: Arc<MetricsStore>,
}

#[async_trait]
impl WorkerDirectory for ClusterDirectory {
    async fn targets(&self) -> Vec<ProbeTarget> {
        self.workers
            .records()
            .await
            .into_iter()
            .filter(|r| r.state == WorkerState::Running)
            .map(|r| ProbeTarget {
                metrics: self.metrics.latest(&r.worker_id),
                worker_id: r.worker_id,
                port: r.port,
            })
            .collect()
    }
}

/// The façade
pub struct ClusterManager {
    config: Config,
    bus: Arc<IpcBus>,
    workers: Arc<WorkerManager>,
    health: Arc<HealthMonitor>,
    balancer: Arc<LoadBalancer>,
    scaler: Arc<AutoScaler>,
    metrics: Arc<MetricsStore>,
    store: Arc<dyn StateStore>,
    state: RwLock<ClusterState>,
    /// Serializes every structural operation
    structural: Mutex<()>,
    events: broadcast::Sender<ClusterEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    last_busy: RwLock<Instant>,
}

impl ClusterManager {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        Self::new_with(config, None, None)
    }

    pub fn new_with(
        mut config: Config,
        custom_store: Option<Arc<dyn StateStore>>,
        command_factory: Option<CommandFactory>,
    ) -> Result<Arc<Self>> {
        // A cluster that signs or encrypts needs a shared secret; generate
        // one for the workers we spawn if the operator did not provide it.
        if (config.ipc.sign || config.ipc.encrypt) && config.ipc.secret.is_none() {
            config.ipc.secret = Some(CipherSuite::generate_secret()?);
        }
        let suite = match config.ipc_secret() {
            Some(secret) => Some(Arc::new(CipherSuite::derive(&secret)?)),
            None => None,
        };

        let bus = Arc::new(IpcBus::new(MASTER_ID, &config.ipc, suite));
        let mut worker_manager = WorkerManager::new(config.cluster.clone(), Arc::clone(&bus));
        match command_factory {
            Some(factory) => worker_manager = worker_manager.with_command_factory(factory),
            None => {
                // Spawned workers must derive the same cipher suite, even
                // when the secret was generated rather than configured.
                if let Some(secret) = config.ipc.secret.clone() {
                    worker_manager = worker_manager.with_command_factory(Arc::new(
                        move |index: usize, worker_id: &str, port: u16| {
                            let exe =
                                std::env::current_exe().unwrap_or_else(|_| "swarmgate".into());
                            let mut cmd = tokio::process::Command::new(exe);
                            cmd.env("WORKER_ID", worker_id)
                                .env("CLUSTER_MODE", "true")
                                .env("WORKER_PORT", port.to_string())
                                .env("WORKER_INDEX", index.to_string())
                                .env("SWARMGATE_IPC_SECRET", &secret);
                            cmd
                        },
                    ));
                }
            }
        }

        let manager = Arc::new(Self {
            bus,
            workers: Arc::new(worker_manager),
            health: Arc::new(HealthMonitor::new(config.health.clone())),
            balancer: Arc::new(LoadBalancer::new(&config.balancer)?),
            scaler: Arc::new(AutoScaler::new(config.scaling.clone())),
            metrics: Arc::new(MetricsStore::new()),
            store: make_store(&config.persistence, custom_store)?,
            state: RwLock::new(ClusterState::Initializing),
            structural: Mutex::new(()),
            events: broadcast::channel(256).0,
            tasks: Mutex::new(Vec::new()),
            last_busy: RwLock::new(Instant::now()),
            config,
        });

        manager.wire_ipc_handlers();
        Ok(manager)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    pub fn bus(&self) -> &Arc<IpcBus> {
        &self.bus
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn metrics_store(&self) -> &Arc<MetricsStore> {
        &self.metrics
    }

    pub fn worker_manager(&self) -> &Arc<WorkerManager> {
        &self.workers
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn state(&self) -> ClusterState {
        *self.state.read().await
    }

    async fn transition(&self, to: ClusterState) {
        let mut state = self.state.write().await;
        let from = *state;
        if from == to {
            return;
        }
        *state = to;
        info!(?from, ?to, "cluster state changed");
        let _ = self.events.send(ClusterEvent::StateChanged { from, to });
    }

    fn wire_ipc_handlers(self: &Arc<Self>) {
        // Worker metrics snapshots feed the store, the balancer, and the
        // resource-threshold restart policy
        self.bus.register_handler(
            "metrics",
            Arc::new(MetricsIngest {
                metrics: Arc::clone(&self.metrics),
                balancer: Arc::clone(&self.balancer),
                workers: Arc::clone(&self.workers),
                memory_threshold_mb: self.config.cluster.memory_threshold_mb,
                cpu_threshold_percent: self.config.cluster.cpu_threshold_percent,
            }),
        );

        self.bus.register_handler(
            "worker:ready",
            Arc::new(FnHandler::new(|from: &str, _payload| {
                debug!(worker = %from, "worker reported ready");
                Ok(serde_json::Value::Null)
            })),
        );
    }

    /// Start the cluster: restore state, spawn workers, begin monitoring.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let _guard = self.structural.lock().await;
        self.transition(ClusterState::Starting).await;

        if let Err(e) = self.restore_state_inner().await {
            warn!(error = %e, "state restore failed, starting fresh");
        }

        let count = if self.config.scaling.enabled {
            self.config
                .effective_worker_count()
                .clamp(self.config.scaling.min_workers, self.config.scaling.max_workers)
        } else {
            self.config.effective_worker_count()
        };

        let records = self.workers.spawn_all(count).await?;
        for record in &records {
            self.balancer
                .register_worker(&record.worker_id, record.weight)
                .await;
        }

        self.workers.start_supervision().await;
        let directory = Arc::new(ClusterDirectory {
            workers: Arc::clone(&self.workers),
            metrics: Arc::clone(&self.metrics),
        });
        self.health.start(directory).await;

        self.spawn_health_reactor().await;
        self.spawn_scaling_loop().await;

        self.transition(ClusterState::Running).await;
        Ok(())
    }

    /// Stop everything and persist final state.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.structural.lock().await;
        self.transition(ClusterState::Stopping).await;

        if let Err(e) = self.save_state().await {
            warn!(error = %e, "final state save failed");
        }

        self.health.stop().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.workers.shutdown_all().await;
        self.bus.shutdown();

        self.transition(ClusterState::Stopped).await;
        Ok(())
    }

    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    /// Pause monitoring and scaling; workers keep serving.
    pub async fn pause(&self) -> Result<()> {
        let _guard = self.structural.lock().await;
        self.health.stop().await;
        self.transition(ClusterState::Paused).await;
        Ok(())
    }

    pub async fn resume(self: &Arc<Self>) -> Result<()> {
        let _guard = self.structural.lock().await;
        let directory = Arc::new(ClusterDirectory {
            workers: Arc::clone(&self.workers),
            metrics: Arc::clone(&self.metrics),
        });
        self.health.start(directory).await;
        self.transition(ClusterState::Running).await;
        Ok(())
    }

    /// Add one worker at the next free slot.
    pub async fn add_worker(&self) -> Result<String> {
        let _guard = self.structural.lock().await;
        let index = self.next_free_index().await;
        let record = self.workers.spawn_worker(index).await?;
        self.balancer
            .register_worker(&record.worker_id, record.weight)
            .await;
        Ok(record.worker_id)
    }

    pub async fn remove_worker(&self, worker_id: &str) -> Result<()> {
        let _guard = self.structural.lock().await;
        self.balancer.remove_worker(worker_id).await;
        self.health.forget(worker_id).await;
        self.metrics.forget(worker_id);
        self.workers.remove_worker(worker_id, "removed").await
    }

    /// Replace a worker in place: shutdown, respawn, fresh breaker state.
    pub async fn replace_worker(&self, worker_id: &str, reason: &str) -> Result<()> {
        let _guard = self.structural.lock().await;
        self.replace_worker_inner(worker_id, reason).await
    }

    async fn replace_worker_inner(&self, worker_id: &str, reason: &str) -> Result<()> {
        let record = self
            .workers
            .record(worker_id)
            .await
            .ok_or_else(|| Error::Validation(format!("unknown worker: {}", worker_id)))?;
        let index = (record.port - self.config.cluster.base_port) as usize;

        self.balancer.set_health(worker_id, false).await;
        self.workers.shutdown_worker(worker_id, reason).await?;
        self.workers.respawn(worker_id, index, reason).await?;

        self.health.forget(worker_id).await;
        self.balancer.reset_circuit_breaker(worker_id).await;
        self.balancer.set_health(worker_id, true).await;

        let _ = self.events.send(ClusterEvent::WorkerReplaced {
            worker_id: worker_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Exclude a worker from balancing while it finishes in-flight work.
    pub async fn drain_worker(&self, worker_id: &str) -> Result<()> {
        self.workers
            .record(worker_id)
            .await
            .ok_or_else(|| Error::Validation(format!("unknown worker: {}", worker_id)))?;
        self.workers
            .set_state(worker_id, WorkerState::Draining)
            .await;
        self.balancer.set_health(worker_id, false).await;
        Ok(())
    }

    /// Replace every worker one cohort at a time while staying available.
    /// Cohort size is bounded by both `max_unavailable` and `max_surge`.
    pub async fn perform_rolling_update(self: &Arc<Self>) -> Result<usize> {
        let _guard = self.structural.lock().await;
        self.transition(ClusterState::Draining).await;

        let records: Vec<_> = self
            .workers
            .records()
            .await
            .into_iter()
            .filter(|r| r.state == WorkerState::Running)
            .collect();

        let cohort_size = self
            .config
            .cluster
            .max_unavailable
            .min(self.config.cluster.max_surge)
            .max(1);
        let mut replaced = 0usize;

        for cohort in records.chunks(cohort_size) {
            let mut handles = Vec::with_capacity(cohort.len());
            for record in cohort {
                let manager = Arc::clone(self);
                let record = record.clone();
                handles.push(tokio::spawn(async move {
                    manager.roll_one(record).await
                }));
            }
            for handle in handles {
                match handle.await {
                    Ok(Ok(())) => replaced += 1,
                    Ok(Err(e)) => warn!(error = %e, "rolling replacement failed"),
                    Err(e) => warn!(error = %e, "rolling replacement task panicked"),
                }
            }
        }

        self.transition(ClusterState::Running).await;
        let _ = self
            .events
            .send(ClusterEvent::RollingUpdateCompleted { replaced });
        info!(replaced, "rolling update completed");
        Ok(replaced)
    }

    /// Drain, replace, and health-gate a single worker slot.
    async fn roll_one(self: Arc<Self>, record: crate::worker::WorkerRecord) -> Result<()> {
        let worker_id = record.worker_id.clone();
        let grace = Duration::from_secs(self.config.cluster.health_check_grace_period_secs);

        // Drain: the balancer stops sending new work
        self.balancer.set_health(&worker_id, false).await;
        self.workers
            .set_state(&worker_id, WorkerState::Draining)
            .await;

        // Wait for in-flight work to finish, bounded by the grace period
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            let active = self
                .metrics
                .latest(&worker_id)
                .map(|m| m.requests.active_requests)
                .unwrap_or(0);
            if active == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.workers
            .shutdown_worker(&worker_id, "rolling_update")
            .await?;
        let index = (record.port - self.config.cluster.base_port) as usize;
        self.workers
            .respawn(&worker_id, index, "rolling_update")
            .await?;

        // Wait for the replacement's first passing health round
        self.health.forget(&worker_id).await;
        self.balancer.reset_circuit_breaker(&worker_id).await;
        if !self.await_first_healthy(&worker_id, grace).await {
            warn!(worker = %worker_id, "replacement never went healthy inside grace period");
        }
        self.balancer.set_health(&worker_id, true).await;
        Ok(())
    }

    async fn await_first_healthy(&self, worker_id: &str, window: Duration) -> bool {
        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            let record = match self.workers.record(worker_id).await {
                Some(record) => record,
                None => return false,
            };
            let target = ProbeTarget {
                worker_id: worker_id.to_string(),
                port: record.port,
                metrics: self.metrics.latest(worker_id),
            };
            let results = self.health.run_round(&[target]).await;
            if results
                .first()
                .map(|h| h.status == HealthStatus::Healthy)
                .unwrap_or(false)
            {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        false
    }

    /// Scale the worker set to `target` slots.
    pub async fn scale_to(self: &Arc<Self>, target: usize) -> Result<()> {
        let _guard = self.structural.lock().await;
        let previous = self.state().await;
        self.transition(ClusterState::Scaling).await;

        let records = self.workers.records().await;
        let current = records
            .iter()
            .filter(|r| r.state == WorkerState::Running)
            .count();

        if target > current {
            for _ in current..target {
                let index = self.next_free_index().await;
                let record = self.workers.spawn_worker(index).await?;
                self.balancer
                    .register_worker(&record.worker_id, record.weight)
                    .await;
            }
        } else if target < current {
            // Drain the highest-index workers first
            let mut running: Vec<_> = records
                .into_iter()
                .filter(|r| r.state == WorkerState::Running)
                .collect();
            running.sort_by(|a, b| b.port.cmp(&a.port));
            for record in running.into_iter().take(current - target) {
                self.balancer.remove_worker(&record.worker_id).await;
                self.health.forget(&record.worker_id).await;
                self.metrics.forget(&record.worker_id);
                if let Err(e) = self
                    .workers
                    .remove_worker(&record.worker_id, "scale_down")
                    .await
                {
                    warn!(worker = %record.worker_id, error = %e, "scale-down removal failed");
                }
            }
        }

        let _ = self.events.send(ClusterEvent::ScalingApplied {
            from: current,
            to: target,
        });
        self.transition(previous).await;
        Ok(())
    }

    async fn next_free_index(&self) -> usize {
        let records = self.workers.records().await;
        let mut used: Vec<usize> = records
            .iter()
            .map(|r| (r.port - self.config.cluster.base_port) as usize)
            .collect();
        used.sort_unstable();
        let mut index = 0;
        for u in used {
            if u == index {
                index += 1;
            }
        }
        index
    }

    /// Latest aggregate metrics.
    pub async fn get_metrics(&self) -> ClusterMetrics {
        self.metrics.aggregate().await
    }

    pub async fn export_metrics(&self, format: ExportFormat) -> Result<String> {
        let aggregate = self.metrics.aggregate().await;
        crate::monitoring::export_metrics(&aggregate, format)
    }

    /// Run one immediate health round.
    pub async fn check_health(&self) -> Vec<crate::health::WorkerHealth> {
        let directory = ClusterDirectory {
            workers: Arc::clone(&self.workers),
            metrics: Arc::clone(&self.metrics),
        };
        let targets = directory.targets().await;
        self.health.run_round(&targets).await
    }

    pub async fn update_load_balancing_strategy(&self, strategy: &str) -> Result<bool> {
        let strategy = Strategy::parse(strategy)?;
        self.balancer.update_strategy(strategy).await
    }

    pub async fn send_to_worker(
        &self,
        worker_id: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.bus.send_to_worker(worker_id, event, payload).await
    }

    pub async fn request_from_worker(
        &self,
        worker_id: &str,
        event: &str,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        self.bus
            .send_request(
                RequestTarget::Peer(worker_id.to_string()),
                event,
                payload,
                timeout,
            )
            .await
    }

    pub async fn broadcast(&self, event: &str, payload: serde_json::Value) -> usize {
        self.bus.broadcast(event, payload).await
    }

    pub async fn is_circuit_open(&self, worker_id: &str) -> bool {
        self.balancer.is_circuit_open(worker_id).await
    }

    pub async fn reset_circuit_breaker(&self, worker_id: &str) -> bool {
        self.balancer.reset_circuit_breaker(worker_id).await
    }

    /// Persist the non-derived cluster state.
    pub async fn save_state(&self) -> Result<()> {
        let records = self.workers.records().await;
        let balancer_stats = self.balancer.stats().await;

        let state = PersistentClusterState {
            version: STATE_SCHEMA_VERSION,
            timestamp: chrono::Utc::now().timestamp_millis(),
            state: format!("{:?}", self.state().await).to_lowercase(),
            config: self.config.clone(),
            workers: records
                .iter()
                .map(|r| WorkerSummary {
                    worker_id: r.worker_id.clone(),
                    pid: r.pid,
                    status: format!("{:?}", r.state).to_lowercase(),
                    started_at: r.started_at.timestamp_millis(),
                    restarts: r.restart_count,
                })
                .collect(),
            metrics_history: self.metrics.history().await,
            balancer_strategy: balancer_stats.strategy.as_str().to_string(),
            balancer_weights: self.balancer.weights().await,
            efficiency_trend: vec![balancer_stats.efficiency_score],
        };
        self.store.save(&state).await
    }

    /// Restore non-derived fields. Worker identities respawn fresh.
    pub async fn restore_state(&self) -> Result<bool> {
        self.restore_state_inner().await
    }

    async fn restore_state_inner(&self) -> Result<bool> {
        let Some(state) = self.store.load().await? else {
            return Ok(false);
        };

        self.metrics.restore_history(state.metrics_history).await;
        if let Ok(strategy) = Strategy::parse(&state.balancer_strategy) {
            // Restored strategy predates the cooldown clock
            let _ = self.balancer.update_strategy(strategy).await;
        }
        info!(
            saved_at = state.timestamp,
            workers = state.workers.len(),
            "cluster state restored"
        );
        Ok(true)
    }

    /// Cluster health summary for the HTTP surface.
    pub async fn health_summary(&self) -> serde_json::Value {
        let (status, healthy, total) = self.health.overall().await;
        let aggregate = self.metrics.aggregate().await;
        serde_json::json!({
            "status": status,
            "cluster": {
                "enabled": self.config.cluster.enabled,
                "workers": total,
                "healthy": healthy,
                "metrics": aggregate,
            }
        })
    }

    async fn spawn_health_reactor(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut events = self.health.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(HealthEvent::RestartRequired { worker_id, reason }) => {
                        info!(worker = %worker_id, %reason, "health-driven replacement");
                        if let Err(e) = manager.replace_worker(&worker_id, &reason).await {
                            error!(worker = %worker_id, error = %e, "replacement failed");
                        }
                    }
                    Ok(HealthEvent::Critical { worker_id }) => {
                        manager.balancer.set_health(&worker_id, false).await;
                        manager.maybe_degrade().await;
                    }
                    Ok(HealthEvent::Warning { worker_id }) => {
                        debug!(worker = %worker_id, "worker health warning");
                    }
                    Ok(HealthEvent::Recovered { worker_id }) => {
                        manager.balancer.set_health(&worker_id, true).await;
                        manager.maybe_recover().await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "health event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.tasks.lock().await.push(task);
    }

    async fn maybe_degrade(&self) {
        let (status, _, _) = self.health.overall().await;
        if status == HealthStatus::Critical && self.state().await == ClusterState::Running {
            self.transition(ClusterState::Degraded).await;
        }
    }

    async fn maybe_recover(&self) {
        let (status, _, _) = self.health.overall().await;
        if status == HealthStatus::Healthy && self.state().await == ClusterState::Degraded {
            self.transition(ClusterState::Running).await;
        }
    }

    async fn spawn_scaling_loop(self: &Arc<Self>) {
        if !self.config.scaling.enabled {
            return;
        }
        let manager = Arc::clone(self);
        let interval = Duration::from_secs(self.config.scaling.evaluation_interval_secs.max(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let state = manager.state().await;
                if state != ClusterState::Running && state != ClusterState::Degraded {
                    continue;
                }
                let signals = manager.sample_scaling_signals().await;
                match manager.scaler.evaluate(&signals).await {
                    ScalingDecision::ScaleUp { to, .. }
                    | ScalingDecision::ScaleDown { to, .. } => {
                        if let Err(e) = manager.scale_to(to).await {
                            error!(error = %e, "scaling action failed");
                        }
                        manager.scaler.mark_action_complete().await;
                    }
                    ScalingDecision::NoAction => {}
                }
            }
        });
        self.tasks.lock().await.push(task);
    }

    async fn sample_scaling_signals(&self) -> ScalingSignals {
        let aggregate = self.metrics.aggregate().await;
        if aggregate.requests_per_second > 0.5 {
            *self.last_busy.write().await = Instant::now();
        }
        let idle_minutes = self.last_busy.read().await.elapsed().as_secs_f64() / 60.0;
        let p95 = aggregate
            .workers
            .iter()
            .map(|w| w.requests.p95_ms)
            .fold(0.0f64, f64::max);
        let queue_length: u64 = aggregate
            .workers
            .iter()
            .map(|w| w.requests.active_requests)
            .sum();

        ScalingSignals {
            cpu_avg: aggregate.avg_cpu,
            memory_avg: aggregate.avg_memory_percentage,
            p95_response_time_ms: p95,
            queue_length: queue_length as usize,
            idle_minutes,
            active_workers: self.workers.running_count().await,
        }
    }
}

/// IPC handler pushing worker metric snapshots into the store and balancer
struct MetricsIngest {
    metrics: Arc<MetricsStore>,
    balancer: Arc<LoadBalancer>,
    workers: Arc<WorkerManager>,
    memory_threshold_mb: u64,
    cpu_threshold_percent: f64,
}

#[async_trait]
impl EventHandler for MetricsIngest {
    async fn handle(&self, from: &str, payload: serde_json::Value) -> Result<serde_json::Value> {
        let mut snapshot: WorkerMetrics = serde_json::from_value(payload)
            .map_err(|e| Error::Validation(format!("bad metrics payload: {}", e)))?;
        // The sender identity wins over whatever the payload claims
        snapshot.worker_id = from.to_string();
        self.balancer.update_metrics(snapshot.clone()).await;

        // Sustained resource overage escalates to a graceful restart; the
        // restart runs detached so the bus reader is never blocked on it.
        if self.memory_threshold_mb > 0 || self.cpu_threshold_percent > 0.0 {
            let over_memory = self.memory_threshold_mb > 0
                && snapshot.memory.rss_bytes / (1024 * 1024) > self.memory_threshold_mb;
            let over_cpu = self.cpu_threshold_percent > 0.0
                && snapshot.cpu.current > self.cpu_threshold_percent;
            let workers = Arc::clone(&self.workers);
            let worker_id = snapshot.worker_id.clone();
            tokio::spawn(async move {
                workers
                    .note_resource_overage(&worker_id, over_memory || over_cpu)
                    .await;
            });
        }

        self.metrics.record(snapshot);
        Ok(serde_json::Value::Null)
    }
}
