//! Lifecycle orchestrator
//!
//! Chooses the topology (single process, cluster, hybrid core, or dev
//! hot-reload), runs plugin lifecycle hooks in order around the bind, and
//! owns the shutdown sequence. Bind failures are fatal: the process exits 1.

use crate::bridge::{BridgeEvent, HybridBridge};
use crate::cluster::ClusterManager;
use crate::config::Config;
use crate::crypto::CipherSuite;
use crate::error::{Error, Result};
use crate::ipc::{FnHandler, IpcBus, MASTER_ID};
use crate::server::{
    bind, build_worker_state, proxy_router, serve_on, worker_router, ProxyState, WorkerState,
};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// Deployment topology derived from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    Single,
    Cluster,
    HybridCore,
    HotReload,
}

impl Topology {
    pub fn from_config(config: &Config) -> Self {
        if config.hot_reload.enabled {
            Self::HotReload
        } else if config.bridge.enabled {
            Self::HybridCore
        } else if config.cluster.enabled {
            Self::Cluster
        } else {
            Self::Single
        }
    }
}

/// The orchestrator owns startup and shutdown of whichever topology runs
pub struct Orchestrator {
    config: Config,
    topology: Topology,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    bound_addr: RwLock<Option<SocketAddr>>,
    cluster: RwLock<Option<Arc<ClusterManager>>>,
    worker_state: RwLock<Option<Arc<WorkerState>>>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Arc<Self> {
        let topology = Topology::from_config(&config);
        let (ready_tx, ready_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            config,
            topology,
            ready_tx,
            ready_rx,
            shutdown_tx,
            shutdown_rx,
            bound_addr: RwLock::new(None),
            cluster: RwLock::new(None),
            worker_state: RwLock::new(None),
        })
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Resolves only after plugin initialization and a successful bind.
    pub async fn wait_for_ready(&self) {
        let mut ready = self.ready_rx.clone();
        let _ = ready.wait_for(|r| *r).await;
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.read().await
    }

    /// The cluster manager, once the cluster topology is running.
    pub async fn cluster_manager(&self) -> Option<Arc<ClusterManager>> {
        self.cluster.read().await.clone()
    }

    /// The in-process worker state (single/hybrid/dev topologies); used by
    /// embedders to register application routes and plugins.
    pub async fn worker_state(&self) -> Option<Arc<WorkerState>> {
        self.worker_state.read().await.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the configured topology to completion.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        info!(topology = ?self.topology, "orchestrator starting");
        match self.topology {
            Topology::Single => self.run_single().await,
            Topology::Cluster => self.run_cluster().await,
            Topology::HybridCore => self.run_hybrid().await,
            Topology::HotReload => self.run_hot_reload().await,
        }
    }

    async fn run_single(self: &Arc<Self>) -> Result<()> {
        let state = build_worker_state("single", &self.config)?;
        *self.worker_state.write().await = Some(Arc::clone(&state));

        // ServerStart hooks run before the socket exists
        state.engine.hooks().emit_server_start();
        state.engine.registry().activate_all();

        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|_| Error::Config("invalid listen address".to_string()))?;
        let listener = bind(addr).await?;
        let local = listener
            .local_addr()
            .map_err(|e| Error::Fatal(e.to_string()))?;
        *self.bound_addr.write().await = Some(local);

        state.engine.hooks().emit_server_ready();
        let _ = self.ready_tx.send(true);

        let result = serve_on(listener, worker_router(Arc::clone(&state)), self.shutdown_rx.clone()).await;
        self.shutdown_plugins(&state).await;
        result
    }

    async fn run_cluster(self: &Arc<Self>) -> Result<()> {
        let manager = ClusterManager::new(self.config.clone())?;
        manager.start().await?;
        *self.cluster.write().await = Some(Arc::clone(&manager));

        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|_| Error::Config("invalid listen address".to_string()))?;
        let listener = bind(addr).await?;
        let local = listener
            .local_addr()
            .map_err(|e| Error::Fatal(e.to_string()))?;
        *self.bound_addr.write().await = Some(local);
        let _ = self.ready_tx.send(true);

        let proxy = ProxyState::new(Arc::clone(&manager))?;
        let result = serve_on(listener, proxy_router(proxy), self.shutdown_rx.clone()).await;

        if let Err(e) = manager.stop().await {
            warn!(error = %e, "cluster stop reported an error");
        }
        result
    }

    async fn run_hybrid(self: &Arc<Self>) -> Result<()> {
        let state = build_worker_state("hybrid", &self.config)?;
        *self.worker_state.write().await = Some(Arc::clone(&state));
        state.engine.hooks().emit_server_start();
        state.engine.registry().activate_all();

        let bus = Arc::new(IpcBus::new(MASTER_ID, &self.config.ipc, None));
        let bridge = HybridBridge::new(self.config.bridge.clone(), bus);
        bridge.start(self.config.server.port).await?;

        state.engine.hooks().emit_server_ready();
        let _ = self.ready_tx.send(true);

        // The engine owns the socket; we either wait for shutdown or take
        // over when the bridge gives up and fallback is configured.
        let mut events = bridge.subscribe();
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = wait_for_stop(&mut shutdown) => {
                    bridge.stop().await;
                    break;
                }
                event = events.recv() => match event {
                    Ok(BridgeEvent::FallbackActivated) => {
                        warn!("hybrid core gone, serving in-process");
                        bridge.stop().await;
                        let addr: SocketAddr =
                            format!("{}:{}", self.config.server.host, self.config.server.port)
                                .parse()
                                .map_err(|_| Error::Config("invalid listen address".to_string()))?;
                        let listener = bind(addr).await?;
                        let result = serve_on(
                            listener,
                            worker_router(Arc::clone(&state)),
                            self.shutdown_rx.clone(),
                        )
                        .await;
                        self.shutdown_plugins(&state).await;
                        return result;
                    }
                    Ok(event) => debug!(?event, "bridge event"),
                    Err(_) => break,
                }
            }
        }
        self.shutdown_plugins(&state).await;
        Ok(())
    }

    /// Dev topology: serve single-process, restart the server task on file
    /// changes under the watch paths.
    async fn run_hot_reload(self: &Arc<Self>) -> Result<()> {
        let (change_tx, mut change_rx) = tokio::sync::mpsc::channel::<()>(8);
        let watch_paths = self.config.hot_reload.watch_paths.clone();
        let debounce = Duration::from_millis(self.config.hot_reload.debounce_ms);

        let _watcher = spawn_watcher(watch_paths, change_tx)?;

        loop {
            let state = build_worker_state("dev", &self.config)?;
            *self.worker_state.write().await = Some(Arc::clone(&state));
            state.engine.hooks().emit_server_start();
            state.engine.registry().activate_all();

            let addr: SocketAddr =
                format!("{}:{}", self.config.server.host, self.config.server.port)
                    .parse()
                    .map_err(|_| Error::Config("invalid listen address".to_string()))?;
            let listener = bind(addr).await?;
            let local = listener
                .local_addr()
                .map_err(|e| Error::Fatal(e.to_string()))?;
            *self.bound_addr.write().await = Some(local);
            state.engine.hooks().emit_server_ready();
            let _ = self.ready_tx.send(true);

            // Dedicated restart signal for this server generation
            let (restart_tx, restart_rx) = watch::channel(false);
            let router = worker_router(Arc::clone(&state));
            let server = tokio::spawn(async move { serve_on(listener, router, restart_rx).await });

            let mut shutdown = self.shutdown_rx.clone();
            tokio::select! {
                _ = wait_for_stop(&mut shutdown) => {
                    let _ = restart_tx.send(true);
                    let _ = server.await;
                    self.shutdown_plugins(&state).await;
                    return Ok(());
                }
                changed = change_rx.recv() => {
                    if changed.is_none() {
                        let _ = restart_tx.send(true);
                        let _ = server.await;
                        return Ok(());
                    }
                    // Swallow the burst of events a single save produces
                    tokio::time::sleep(debounce).await;
                    while change_rx.try_recv().is_ok() {}
                    info!("change detected, restarting dev server");
                    let _ = restart_tx.send(true);
                    let _ = server.await;
                    self.shutdown_plugins(&state).await;
                }
            }
        }
    }

    async fn shutdown_plugins(&self, state: &Arc<WorkerState>) {
        state.engine.registry().drain_all();
        state.engine.hooks().emit_shutdown();
        // Give subscribers a bounded window to observe the shutdown hook
        tokio::time::sleep(Duration::from_millis(50)).await;
        state.engine.registry().terminate_all();
    }
}

/// Wait until the watch channel's value becomes `true`, without holding a
/// borrow guard across an await point (required for the future to stay
/// `Send` when tokio's `parking_lot` backend is in play).
async fn wait_for_stop(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn spawn_watcher(
    paths: Vec<String>,
    change_tx: tokio::sync::mpsc::Sender<()>,
) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        if event.is_ok() {
            let _ = change_tx.try_send(());
        }
    })
    .map_err(|e| Error::Config(format!("file watcher failed: {}", e)))?;

    for path in paths {
        if let Err(e) = watcher.watch(Path::new(&path), RecursiveMode::Recursive) {
            warn!(path = %path, error = %e, "watch path skipped");
        }
    }
    Ok(watcher)
}

/// Entry point for a spawned worker process (`WORKER_ID` set).
///
/// Serves the application router on `WORKER_PORT`, speaks IPC with the
/// master over stdio, and reports metrics snapshots periodically.
pub async fn run_worker(config: Config, worker_id: String) -> Result<()> {
    let port: u16 = std::env::var("WORKER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(config.cluster.base_port);

    let state = build_worker_state(&worker_id, &config)?;
    state.engine.hooks().emit_server_start();
    state.engine.registry().activate_all();

    let suite = match config.ipc_secret() {
        Some(secret) => Some(Arc::new(CipherSuite::derive(&secret)?)),
        None => None,
    };
    let bus = Arc::new(IpcBus::new(&worker_id, &config.ipc, suite));
    bus.attach_peer(MASTER_ID, tokio::io::stdin(), tokio::io::stdout());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_handle = shutdown_tx.clone();
    bus.register_handler(
        "shutdown",
        Arc::new(FnHandler::new(move |_from: &str, payload: serde_json::Value| {
            info!(?payload, "shutdown requested over ipc");
            let _ = shutdown_handle.send(true);
            Ok(serde_json::Value::Null)
        })),
    );
    bus.register_handler(
        "ping",
        Arc::new(FnHandler::new(|_from: &str, _payload| {
            Ok(serde_json::json!({ "status": "alive" }))
        })),
    );

    let addr: SocketAddr = format!("127.0.0.1:{}", port)
        .parse()
        .map_err(|_| Error::Config("invalid worker address".to_string()))?;
    let listener = bind(addr).await?;

    state.engine.hooks().emit_server_ready();
    state.engine.hooks().emit_worker_ready(worker_id.clone());
    let _ = bus
        .send_to_worker(MASTER_ID, "worker:ready", serde_json::json!({ "port": port }))
        .await;

    // Periodic metrics reporting to the master; the same loop feeds the
    // cache's strategy adaptation and pressure-driven key rotation.
    let telemetry = Arc::clone(&state.telemetry);
    let _probe = telemetry.start_loop_probe();
    let report_bus = Arc::clone(&bus);
    let report_state = Arc::clone(&state);
    let reporter = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let snapshot = telemetry.snapshot().await;

            report_state
                .cache
                .adapt_strategy(crate::cache::AdaptationMetrics {
                    memory_usage: snapshot.memory.percentage / 100.0,
                    cpu_usage: snapshot.cpu.current / 100.0,
                    request_rate: snapshot.requests.rps,
                })
                .await;
            if let Some(secure) = &report_state.secure_cache {
                if let Err(e) = secure.rotate_if_pressured().await {
                    warn!(error = %e, "pressure-driven key rotation failed");
                }
            }

            match serde_json::to_value(&snapshot) {
                Ok(payload) => {
                    if let Err(e) = report_bus.send_to_worker(MASTER_ID, "metrics", payload).await {
                        debug!(error = %e, "metrics report undeliverable");
                    }
                }
                Err(e) => error!(error = %e, "metrics snapshot serialization failed"),
            }
        }
    });

    info!(worker = %worker_id, port, "worker serving");
    let result = serve_on(listener, worker_router(Arc::clone(&state)), shutdown_rx).await;

    reporter.abort();
    state.engine.registry().drain_all();
    state.engine.hooks().emit_shutdown();
    state.engine.registry().terminate_all();
    bus.shutdown();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_selection() {
        let mut config = Config::default();
        assert_eq!(Topology::from_config(&config), Topology::Single);

        config.cluster.enabled = true;
        assert_eq!(Topology::from_config(&config), Topology::Cluster);

        config.bridge.enabled = true;
        assert_eq!(Topology::from_config(&config), Topology::HybridCore);

        config.hot_reload.enabled = true;
        assert_eq!(Topology::from_config(&config), Topology::HotReload);
    }

    #[tokio::test]
    async fn test_single_topology_ready_and_shutdown() {
        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;

        let orchestrator = Orchestrator::new(config);
        let runner = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.run().await })
        };

        orchestrator.wait_for_ready().await;
        let addr = orchestrator.local_addr().await.unwrap();
        assert_ne!(addr.port(), 0);

        // The bound server answers its health route
        let response = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap();
        assert!(response.status().is_success());

        orchestrator.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("server should stop on shutdown")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let holder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = port;

        let orchestrator = Orchestrator::new(config);
        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
    }
}
