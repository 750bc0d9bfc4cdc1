//! Hybrid core bridge
//!
//! An optional native HTTP engine owns the listening socket and forwards
//! matched requests over IPC to in-process handlers. The bridge supervises
//! that subprocess with worker-style respawns and can hand the socket back
//! to the in-process server when the engine is gone for good.

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::ipc::{EventHandler, IpcBus};
use async_trait::async_trait;
use base64::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Peer id of the native engine on the bus
pub const ENGINE_PEER: &str = "hybrid-core";

/// Normalised request as forwarded by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Base64; HTTP bodies are bytes, the frame is JSON
    #[serde(default)]
    pub body: String,
    #[serde(rename = "remoteAddr", default)]
    pub remote_addr: String,
}

impl BridgeRequest {
    pub fn body_bytes(&self) -> Result<Vec<u8>> {
        if self.body.is_empty() {
            return Ok(Vec::new());
        }
        BASE64_STANDARD
            .decode(&self.body)
            .map_err(|e| Error::Validation(format!("bad body encoding: {}", e)))
    }
}

/// Response returned to the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Base64 body
    #[serde(default)]
    pub body: String,
}

impl BridgeResponse {
    pub fn new(status: u16, body: &[u8]) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: BASE64_STANDARD.encode(body),
        }
    }

    fn gateway_timeout() -> Self {
        Self::new(504, b"Gateway Timeout")
    }

    fn overloaded() -> Self {
        Self::new(503, b"Service Unavailable")
    }

    fn not_found() -> Self {
        Self::new(404, b"Not Found")
    }
}

/// In-process handler for one bridged route
#[async_trait]
pub trait BridgeHandler: Send + Sync {
    async fn handle(&self, request: BridgeRequest) -> Result<BridgeResponse>;
}

struct Route {
    method: String,
    /// Exact path, or a prefix when ending in "/*"
    pattern: String,
    handler: Arc<dyn BridgeHandler>,
}

impl Route {
    fn matches(&self, method: &str, path: &str) -> bool {
        if !self.method.eq_ignore_ascii_case(method) {
            return false;
        }
        match self.pattern.strip_suffix("/*") {
            Some(prefix) => path.starts_with(prefix),
            None => self.pattern == path,
        }
    }
}

/// Bridge lifecycle events
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    EngineStarted { pid: u32 },
    EngineCrashed { code: Option<i32> },
    FallbackActivated,
}

/// The bridge: engine subprocess owner plus route dispatcher
pub struct HybridBridge {
    config: BridgeConfig,
    bus: Arc<IpcBus>,
    routes: Arc<RwLock<Vec<Route>>>,
    in_flight: Arc<AtomicUsize>,
    child: Mutex<Option<Child>>,
    restarts: AtomicU32,
    fallback_active: Arc<AtomicBool>,
    events: broadcast::Sender<BridgeEvent>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl HybridBridge {
    pub fn new(config: BridgeConfig, bus: Arc<IpcBus>) -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        let bridge = Arc::new(Self {
            config,
            bus,
            routes: Arc::new(RwLock::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            child: Mutex::new(None),
            restarts: AtomicU32::new(0),
            fallback_active: Arc::new(AtomicBool::new(false)),
            events,
            monitor: Mutex::new(None),
        });
        bridge.register_ipc_handler();
        bridge
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    pub fn fallback_active(&self) -> bool {
        self.fallback_active.load(Ordering::Relaxed)
    }

    /// Register an in-process route the engine should forward.
    pub async fn register_route(
        &self,
        method: &str,
        pattern: &str,
        handler: Arc<dyn BridgeHandler>,
    ) {
        self.routes.write().await.push(Route {
            method: method.to_string(),
            pattern: pattern.to_string(),
            handler,
        });
        debug!(method, pattern, "bridge route registered");
    }

    fn register_ipc_handler(self: &Arc<Self>) {
        let bridge = Arc::clone(self);
        self.bus.register_handler(
            "http:request",
            Arc::new(ForwardedRequestHandler { bridge }),
        );
    }

    /// Dispatch one forwarded request through the route table with the
    /// configured budget and back-pressure.
    pub async fn dispatch(&self, request: BridgeRequest) -> BridgeResponse {
        if self.in_flight.load(Ordering::Relaxed) >= self.config.max_outstanding {
            warn!("bridge outstanding-request bound hit");
            return BridgeResponse::overloaded();
        }
        self.in_flight.fetch_add(1, Ordering::Relaxed);

        let response = self.dispatch_inner(&request).await;

        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        response
    }

    async fn dispatch_inner(&self, request: &BridgeRequest) -> BridgeResponse {
        let handler = {
            let routes = self.routes.read().await;
            routes
                .iter()
                .find(|r| r.matches(&request.method, &request.path))
                .map(|r| Arc::clone(&r.handler))
        };

        let Some(handler) = handler else {
            return BridgeResponse::not_found();
        };

        let budget = Duration::from_millis(self.config.request_timeout_ms);
        match tokio::time::timeout(budget, handler.handle(request.clone())).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(path = %request.path, error = %e, "bridge handler failed");
                BridgeResponse::new(500, b"Internal Server Error")
            }
            Err(_) => {
                // The engine-side client sees this as a 504
                warn!(path = %request.path, "bridge handler exceeded budget");
                BridgeResponse::gateway_timeout()
            }
        }
    }

    /// Spawn the native engine and begin supervising it.
    pub async fn start(self: &Arc<Self>, listen_port: u16) -> Result<()> {
        if self.config.engine_path.is_empty() {
            return Err(Error::Config("bridge engine path not set".to_string()));
        }
        self.spawn_engine(listen_port).await?;

        let bridge = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                bridge.supervise_engine(listen_port).await;
            }
        });
        *self.monitor.lock().await = Some(task);
        Ok(())
    }

    async fn spawn_engine(&self, listen_port: u16) -> Result<()> {
        let mut cmd = Command::new(&self.config.engine_path);
        cmd.env("ENGINE_PORT", listen_port.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Transient(format!("engine spawn failed: {}", e)))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Internal("spawned engine has no pid".to_string()))?;

        if let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) {
            self.bus.attach_peer(ENGINE_PEER, stdout, stdin);
        }
        *self.child.lock().await = Some(child);

        info!(pid, port = listen_port, "hybrid core engine started");
        let _ = self.events.send(BridgeEvent::EngineStarted { pid });
        Ok(())
    }

    async fn supervise_engine(self: &Arc<Self>, listen_port: u16) {
        let exited = {
            let mut guard = self.child.lock().await;
            match guard.as_mut() {
                Some(child) => match child.try_wait() {
                    Ok(Some(status)) => {
                        *guard = None;
                        Some(status.code())
                    }
                    Ok(None) => None,
                    Err(_) => {
                        *guard = None;
                        Some(None)
                    }
                },
                None => None,
            }
        };

        let Some(code) = exited else {
            return;
        };

        warn!(?code, "hybrid core engine exited");
        self.bus.detach_peer(ENGINE_PEER);
        let _ = self.events.send(BridgeEvent::EngineCrashed { code });

        let restarts = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;
        if restarts > 5 {
            if self.config.fallback {
                if !self.fallback_active.swap(true, Ordering::Relaxed) {
                    warn!("engine restart budget exhausted, handing socket to in-process server");
                    let _ = self.events.send(BridgeEvent::FallbackActivated);
                }
            }
            return;
        }

        let delay = Duration::from_millis(1_000 * 2u64.pow(restarts.min(5)));
        tokio::time::sleep(delay.min(Duration::from_secs(30))).await;
        if let Err(e) = self.spawn_engine(listen_port).await {
            warn!(error = %e, "engine respawn failed");
        }
    }

    pub async fn stop(&self) {
        if let Some(task) = self.monitor.lock().await.take() {
            task.abort();
        }
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            let _ = child.start_kill();
        }
        *guard = None;
        self.bus.detach_peer(ENGINE_PEER);
    }
}

struct ForwardedRequestHandler {
    bridge: Arc<HybridBridge>,
}

#[async_trait]
impl EventHandler for ForwardedRequestHandler {
    async fn handle(&self, _from: &str, payload: serde_json::Value) -> Result<serde_json::Value> {
        let request: BridgeRequest = serde_json::from_value(payload)
            .map_err(|e| Error::Validation(format!("bad forwarded request: {}", e)))?;
        let response = self.bridge.dispatch(request).await;
        Ok(serde_json::to_value(response)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpcConfig;
    use crate::ipc::MASTER_ID;

    struct EchoHandler;

    #[async_trait]
    impl BridgeHandler for EchoHandler {
        async fn handle(&self, request: BridgeRequest) -> Result<BridgeResponse> {
            let body = request.body_bytes()?;
            Ok(BridgeResponse::new(200, &body))
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl BridgeHandler for SlowHandler {
        async fn handle(&self, _request: BridgeRequest) -> Result<BridgeResponse> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(BridgeResponse::new(200, b""))
        }
    }

    fn bridge(config: BridgeConfig) -> Arc<HybridBridge> {
        let bus = Arc::new(IpcBus::new(MASTER_ID, &IpcConfig::default(), None));
        HybridBridge::new(config, bus)
    }

    fn request(method: &str, path: &str, body: &[u8]) -> BridgeRequest {
        BridgeRequest {
            method: method.to_string(),
            path: path.to_string(),
            headers: HashMap::new(),
            body: BASE64_STANDARD.encode(body),
            remote_addr: "203.0.113.9:5000".to_string(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_round_trips_body() {
        let bridge = bridge(BridgeConfig::default());
        bridge
            .register_route("POST", "/api/echo", Arc::new(EchoHandler))
            .await;

        let response = bridge.dispatch(request("POST", "/api/echo", b"payload")).await;
        assert_eq!(response.status, 200);
        assert_eq!(BASE64_STANDARD.decode(&response.body).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_unmatched_route_is_404() {
        let bridge = bridge(BridgeConfig::default());
        let response = bridge.dispatch(request("GET", "/nowhere", b"")).await;
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn test_prefix_routes_match() {
        let bridge = bridge(BridgeConfig::default());
        bridge
            .register_route("GET", "/static/*", Arc::new(EchoHandler))
            .await;

        let response = bridge.dispatch(request("GET", "/static/app.css", b"")).await;
        assert_eq!(response.status, 200);
        // Method must match too
        let response = bridge.dispatch(request("POST", "/static/app.css", b"")).await;
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn test_slow_handler_times_out_504() {
        let config = BridgeConfig {
            request_timeout_ms: 30,
            ..BridgeConfig::default()
        };
        let bridge = bridge(config);
        bridge
            .register_route("GET", "/slow", Arc::new(SlowHandler))
            .await;

        let response = bridge.dispatch(request("GET", "/slow", b"")).await;
        assert_eq!(response.status, 504);
    }

    #[tokio::test]
    async fn test_outstanding_bound_sheds_load() {
        let config = BridgeConfig {
            max_outstanding: 1,
            request_timeout_ms: 5_000,
            ..BridgeConfig::default()
        };
        let bridge = bridge(config);
        bridge
            .register_route("GET", "/slow", Arc::new(SlowHandler))
            .await;
        bridge
            .register_route("GET", "/fast", Arc::new(EchoHandler))
            .await;

        let slow_bridge = Arc::clone(&bridge);
        let slow = tokio::spawn(async move {
            slow_bridge.dispatch(request("GET", "/slow", b"")).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let response = bridge.dispatch(request("GET", "/fast", b"")).await;
        assert_eq!(response.status, 503);
        slow.abort();
    }

    #[tokio::test]
    async fn test_crashing_engine_triggers_fallback() {
        let config = BridgeConfig {
            enabled: true,
            engine_path: "false".to_string(),
            fallback: true,
            ..BridgeConfig::default()
        };
        let bus = Arc::new(IpcBus::new(MASTER_ID, &IpcConfig::default(), None));
        let bridge = HybridBridge::new(config, bus);
        let mut events = bridge.subscribe();

        // Force the restart budget over the edge, then observe one exit
        bridge.restarts.store(6, Ordering::Relaxed);
        bridge.spawn_engine(0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        bridge.supervise_engine(0).await;

        assert!(bridge.fallback_active());
        let mut fallback = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, BridgeEvent::FallbackActivated) {
                fallback = true;
            }
        }
        assert!(fallback);
        bridge.stop().await;
    }
}
