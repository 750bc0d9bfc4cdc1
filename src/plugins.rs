//! Plugin registry and execution engine
//!
//! Plugins are registered once at startup (or through the admin surface),
//! ordered by priority then registration order, and executed sequentially
//! under a per-request chain budget. Hook events travel over typed broadcast
//! channels, one per event.

use crate::cache::SmartCache;
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, warn};

const DEFAULT_MAX_EXECUTION_MS: u64 = 1_000;
const STATS_WINDOW: usize = 256;
const SNAPSHOT_CAP_BYTES: usize = 4_096;

/// Plugin categories; the engine dispatches typed payloads on this tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    Middleware,
    Performance,
    Cache,
    Monitoring,
    Security,
    Other,
}

impl PluginType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "middleware" => Some(Self::Middleware),
            "performance" => Some(Self::Performance),
            "cache" => Some(Self::Cache),
            "monitoring" => Some(Self::Monitoring),
            "security" => Some(Self::Security),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Middleware => "middleware",
            Self::Performance => "performance",
            Self::Cache => "cache",
            Self::Monitoring => "monitoring",
            Self::Security => "security",
            Self::Other => "other",
        }
    }
}

/// Execution priority; higher runs first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl PluginPriority {
    fn rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

/// Lifecycle of a registered plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Registered,
    Initialized,
    Active,
    Draining,
    Terminated,
}

impl PluginState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Registered,
            1 => Self::Initialized,
            2 => Self::Active,
            3 => Self::Draining,
            _ => Self::Terminated,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Registered => 0,
            Self::Initialized => 1,
            Self::Active => 2,
            Self::Draining => 3,
            Self::Terminated => 4,
        }
    }
}

/// Typed result payload; each plugin kind carries its own shape
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PluginData {
    Middleware {
        #[serde(default)]
        response: Option<ResponseOverride>,
    },
    Performance {
        #[serde(default)]
        measurements: HashMap<String, f64>,
    },
    Cache {
        #[serde(default)]
        hint: Option<String>,
    },
    Monitoring {
        #[serde(default)]
        counters: HashMap<String, u64>,
    },
    Security {
        #[serde(default)]
        threat: Option<ThreatReport>,
    },
    Other {
        value: serde_json::Value,
    },
}

/// A middleware plugin may short-circuit the chain with a final response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseOverride {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

/// Security threat report surfaced through the hook bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatReport {
    pub category: String,
    pub detail: String,
    pub client_ip: String,
}

/// Outcome of a single plugin execution
#[derive(Debug, Clone)]
pub struct PluginOutcome {
    pub success: bool,
    pub should_continue: bool,
    pub data: Option<PluginData>,
    pub error: Option<String>,
}

impl PluginOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            should_continue: true,
            data: None,
            error: None,
        }
    }

    pub fn halt(data: PluginData) -> Self {
        Self {
            success: true,
            should_continue: false,
            data: Some(data),
            error: None,
        }
    }

    pub fn with_data(data: PluginData) -> Self {
        Self {
            success: true,
            should_continue: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Request context handed to every plugin in the chain
#[derive(Debug, Clone, Default)]
pub struct PluginContext {
    pub method: String,
    pub path: String,
    /// Sorted on construction so fingerprints are stable
    pub query: Vec<(String, String)>,
    pub body_hash: u64,
    pub client_ip: String,
    pub user_agent: String,
    pub headers: HashMap<String, String>,
}

impl PluginContext {
    /// Stable fingerprint over the declared cacheable inputs.
    pub fn fingerprint(&self) -> String {
        use std::hash::{Hash, Hasher};
        let mut query = self.query.clone();
        query.sort();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.method.hash(&mut hasher);
        self.path.hash(&mut hasher);
        query.hash(&mut hasher);
        self.body_hash.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

/// Work implemented by a plugin
#[async_trait]
pub trait PluginExecutor: Send + Sync {
    async fn execute(&self, ctx: &PluginContext) -> Result<PluginOutcome>;
}

/// Static description of a plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    #[serde(default = "default_priority")]
    pub priority: PluginPriority,
    #[serde(default)]
    pub is_async: bool,
    #[serde(default)]
    pub is_cacheable: bool,
    #[serde(default = "default_max_execution_ms")]
    pub max_execution_time_ms: u64,
}

fn default_priority() -> PluginPriority {
    PluginPriority::Normal
}

fn default_max_execution_ms() -> u64 {
    DEFAULT_MAX_EXECUTION_MS
}

impl PluginDescriptor {
    pub fn max_execution_time(&self) -> Duration {
        Duration::from_millis(self.max_execution_time_ms)
    }
}

#[derive(Debug, Default)]
struct PluginCounters {
    invocations: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

struct RegisteredPlugin {
    descriptor: PluginDescriptor,
    executor: Arc<dyn PluginExecutor>,
    state: AtomicU8,
    registration_order: u64,
    counters: PluginCounters,
    samples: Mutex<VecDeque<f64>>,
    last_error: RwLock<Option<String>>,
}

impl RegisteredPlugin {
    fn state(&self) -> PluginState {
        PluginState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: PluginState) {
        self.state.store(state.as_u8(), Ordering::Relaxed);
    }

    async fn record(&self, elapsed: Duration, success: bool, error: Option<String>) {
        self.counters.invocations.fetch_add(1, Ordering::Relaxed);
        if success {
            self.counters.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            if let Some(error) = error {
                *self.last_error.write().await = Some(error);
            }
        }
        let mut samples = self.samples.lock().await;
        samples.push_back(elapsed.as_secs_f64() * 1_000.0);
        while samples.len() > STATS_WINDOW {
            samples.pop_front();
        }
    }
}

/// Per-plugin statistics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginStats {
    pub invocations: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_ms: f64,
    pub p95_ms: f64,
    pub last_error: Option<String>,
}

/// Registry-wide statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_plugins: usize,
    pub active_plugins: usize,
    pub avg_exec_ms: f64,
}

/// Plugin registry. Registration is mutation-free after insert except for
/// stats and lifecycle state.
pub struct PluginRegistry {
    plugins: DashMap<String, Arc<RegisteredPlugin>>,
    order_counter: AtomicU64,
    id_pattern: Regex,
    version_pattern: Regex,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: DashMap::new(),
            order_counter: AtomicU64::new(0),
            id_pattern: Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").unwrap(),
            version_pattern: Regex::new(r"^\d+\.\d+\.\d+(-[0-9A-Za-z.]+)?$").unwrap(),
        }
    }

    pub fn register(
        &self,
        descriptor: PluginDescriptor,
        executor: Arc<dyn PluginExecutor>,
    ) -> Result<()> {
        if !self.id_pattern.is_match(&descriptor.id) {
            return Err(Error::Validation(format!(
                "Plugin id must be lowercased-dashed: {}",
                descriptor.id
            )));
        }
        if descriptor.name.trim().is_empty() {
            return Err(Error::Validation("Plugin name is required".to_string()));
        }
        if !self.version_pattern.is_match(&descriptor.version) {
            return Err(Error::Validation(format!(
                "Plugin version is not semver: {}",
                descriptor.version
            )));
        }
        if descriptor.max_execution_time_ms == 0 {
            return Err(Error::Validation(
                "Plugin max execution time must be positive".to_string(),
            ));
        }
        if self.plugins.contains_key(&descriptor.id) {
            return Err(Error::Validation(format!(
                "Plugin already registered: {}",
                descriptor.id
            )));
        }

        let order = self.order_counter.fetch_add(1, Ordering::Relaxed);
        let id = descriptor.id.clone();
        self.plugins.insert(
            id.clone(),
            Arc::new(RegisteredPlugin {
                descriptor,
                executor,
                state: AtomicU8::new(PluginState::Registered.as_u8()),
                registration_order: order,
                counters: PluginCounters::default(),
                samples: Mutex::new(VecDeque::new()),
                last_error: RwLock::new(None),
            }),
        );
        debug!(plugin = %id, "plugin registered");
        Ok(())
    }

    /// Remove from future executions; in-flight runs complete untouched.
    pub fn unregister(&self, id: &str) -> bool {
        self.plugins.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.plugins.contains_key(id)
    }

    pub fn descriptor(&self, id: &str) -> Option<PluginDescriptor> {
        self.plugins.get(id).map(|p| p.descriptor.clone())
    }

    pub fn all_by_type(&self, plugin_type: PluginType) -> Vec<PluginDescriptor> {
        self.plugins
            .iter()
            .filter(|p| p.descriptor.plugin_type == plugin_type)
            .map(|p| p.descriptor.clone())
            .collect()
    }

    pub fn state(&self, id: &str) -> Option<PluginState> {
        self.plugins.get(id).map(|p| p.state())
    }

    /// ServerStart hook completed: Registered plugins become Active.
    pub fn activate_all(&self) {
        for plugin in self.plugins.iter() {
            if plugin.state() == PluginState::Registered {
                plugin.set_state(PluginState::Initialized);
                plugin.set_state(PluginState::Active);
            }
        }
    }

    /// Newly admin-registered plugins on a live server activate directly.
    pub fn activate(&self, id: &str) {
        if let Some(plugin) = self.plugins.get(id) {
            plugin.set_state(PluginState::Initialized);
            plugin.set_state(PluginState::Active);
        }
    }

    pub fn drain_all(&self) {
        for plugin in self.plugins.iter() {
            plugin.set_state(PluginState::Draining);
        }
    }

    pub fn terminate_all(&self) {
        for plugin in self.plugins.iter() {
            plugin.set_state(PluginState::Terminated);
        }
    }

    pub async fn stats(&self, id: &str) -> Option<PluginStats> {
        let plugin = Arc::clone(self.plugins.get(id)?.value());
        Some(Self::stats_of(&plugin).await)
    }

    async fn stats_of(plugin: &RegisteredPlugin) -> PluginStats {
        let samples = plugin.samples.lock().await;
        let avg_ms = if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<f64>() / samples.len() as f64
        };
        let p95_ms = percentile(&samples, 0.95);
        drop(samples);

        PluginStats {
            invocations: plugin.counters.invocations.load(Ordering::Relaxed),
            successes: plugin.counters.successes.load(Ordering::Relaxed),
            failures: plugin.counters.failures.load(Ordering::Relaxed),
            avg_ms,
            p95_ms,
            last_error: plugin.last_error.read().await.clone(),
        }
    }

    pub async fn registry_stats(&self) -> RegistryStats {
        let plugins: Vec<Arc<RegisteredPlugin>> =
            self.plugins.iter().map(|p| Arc::clone(p.value())).collect();

        let mut total_ms = 0.0;
        let mut counted = 0usize;
        let mut active = 0usize;

        for plugin in plugins {
            if plugin.state() == PluginState::Active {
                active += 1;
            }
            let samples = plugin.samples.lock().await;
            if !samples.is_empty() {
                total_ms += samples.iter().sum::<f64>() / samples.len() as f64;
                counted += 1;
            }
        }

        RegistryStats {
            total_plugins: self.plugins.len(),
            active_plugins: active,
            avg_exec_ms: if counted > 0 {
                total_ms / counted as f64
            } else {
                0.0
            },
        }
    }

    fn ordered_candidates(&self, filter: Option<PluginType>) -> Vec<Arc<RegisteredPlugin>> {
        let mut candidates: Vec<Arc<RegisteredPlugin>> = self
            .plugins
            .iter()
            .filter(|p| filter.map(|t| p.descriptor.plugin_type == t).unwrap_or(true))
            .filter(|p| p.state() == PluginState::Active)
            .map(|p| Arc::clone(p.value()))
            .collect();
        candidates.sort_by(|a, b| {
            a.descriptor
                .priority
                .rank()
                .cmp(&b.descriptor.priority.rank())
                .then(a.registration_order.cmp(&b.registration_order))
        });
        candidates
    }
}

fn percentile(samples: &VecDeque<f64>, q: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((sorted.len() as f64 - 1.0) * q).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Request timing emitted at response completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTiming {
    pub path: String,
    pub method: String,
    pub duration_ms: f64,
    pub status_code: u16,
    pub client_ip: String,
    pub user_agent: String,
    pub timestamp: i64,
}

/// Route error details with size-capped snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteErrorInfo {
    pub path: String,
    pub method: String,
    pub status_code: u16,
    pub client_ip: String,
    pub message: String,
    pub stack: String,
    pub body_snapshot: String,
    pub query_snapshot: String,
    pub params_snapshot: String,
    pub timestamp: i64,
}

impl RouteErrorInfo {
    /// Snapshots never exceed 4 KiB each.
    pub fn cap_snapshots(mut self) -> Self {
        self.body_snapshot = cap_snapshot(self.body_snapshot);
        self.query_snapshot = cap_snapshot(self.query_snapshot);
        self.params_snapshot = cap_snapshot(self.params_snapshot);
        self
    }
}

fn cap_snapshot(s: String) -> String {
    if s.len() <= SNAPSHOT_CAP_BYTES {
        return s;
    }
    let mut end = SNAPSHOT_CAP_BYTES;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Request-start notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStart {
    pub path: String,
    pub method: String,
    pub client_ip: String,
    pub timestamp: i64,
}

/// Typed hook channels, one broadcast channel per event
pub struct HookBus {
    server_start: broadcast::Sender<()>,
    server_ready: broadcast::Sender<()>,
    request_start: broadcast::Sender<RequestStart>,
    request_timing: broadcast::Sender<RequestTiming>,
    route_error: broadcast::Sender<RouteErrorInfo>,
    security_threat: broadcast::Sender<ThreatReport>,
    worker_ready: broadcast::Sender<String>,
    shutdown: broadcast::Sender<()>,
}

impl Default for HookBus {
    fn default() -> Self {
        Self::new()
    }
}

impl HookBus {
    pub fn new() -> Self {
        let capacity = 256;
        Self {
            server_start: broadcast::channel(capacity).0,
            server_ready: broadcast::channel(capacity).0,
            request_start: broadcast::channel(capacity).0,
            request_timing: broadcast::channel(capacity).0,
            route_error: broadcast::channel(capacity).0,
            security_threat: broadcast::channel(capacity).0,
            worker_ready: broadcast::channel(capacity).0,
            shutdown: broadcast::channel(capacity).0,
        }
    }

    pub fn emit_server_start(&self) {
        let _ = self.server_start.send(());
    }
    pub fn emit_server_ready(&self) {
        let _ = self.server_ready.send(());
    }
    pub fn emit_request_start(&self, event: RequestStart) {
        let _ = self.request_start.send(event);
    }
    pub fn emit_request_timing(&self, timing: RequestTiming) {
        let _ = self.request_timing.send(timing);
    }
    pub fn emit_route_error(&self, info: RouteErrorInfo) {
        let _ = self.route_error.send(info.cap_snapshots());
    }
    pub fn emit_security_threat(&self, threat: ThreatReport) {
        let _ = self.security_threat.send(threat);
    }
    pub fn emit_worker_ready(&self, worker_id: String) {
        let _ = self.worker_ready.send(worker_id);
    }
    pub fn emit_shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn on_server_start(&self) -> broadcast::Receiver<()> {
        self.server_start.subscribe()
    }
    pub fn on_server_ready(&self) -> broadcast::Receiver<()> {
        self.server_ready.subscribe()
    }
    pub fn on_request_start(&self) -> broadcast::Receiver<RequestStart> {
        self.request_start.subscribe()
    }
    pub fn on_request_timing(&self) -> broadcast::Receiver<RequestTiming> {
        self.request_timing.subscribe()
    }
    pub fn on_route_error(&self) -> broadcast::Receiver<RouteErrorInfo> {
        self.route_error.subscribe()
    }
    pub fn on_security_threat(&self) -> broadcast::Receiver<ThreatReport> {
        self.security_threat.subscribe()
    }
    pub fn on_worker_ready(&self) -> broadcast::Receiver<String> {
        self.worker_ready.subscribe()
    }
    pub fn on_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }
}

/// Fingerprint memo with an insertion-order (FIFO) bound: when full, the
/// first inserted key is dropped.
struct ExecutionCache {
    entries: HashMap<String, String>,
    order: VecDeque<String>,
    bound: usize,
}

impl ExecutionCache {
    fn new(bound: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            bound,
        }
    }

    fn get(&self, key: &str) -> Option<&String> {
        self.entries.get(key)
    }

    fn insert(&mut self, key: String, value: String) {
        if self.entries.contains_key(&key) {
            self.entries.insert(key, value);
            return;
        }
        if self.order.len() >= self.bound {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, value);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// One executed step in a chain
#[derive(Debug, Clone)]
pub struct ChainStep {
    pub plugin_id: String,
    pub success: bool,
    pub from_cache: bool,
    pub elapsed: Duration,
    pub data: Option<PluginData>,
}

/// Aggregate result of a chain run
#[derive(Debug, Clone, Default)]
pub struct ChainResult {
    pub steps: Vec<ChainStep>,
    pub halted: bool,
    /// Final response produced by a halting middleware plugin, if any
    pub response: Option<ResponseOverride>,
}

/// The execution engine: ordered chains, budgets, result caching
pub struct PluginEngine {
    registry: Arc<PluginRegistry>,
    result_cache: Arc<SmartCache<serde_json::Value>>,
    execution_cache: Mutex<ExecutionCache>,
    chain_budget: Duration,
    hooks: Arc<HookBus>,
}

impl PluginEngine {
    pub fn new(
        registry: Arc<PluginRegistry>,
        result_cache: Arc<SmartCache<serde_json::Value>>,
        chain_budget: Duration,
        hooks: Arc<HookBus>,
    ) -> Self {
        Self {
            registry,
            result_cache,
            execution_cache: Mutex::new(ExecutionCache::new(1_024)),
            chain_budget,
            hooks,
        }
    }

    pub fn hooks(&self) -> &Arc<HookBus> {
        &self.hooks
    }

    pub fn chain_budget(&self) -> Duration {
        self.chain_budget
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Run the chain of Active plugins matching `filter` in priority order.
    ///
    /// A plugin returning `should_continue=false` ends the chain
    /// successfully. Failures abort the chain only for Critical-priority
    /// plugins; everything else is recorded and skipped.
    pub async fn execute_chain(
        &self,
        ctx: &PluginContext,
        filter: Option<PluginType>,
    ) -> Result<ChainResult> {
        let candidates = self.registry.ordered_candidates(filter);
        let mut result = ChainResult::default();
        let deadline = Instant::now() + self.chain_budget;

        for plugin in candidates {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("plugin chain budget exhausted");
                break;
            }
            let timeout = plugin.descriptor.max_execution_time().min(remaining);

            let (outcome, from_cache, elapsed) =
                self.run_one(&plugin, ctx, timeout).await;

            match outcome {
                Ok(outcome) => {
                    plugin
                        .record(elapsed, outcome.success, outcome.error.clone())
                        .await;

                    if let Some(PluginData::Middleware {
                        response: Some(ref response),
                    }) = outcome.data
                    {
                        result.response = Some(response.clone());
                    }
                    if let Some(PluginData::Security {
                        threat: Some(ref threat),
                    }) = outcome.data
                    {
                        self.hooks.emit_security_threat(threat.clone());
                    }

                    let halted = !outcome.should_continue;
                    result.steps.push(ChainStep {
                        plugin_id: plugin.descriptor.id.clone(),
                        success: outcome.success,
                        from_cache,
                        elapsed,
                        data: outcome.data,
                    });

                    if halted {
                        result.halted = true;
                        break;
                    }
                }
                Err(e) => {
                    plugin.record(elapsed, false, Some(e.to_string())).await;
                    result.steps.push(ChainStep {
                        plugin_id: plugin.descriptor.id.clone(),
                        success: false,
                        from_cache: false,
                        elapsed,
                        data: None,
                    });

                    if plugin.descriptor.priority == PluginPriority::Critical {
                        return Err(Error::Plugin(format!(
                            "critical plugin {} failed: {}",
                            plugin.descriptor.id, e
                        )));
                    }
                    warn!(plugin = %plugin.descriptor.id, error = %e, "plugin failed, chain continues");
                }
            }
        }

        Ok(result)
    }

    async fn run_one(
        &self,
        plugin: &Arc<RegisteredPlugin>,
        ctx: &PluginContext,
        budget: Duration,
    ) -> (Result<PluginOutcome>, bool, Duration) {
        let start = Instant::now();

        if plugin.descriptor.is_cacheable {
            let cache_key = self.cache_key(plugin, ctx).await;
            if let Some(cached) = self.result_cache.get(&cache_key).await {
                // Cache hits bypass execution but still record metrics
                if let Ok(data) = serde_json::from_value::<PluginData>(cached) {
                    return (
                        Ok(PluginOutcome::with_data(data)),
                        true,
                        start.elapsed(),
                    );
                }
            }

            let outcome = self.execute_with_timeout(plugin, ctx, budget).await;
            if let Ok(ref outcome) = outcome {
                if outcome.success {
                    if let Some(ref data) = outcome.data {
                        if let Ok(value) = serde_json::to_value(data) {
                            self.result_cache.set(cache_key, value, None).await;
                        }
                    }
                }
            }
            let elapsed = start.elapsed();
            return (outcome, false, elapsed);
        }

        let outcome = self.execute_with_timeout(plugin, ctx, budget).await;
        (outcome, false, start.elapsed())
    }

    async fn execute_with_timeout(
        &self,
        plugin: &Arc<RegisteredPlugin>,
        ctx: &PluginContext,
        budget: Duration,
    ) -> Result<PluginOutcome> {
        match tokio::time::timeout(budget, plugin.executor.execute(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "plugin {} exceeded {:?}",
                plugin.descriptor.id, budget
            ))),
        }
    }

    async fn cache_key(&self, plugin: &Arc<RegisteredPlugin>, ctx: &PluginContext) -> String {
        let memo_key = format!("{} {}?{:?}#{}", ctx.method, ctx.path, ctx.query, ctx.body_hash);
        let mut memo = self.execution_cache.lock().await;
        if let Some(fingerprint) = memo.get(&memo_key) {
            return format!("plugin:{}:{}", plugin.descriptor.id, fingerprint);
        }
        let fingerprint = ctx.fingerprint();
        memo.insert(memo_key, fingerprint.clone());
        format!("plugin:{}:{}", plugin.descriptor.id, fingerprint)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EvictionStrategy;

    struct CountingExecutor {
        calls: AtomicU64,
        outcome: fn() -> Result<PluginOutcome>,
    }

    #[async_trait]
    impl PluginExecutor for CountingExecutor {
        async fn execute(&self, _ctx: &PluginContext) -> Result<PluginOutcome> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            (self.outcome)()
        }
    }

    struct SlowExecutor;

    #[async_trait]
    impl PluginExecutor for SlowExecutor {
        async fn execute(&self, _ctx: &PluginContext) -> Result<PluginOutcome> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(PluginOutcome::ok())
        }
    }

    fn descriptor(id: &str, priority: PluginPriority) -> PluginDescriptor {
        PluginDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            version: "1.0.0".to_string(),
            plugin_type: PluginType::Middleware,
            priority,
            is_async: true,
            is_cacheable: false,
            max_execution_time_ms: DEFAULT_MAX_EXECUTION_MS,
        }
    }

    fn counting(outcome: fn() -> Result<PluginOutcome>) -> Arc<CountingExecutor> {
        Arc::new(CountingExecutor {
            calls: AtomicU64::new(0),
            outcome,
        })
    }

    fn engine(registry: Arc<PluginRegistry>) -> PluginEngine {
        PluginEngine::new(
            registry,
            Arc::new(SmartCache::new(128, EvictionStrategy::Lru)),
            Duration::from_secs(5),
            Arc::new(HookBus::new()),
        )
    }

    #[tokio::test]
    async fn test_register_validates_id_and_version() {
        let registry = PluginRegistry::new();
        let exec = counting(|| Ok(PluginOutcome::ok()));

        let mut bad_id = descriptor("Bad_Id", PluginPriority::Normal);
        bad_id.id = "Bad_Id".to_string();
        assert!(registry.register(bad_id, exec.clone()).is_err());

        let mut bad_version = descriptor("fine-id", PluginPriority::Normal);
        bad_version.version = "one".to_string();
        assert!(registry.register(bad_version, exec.clone()).is_err());

        assert!(registry
            .register(descriptor("fine-id", PluginPriority::Normal), exec.clone())
            .is_ok());
        // Duplicate id rejected
        assert!(registry
            .register(descriptor("fine-id", PluginPriority::Normal), exec)
            .is_err());
    }

    #[tokio::test]
    async fn test_chain_orders_by_priority_then_registration() {
        let registry = Arc::new(PluginRegistry::new());
        let exec = counting(|| Ok(PluginOutcome::ok()));

        registry
            .register(descriptor("late-normal", PluginPriority::Normal), exec.clone())
            .unwrap();
        registry
            .register(descriptor("crit", PluginPriority::Critical), exec.clone())
            .unwrap();
        registry
            .register(descriptor("second-normal", PluginPriority::Normal), exec)
            .unwrap();
        registry.activate_all();

        let engine = engine(registry);
        let result = engine
            .execute_chain(&PluginContext::default(), None)
            .await
            .unwrap();

        let order: Vec<&str> = result.steps.iter().map(|s| s.plugin_id.as_str()).collect();
        assert_eq!(order, vec!["crit", "late-normal", "second-normal"]);
    }

    #[tokio::test]
    async fn test_halting_plugin_ends_chain_successfully() {
        let registry = Arc::new(PluginRegistry::new());
        registry
            .register(
                descriptor("halter", PluginPriority::High),
                counting(|| {
                    Ok(PluginOutcome::halt(PluginData::Middleware {
                        response: Some(ResponseOverride {
                            status: 204,
                            headers: HashMap::new(),
                            body: String::new(),
                        }),
                    }))
                }),
            )
            .unwrap();
        let never_runs = counting(|| Ok(PluginOutcome::ok()));
        registry
            .register(descriptor("after", PluginPriority::Normal), never_runs.clone())
            .unwrap();
        registry.activate_all();

        let engine = engine(registry);
        let result = engine
            .execute_chain(&PluginContext::default(), None)
            .await
            .unwrap();

        assert!(result.halted);
        assert_eq!(result.response.as_ref().unwrap().status, 204);
        assert_eq!(never_runs.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_non_critical_failure_continues_chain() {
        let registry = Arc::new(PluginRegistry::new());
        registry
            .register(
                descriptor("flaky", PluginPriority::Normal),
                counting(|| Err(Error::Internal("boom".to_string()))),
            )
            .unwrap();
        let tail = counting(|| Ok(PluginOutcome::ok()));
        registry
            .register(descriptor("tail", PluginPriority::Low), tail.clone())
            .unwrap();
        registry.activate_all();

        let engine = engine(registry);
        let result = engine
            .execute_chain(&PluginContext::default(), None)
            .await
            .unwrap();

        assert!(!result.halted);
        assert_eq!(tail.calls.load(Ordering::Relaxed), 1);
        assert!(!result.steps[0].success);
    }

    #[tokio::test]
    async fn test_critical_failure_aborts_chain() {
        let registry = Arc::new(PluginRegistry::new());
        registry
            .register(
                descriptor("guard", PluginPriority::Critical),
                counting(|| Err(Error::Internal("denied".to_string()))),
            )
            .unwrap();
        let tail = counting(|| Ok(PluginOutcome::ok()));
        registry
            .register(descriptor("tail", PluginPriority::Low), tail.clone())
            .unwrap();
        registry.activate_all();

        let engine = engine(registry);
        let err = engine
            .execute_chain(&PluginContext::default(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Plugin(_)));
        assert_eq!(tail.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_plugin_timeout_is_recorded_not_fatal() {
        let registry = Arc::new(PluginRegistry::new());
        let mut slow = descriptor("slow", PluginPriority::Normal);
        slow.max_execution_time_ms = 20;
        registry.register(slow, Arc::new(SlowExecutor)).unwrap();
        registry.activate_all();

        let engine = engine(registry.clone());
        let result = engine
            .execute_chain(&PluginContext::default(), None)
            .await
            .unwrap();

        assert!(!result.steps[0].success);
        let stats = registry.stats("slow").await.unwrap();
        assert_eq!(stats.failures, 1);
        assert!(stats.last_error.unwrap().contains("exceeded"));
    }

    #[tokio::test]
    async fn test_inactive_plugins_are_skipped() {
        let registry = Arc::new(PluginRegistry::new());
        let exec = counting(|| Ok(PluginOutcome::ok()));
        registry
            .register(descriptor("dormant", PluginPriority::Normal), exec.clone())
            .unwrap();
        // Never activated: still Registered

        let engine = engine(registry);
        let result = engine
            .execute_chain(&PluginContext::default(), None)
            .await
            .unwrap();

        assert!(result.steps.is_empty());
        assert_eq!(exec.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_cacheable_plugin_bypasses_second_execution() {
        let registry = Arc::new(PluginRegistry::new());
        let exec = counting(|| {
            Ok(PluginOutcome::with_data(PluginData::Performance {
                measurements: HashMap::from([("compute_ms".to_string(), 3.2)]),
            }))
        });
        let mut cacheable = descriptor("memo", PluginPriority::Normal);
        cacheable.is_cacheable = true;
        registry.register(cacheable, exec.clone()).unwrap();
        registry.activate_all();

        let engine = engine(registry.clone());
        let ctx = PluginContext {
            method: "GET".to_string(),
            path: "/compute".to_string(),
            ..Default::default()
        };

        let first = engine.execute_chain(&ctx, None).await.unwrap();
        assert!(!first.steps[0].from_cache);
        let second = engine.execute_chain(&ctx, None).await.unwrap();
        assert!(second.steps[0].from_cache);
        assert_eq!(exec.calls.load(Ordering::Relaxed), 1);

        // Metrics recorded on both runs
        let stats = registry.stats("memo").await.unwrap();
        assert_eq!(stats.invocations, 2);
    }

    #[tokio::test]
    async fn test_type_filter_selects_subset() {
        let registry = Arc::new(PluginRegistry::new());
        let exec = counting(|| Ok(PluginOutcome::ok()));
        let mut monitoring = descriptor("mon", PluginPriority::Normal);
        monitoring.plugin_type = PluginType::Monitoring;
        registry.register(monitoring, exec.clone()).unwrap();
        registry
            .register(descriptor("mid", PluginPriority::Normal), exec)
            .unwrap();
        registry.activate_all();

        let engine = engine(registry);
        let result = engine
            .execute_chain(&PluginContext::default(), Some(PluginType::Monitoring))
            .await
            .unwrap();

        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].plugin_id, "mon");
    }

    #[tokio::test]
    async fn test_execution_cache_fifo_bound() {
        let mut cache = ExecutionCache::new(2);
        cache.insert("a".to_string(), "1".to_string());
        cache.insert("b".to_string(), "2".to_string());
        cache.insert("c".to_string(), "3".to_string());

        assert_eq!(cache.len(), 2);
        // First inserted key is the one dropped
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[tokio::test]
    async fn test_hook_bus_typed_channels() {
        let bus = HookBus::new();
        let mut timing_rx = bus.on_request_timing();

        bus.emit_request_timing(RequestTiming {
            path: "/x".to_string(),
            method: "GET".to_string(),
            duration_ms: 1.5,
            status_code: 200,
            client_ip: "127.0.0.1".to_string(),
            user_agent: "test".to_string(),
            timestamp: 0,
        });

        let timing = timing_rx.try_recv().unwrap();
        assert_eq!(timing.status_code, 200);
    }

    #[tokio::test]
    async fn test_route_error_snapshots_capped() {
        let info = RouteErrorInfo {
            path: "/x".to_string(),
            method: "POST".to_string(),
            status_code: 500,
            client_ip: "127.0.0.1".to_string(),
            message: "boom".to_string(),
            stack: String::new(),
            body_snapshot: "b".repeat(10_000),
            query_snapshot: "q".repeat(10_000),
            params_snapshot: "p".to_string(),
            timestamp: 0,
        }
        .cap_snapshots();

        assert_eq!(info.body_snapshot.len(), SNAPSHOT_CAP_BYTES);
        assert_eq!(info.query_snapshot.len(), SNAPSHOT_CAP_BYTES);
        assert_eq!(info.params_snapshot, "p");
    }

    #[tokio::test]
    async fn test_registry_stats_counts_active() {
        let registry = Arc::new(PluginRegistry::new());
        let exec = counting(|| Ok(PluginOutcome::ok()));
        registry
            .register(descriptor("a", PluginPriority::Normal), exec.clone())
            .unwrap();
        registry
            .register(descriptor("b", PluginPriority::Normal), exec)
            .unwrap();
        registry.activate("a");

        let stats = registry.registry_stats().await;
        assert_eq!(stats.total_plugins, 2);
        assert_eq!(stats.active_plugins, 1);
    }
}
