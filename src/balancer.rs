//! Adaptive request load balancer
//!
//! The master owns every circuit breaker and rolling window here; callers
//! interact through `pick` and the `record_*` family only. One lock guards
//! the whole structure rather than fine-grained per-field locking.

use crate::config::BalancerConfig;
use crate::error::{Error, Result};
use crate::monitoring::WorkerMetrics;
use ring::digest;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const VIRTUAL_NODES: usize = 150;
const LATENCY_WINDOW: usize = 1_000;
const OUTCOME_RETENTION: Duration = Duration::from_secs(300);

/// Load balancing strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    RoundRobin,
    LeastConnections,
    IpHash,
    Weighted,
    LeastResponseTime,
    Adaptive,
    ResourceBased,
}

impl Strategy {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "round-robin" => Ok(Self::RoundRobin),
            "least-connections" => Ok(Self::LeastConnections),
            "ip-hash" => Ok(Self::IpHash),
            "weighted" => Ok(Self::Weighted),
            "least-response-time" => Ok(Self::LeastResponseTime),
            "adaptive" => Ok(Self::Adaptive),
            "resource-based" => Ok(Self::ResourceBased),
            other => Err(Error::Validation(format!("unknown strategy: {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::LeastConnections => "least-connections",
            Self::IpHash => "ip-hash",
            Self::Weighted => "weighted",
            Self::LeastResponseTime => "least-response-time",
            Self::Adaptive => "adaptive",
            Self::ResourceBased => "resource-based",
        }
    }

    /// Strategies that are meaningless without worker metrics.
    fn needs_metrics(&self) -> bool {
        matches!(
            self,
            Self::LeastResponseTime | Self::Adaptive | Self::ResourceBased
        )
    }
}

/// Per-worker circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct CircuitBreaker {
    state: CircuitState,
    failures: u32,
    last_failure_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
    /// Half-open admits exactly one trial request at a time
    trial_in_flight: bool,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            last_failure_at: None,
            next_attempt_at: None,
            trial_in_flight: false,
        }
    }

    /// Move Open breakers whose window elapsed into HalfOpen.
    fn refresh(&mut self, now: Instant) {
        if self.state == CircuitState::Open {
            if let Some(next) = self.next_attempt_at {
                if now >= next {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = false;
                }
            }
        }
    }

    fn admits(&self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !self.trial_in_flight,
            CircuitState::Open => false,
        }
    }

    fn on_picked(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.trial_in_flight = true;
        }
    }

    fn on_success(&mut self) {
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.failures = 0;
                self.trial_in_flight = false;
                self.next_attempt_at = None;
            }
            CircuitState::Closed => {
                self.failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn on_error(&mut self, threshold: u32, timeout: Duration, now: Instant) {
        self.failures += 1;
        self.last_failure_at = Some(now);
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.trial_in_flight = false;
                self.next_attempt_at = Some(now + timeout);
            }
            CircuitState::Closed if self.failures >= threshold => {
                self.state = CircuitState::Open;
                self.next_attempt_at = Some(now + timeout);
            }
            _ => {}
        }
    }
}

/// Consistent hash ring with virtual nodes
struct HashRing {
    points: BTreeMap<u64, String>,
}

impl HashRing {
    fn new() -> Self {
        Self {
            points: BTreeMap::new(),
        }
    }

    fn hash(input: &str) -> u64 {
        let hashed = digest::digest(&digest::SHA256, input.as_bytes());
        let bytes = hashed.as_ref();
        u64::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ])
    }

    fn add(&mut self, worker_id: &str) {
        for vnode in 0..VIRTUAL_NODES {
            let point = Self::hash(&format!("{}:{}", worker_id, vnode));
            self.points.insert(point, worker_id.to_string());
        }
    }

    fn remove(&mut self, worker_id: &str) {
        self.points.retain(|_, id| id != worker_id);
    }

    /// Walk clockwise from the key's point until an eligible worker turns
    /// up; a lost worker's keys remap to the next ring node.
    fn lookup<F: Fn(&str) -> bool>(&self, key: &str, eligible: F) -> Option<String> {
        if self.points.is_empty() {
            return None;
        }
        let start = Self::hash(key);
        let mut seen = 0usize;
        let iter = self
            .points
            .range(start..)
            .chain(self.points.range(..start));
        for (_, worker_id) in iter {
            if eligible(worker_id) {
                return Some(worker_id.clone());
            }
            seen += 1;
            if seen >= self.points.len() {
                break;
            }
        }
        None
    }
}

struct WorkerSlot {
    worker_id: String,
    weight: f64,
    healthy: bool,
    active_connections: u64,
    latencies: VecDeque<f64>,
    /// (timestamp, ok) outcomes pruned to the retention window
    outcomes: VecDeque<(Instant, bool)>,
    /// Requests inside the current one-second throughput bucket
    bucket_count: u64,
    bucket_started: Instant,
    last_rps: f64,
    picked: u64,
    breaker: CircuitBreaker,
    metrics: Option<WorkerMetrics>,
}

impl WorkerSlot {
    fn new(worker_id: &str, weight: f64) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            weight,
            healthy: true,
            active_connections: 0,
            latencies: VecDeque::new(),
            outcomes: VecDeque::new(),
            bucket_count: 0,
            bucket_started: Instant::now(),
            last_rps: 0.0,
            picked: 0,
            breaker: CircuitBreaker::new(),
            metrics: None,
        }
    }

    fn avg_latency(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        self.latencies.iter().sum::<f64>() / self.latencies.len() as f64
    }

    fn percentile(&self, q: f64) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.latencies.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((sorted.len() as f64 - 1.0) * q).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    fn error_rate(&self, now: Instant) -> f64 {
        let relevant: Vec<bool> = self
            .outcomes
            .iter()
            .filter(|(t, _)| now.duration_since(*t) <= OUTCOME_RETENTION)
            .map(|(_, ok)| *ok)
            .collect();
        if relevant.is_empty() {
            return 0.0;
        }
        let errors = relevant.iter().filter(|ok| !**ok).count();
        errors as f64 / relevant.len() as f64
    }

    fn active_requests(&self) -> u64 {
        self.metrics
            .as_ref()
            .map(|m| m.requests.active_requests)
            .unwrap_or(0)
    }

    fn prune(&mut self, now: Instant) {
        while self
            .outcomes
            .front()
            .map(|(t, _)| now.duration_since(*t) > OUTCOME_RETENTION)
            .unwrap_or(false)
        {
            self.outcomes.pop_front();
        }
        // Throughput bucket resets every second
        if now.duration_since(self.bucket_started) >= Duration::from_secs(1) {
            self.last_rps =
                self.bucket_count as f64 / now.duration_since(self.bucket_started).as_secs_f64();
            self.bucket_count = 0;
            self.bucket_started = now;
        }
    }

    fn record_outcome(&mut self, ok: bool, latency_ms: Option<f64>, now: Instant) {
        self.outcomes.push_back((now, ok));
        self.bucket_count += 1;
        if let Some(latency) = latency_ms {
            self.latencies.push_back(latency);
            while self.latencies.len() > LATENCY_WINDOW {
                self.latencies.pop_front();
            }
        }
        self.prune(now);
    }

    /// Composite 0-100 score for the adaptive strategy.
    fn adaptive_score(&self, now: Instant) -> f64 {
        let health = self
            .metrics
            .as_ref()
            .map(|m| m.health.score)
            .filter(|s| *s > 0.0)
            .unwrap_or(if self.healthy { 100.0 } else { 0.0 });

        let response_time_factor = (100.0 - self.avg_latency().min(100.0)).max(0.0);
        let error_rate_factor = 100.0 * (1.0 - self.error_rate(now));
        let throughput_factor = self.last_rps.min(100.0);
        let performance = (response_time_factor + error_rate_factor + throughput_factor) / 3.0;

        let load_factor = (100.0 - (self.active_connections as f64 * 10.0).min(100.0)).max(0.0);

        // Small jitter so equal scores don't stampede one worker
        let jitter = fastrand::f64() * 4.0 - 2.0;
        health * 0.4 + performance * 0.4 + load_factor * 0.2 + jitter
    }
}

/// Request attributes the balancer selects on
#[derive(Debug, Clone, Default)]
pub struct RouteContext {
    pub client_ip: String,
    pub session_key: Option<String>,
    pub method: String,
}

/// Per-worker distribution entry in the stats report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDistribution {
    pub worker_id: String,
    pub picked: u64,
    pub share: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub error_rate: f64,
    pub circuit: CircuitState,
    pub healthy: bool,
    pub weight: f64,
}

/// Balancer analytics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerStats {
    pub strategy: Strategy,
    pub total_picked: u64,
    pub efficiency_score: f64,
    pub workers: Vec<WorkerDistribution>,
}

struct BalancerInner {
    workers: HashMap<String, WorkerSlot>,
    /// Registration order drives round-robin
    order: Vec<String>,
    rr_cursor: usize,
    ring: HashRing,
    strategy: Strategy,
    last_strategy_change: Option<Instant>,
}

/// The load balancer
pub struct LoadBalancer {
    inner: Mutex<BalancerInner>,
    threshold: u32,
    breaker_timeout: Duration,
    strategy_cooldown: Duration,
    session_affinity: bool,
}

impl LoadBalancer {
    pub fn new(config: &BalancerConfig) -> Result<Self> {
        let strategy = Strategy::parse(&config.strategy)?;
        Ok(Self {
            inner: Mutex::new(BalancerInner {
                workers: HashMap::new(),
                order: Vec::new(),
                rr_cursor: 0,
                ring: HashRing::new(),
                strategy,
                last_strategy_change: None,
            }),
            threshold: config.circuit_breaker_threshold,
            breaker_timeout: Duration::from_secs(config.circuit_breaker_timeout_secs),
            strategy_cooldown: Duration::from_secs(config.strategy_change_cooldown_secs),
            session_affinity: config.session_affinity,
        })
    }

    pub async fn register_worker(&self, worker_id: &str, weight: f64) {
        let mut inner = self.inner.lock().await;
        if inner.workers.contains_key(worker_id) {
            return;
        }
        inner
            .workers
            .insert(worker_id.to_string(), WorkerSlot::new(worker_id, weight));
        inner.order.push(worker_id.to_string());
        inner.ring.add(worker_id);
        debug!(worker = %worker_id, weight, "worker registered with balancer");
    }

    pub async fn remove_worker(&self, worker_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.workers.remove(worker_id);
        inner.order.retain(|id| id != worker_id);
        inner.ring.remove(worker_id);
        if inner.rr_cursor >= inner.order.len() && !inner.order.is_empty() {
            inner.rr_cursor %= inner.order.len();
        }
    }

    pub async fn set_health(&self, worker_id: &str, healthy: bool) {
        let mut inner = self.inner.lock().await;
        if let Some(slot) = inner.workers.get_mut(worker_id) {
            slot.healthy = healthy;
        }
    }

    pub async fn set_weight(&self, worker_id: &str, weight: f64) {
        let mut inner = self.inner.lock().await;
        if let Some(slot) = inner.workers.get_mut(worker_id) {
            slot.weight = weight;
        }
    }

    pub async fn update_metrics(&self, metrics: WorkerMetrics) {
        let mut inner = self.inner.lock().await;
        if let Some(slot) = inner.workers.get_mut(&metrics.worker_id) {
            slot.metrics = Some(metrics);
        }
    }

    pub async fn strategy(&self) -> Strategy {
        self.inner.lock().await.strategy
    }

    /// Switch strategy at runtime; throttled to one change per cooldown.
    pub async fn update_strategy(&self, strategy: Strategy) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.strategy == strategy {
            return Ok(false);
        }
        let now = Instant::now();
        if let Some(changed) = inner.last_strategy_change {
            if now.duration_since(changed) < self.strategy_cooldown {
                return Err(Error::Validation(
                    "strategy change throttled, try again later".to_string(),
                ));
            }
        }
        info!(from = inner.strategy.as_str(), to = strategy.as_str(), "balancer strategy changed");
        inner.strategy = strategy;
        inner.last_strategy_change = Some(now);
        Ok(true)
    }

    /// Pick a worker for one request. `Err(Resource)` maps to HTTP 503.
    pub async fn pick(&self, ctx: &RouteContext) -> Result<String> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        for slot in inner.workers.values_mut() {
            slot.breaker.refresh(now);
            slot.prune(now);
        }

        let eligible: Vec<String> = inner
            .order
            .iter()
            .filter(|id| {
                inner
                    .workers
                    .get(*id)
                    .map(|s| s.healthy && s.breaker.admits())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        if eligible.is_empty() {
            return Err(Error::Resource("No workers available".to_string()));
        }

        let mut strategy = inner.strategy;
        if strategy.needs_metrics() {
            let any_metrics = eligible
                .iter()
                .any(|id| inner.workers.get(id).map(|s| s.metrics.is_some()).unwrap_or(false));
            if !any_metrics {
                // Fall back to round-robin with health filtering
                strategy = Strategy::RoundRobin;
            }
        }

        let picked = match strategy {
            Strategy::RoundRobin => self.pick_round_robin(&mut inner, &eligible),
            Strategy::LeastConnections => Self::pick_least_connections(&inner, &eligible),
            Strategy::IpHash => self.pick_ip_hash(&inner, &eligible, ctx),
            Strategy::Weighted => Self::pick_weighted(&inner, &eligible),
            Strategy::LeastResponseTime => Self::pick_least_response_time(&inner, &eligible),
            Strategy::Adaptive => Self::pick_adaptive(&inner, &eligible, now),
            Strategy::ResourceBased => Self::pick_resource_based(&inner, &eligible),
        };

        let Some(worker_id) = picked else {
            return Err(Error::Resource("No workers available".to_string()));
        };

        if let Some(slot) = inner.workers.get_mut(&worker_id) {
            slot.breaker.on_picked();
            slot.picked += 1;
            slot.active_connections += 1;
        }
        Ok(worker_id)
    }

    fn pick_round_robin(&self, inner: &mut BalancerInner, eligible: &[String]) -> Option<String> {
        let len = inner.order.len();
        if len == 0 {
            return None;
        }
        for offset in 0..len {
            let idx = (inner.rr_cursor + offset) % len;
            let candidate = &inner.order[idx];
            if eligible.contains(candidate) {
                inner.rr_cursor = (idx + 1) % len;
                return Some(candidate.clone());
            }
        }
        None
    }

    fn pick_least_connections(inner: &BalancerInner, eligible: &[String]) -> Option<String> {
        eligible
            .iter()
            .min_by(|a, b| {
                let score = |id: &String| {
                    inner
                        .workers
                        .get(id)
                        .map(|s| {
                            s.active_connections as f64
                                + s.active_requests() as f64
                                + s.avg_latency() / 100.0
                        })
                        .unwrap_or(f64::MAX)
                };
                score(a)
                    .partial_cmp(&score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }

    fn pick_ip_hash(
        &self,
        inner: &BalancerInner,
        eligible: &[String],
        ctx: &RouteContext,
    ) -> Option<String> {
        let key = if self.session_affinity {
            ctx.session_key
                .clone()
                .unwrap_or_else(|| ctx.client_ip.clone())
        } else {
            ctx.client_ip.clone()
        };
        inner.ring.lookup(&key, |id| eligible.contains(&id.to_string()))
    }

    fn pick_weighted(inner: &BalancerInner, eligible: &[String]) -> Option<String> {
        let weights: Vec<f64> = eligible
            .iter()
            .map(|id| {
                inner
                    .workers
                    .get(id)
                    .map(|s| s.weight.max(0.1))
                    .unwrap_or(0.1)
            })
            .collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return eligible.first().cloned();
        }
        let mut roll = fastrand::f64() * total;
        for (id, weight) in eligible.iter().zip(weights.iter()) {
            roll -= weight;
            if roll <= 0.0 {
                return Some(id.clone());
            }
        }
        eligible.last().cloned()
    }

    fn pick_least_response_time(inner: &BalancerInner, eligible: &[String]) -> Option<String> {
        eligible
            .iter()
            .min_by(|a, b| {
                let score = |id: &String| {
                    inner
                        .workers
                        .get(id)
                        .map(|s| s.avg_latency() * (1.0 + s.active_requests() as f64 * 0.1))
                        .unwrap_or(f64::MAX)
                };
                score(a)
                    .partial_cmp(&score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }

    fn pick_adaptive(inner: &BalancerInner, eligible: &[String], now: Instant) -> Option<String> {
        eligible
            .iter()
            .max_by(|a, b| {
                let score = |id: &String| {
                    inner
                        .workers
                        .get(id)
                        .map(|s| s.adaptive_score(now))
                        .unwrap_or(0.0)
                };
                score(a)
                    .partial_cmp(&score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }

    fn pick_resource_based(inner: &BalancerInner, eligible: &[String]) -> Option<String> {
        eligible
            .iter()
            .min_by(|a, b| {
                let score = |id: &String| {
                    inner
                        .workers
                        .get(id)
                        .map(|s| {
                            let (cpu, mem) = s
                                .metrics
                                .as_ref()
                                .map(|m| (m.cpu.current, m.memory.percentage))
                                .unwrap_or((50.0, 50.0));
                            (cpu + mem) / 2.0 + s.active_requests() as f64 * 10.0
                        })
                        .unwrap_or(f64::MAX)
                };
                score(a)
                    .partial_cmp(&score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }

    /// Transport callback after a successful response.
    pub async fn record_success(&self, worker_id: &str, latency_ms: f64) {
        let mut inner = self.inner.lock().await;
        if let Some(slot) = inner.workers.get_mut(worker_id) {
            let now = Instant::now();
            slot.active_connections = slot.active_connections.saturating_sub(1);
            slot.record_outcome(true, Some(latency_ms), now);
            slot.breaker.on_success();
        }
    }

    /// Transport callback after a failed response.
    pub async fn record_error(&self, worker_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(slot) = inner.workers.get_mut(worker_id) {
            let now = Instant::now();
            slot.active_connections = slot.active_connections.saturating_sub(1);
            slot.record_outcome(false, None, now);
            slot.breaker
                .on_error(self.threshold, self.breaker_timeout, now);
            if slot.breaker.state == CircuitState::Open {
                warn!(worker = %worker_id, failures = slot.breaker.failures, "circuit opened");
            }
        }
    }

    pub async fn record_response_time(&self, worker_id: &str, latency_ms: f64) {
        let mut inner = self.inner.lock().await;
        if let Some(slot) = inner.workers.get_mut(worker_id) {
            slot.latencies.push_back(latency_ms);
            while slot.latencies.len() > LATENCY_WINDOW {
                slot.latencies.pop_front();
            }
        }
    }

    pub async fn is_circuit_open(&self, worker_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .workers
            .get(worker_id)
            .map(|s| s.breaker.state == CircuitState::Open)
            .unwrap_or(false)
    }

    pub async fn circuit_state(&self, worker_id: &str) -> Option<CircuitState> {
        let inner = self.inner.lock().await;
        inner.workers.get(worker_id).map(|s| s.breaker.state)
    }

    pub async fn reset_circuit_breaker(&self, worker_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.workers.get_mut(worker_id) {
            Some(slot) => {
                slot.breaker = CircuitBreaker::new();
                true
            }
            None => false,
        }
    }

    pub async fn worker_percentile(&self, worker_id: &str, q: f64) -> Option<f64> {
        let inner = self.inner.lock().await;
        inner.workers.get(worker_id).map(|s| s.percentile(q))
    }

    pub async fn healthy_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .workers
            .values()
            .filter(|s| s.healthy && s.breaker.state != CircuitState::Open)
            .count()
    }

    /// Distribution report with the Gini-derived efficiency score.
    pub async fn stats(&self) -> BalancerStats {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        let total: u64 = inner.workers.values().map(|s| s.picked).sum();

        let workers: Vec<WorkerDistribution> = inner
            .order
            .iter()
            .filter_map(|id| inner.workers.get(id))
            .map(|slot| WorkerDistribution {
                worker_id: slot.worker_id.clone(),
                picked: slot.picked,
                share: if total > 0 {
                    slot.picked as f64 / total as f64
                } else {
                    0.0
                },
                avg_latency_ms: slot.avg_latency(),
                p95_latency_ms: slot.percentile(0.95),
                error_rate: slot.error_rate(now),
                circuit: slot.breaker.state,
                healthy: slot.healthy,
                weight: slot.weight,
            })
            .collect();

        let counts: Vec<f64> = workers.iter().map(|w| w.picked as f64).collect();
        BalancerStats {
            strategy: inner.strategy,
            total_picked: total,
            efficiency_score: efficiency_from_gini(&counts),
            workers,
        }
    }

    /// Weights snapshot for persistence.
    pub async fn weights(&self) -> HashMap<String, f64> {
        let inner = self.inner.lock().await;
        inner
            .workers
            .iter()
            .map(|(id, slot)| (id.clone(), slot.weight))
            .collect()
    }
}

/// Efficiency 0-100 from the Gini coefficient of the request distribution;
/// perfectly even distribution scores 100.
pub fn efficiency_from_gini(counts: &[f64]) -> f64 {
    let n = counts.len();
    if n == 0 {
        return 100.0;
    }
    let sum: f64 = counts.iter().sum();
    if sum <= 0.0 {
        return 100.0;
    }
    let mean = sum / n as f64;
    let mut abs_diff_sum = 0.0;
    for a in counts {
        for b in counts {
            abs_diff_sum += (a - b).abs();
        }
    }
    let gini = abs_diff_sum / (2.0 * (n as f64).powi(2) * mean);
    (1.0 - gini).clamp(0.0, 1.0) * 100.0
}
