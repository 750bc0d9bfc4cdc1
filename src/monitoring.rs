//! Worker metrics collection, aggregation, and export
//!
//! Workers sample themselves and ship snapshots to the master over IPC;
//! the master aggregates by copying snapshots, never by sharing state.

use crate::error::{Error, Result};
use dashmap::DashMap;
use prometheus::{Encoder, GaugeVec, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};
use tokio::sync::Mutex;
use tracing::debug;

/// Aggregate history depth kept by the master
const HISTORY_CAP: usize = 300;
/// Latency window per worker telemetry
const LATENCY_WINDOW: usize = 1_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuMetrics {
    pub current: f64,
    pub avg: f64,
    pub peak: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub rss_bytes: u64,
    pub heap_bytes: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub connections: u64,
    pub bytes_per_second: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetrics {
    pub total: u64,
    pub rps: f64,
    pub errors: u64,
    pub active_requests: u64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: String,
    pub score: f64,
    pub last_check_at: i64,
    pub consecutive_failures: u32,
}

/// Collector pauses reported by managed runtimes (the native engine of the
/// hybrid core reports real numbers; pure-Rust workers report zeros).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcMetrics {
    pub collections: u64,
    pub pause_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventLoopMetrics {
    pub delay_ms: f64,
    pub utilization: f64,
}

/// One worker's full metrics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub worker_id: String,
    pub timestamp: i64,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub network: NetworkMetrics,
    pub requests: RequestMetrics,
    pub health: HealthSnapshot,
    pub gc: GcMetrics,
    pub event_loop: EventLoopMetrics,
}

/// Cluster-wide aggregate built from copied snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMetrics {
    pub timestamp: i64,
    pub worker_count: usize,
    pub total_requests: u64,
    pub total_errors: u64,
    pub requests_per_second: f64,
    pub avg_cpu: f64,
    pub avg_memory_percentage: f64,
    pub avg_response_time_ms: f64,
    pub workers: Vec<WorkerMetrics>,
}

/// Request counters a worker maintains about itself
pub struct WorkerTelemetry {
    worker_id: String,
    started_at: Instant,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    active_requests: AtomicU64,
    latencies: Mutex<VecDeque<f64>>,
    window_started: Mutex<Instant>,
    window_requests: AtomicU64,
    system: Mutex<System>,
    pid: Pid,
    cpu_avg: Mutex<(f64, u64)>,
    cpu_peak: Mutex<f64>,
    loop_delay_ms: Mutex<f64>,
}

impl WorkerTelemetry {
    pub fn new(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            started_at: Instant::now(),
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            active_requests: AtomicU64::new(0),
            latencies: Mutex::new(VecDeque::new()),
            window_started: Mutex::new(Instant::now()),
            window_requests: AtomicU64::new(0),
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
            cpu_avg: Mutex::new((0.0, 0)),
            cpu_peak: Mutex::new(0.0),
            loop_delay_ms: Mutex::new(0.0),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn request_started(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn request_finished(&self, latency_ms: f64, error: bool) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.window_requests.fetch_add(1, Ordering::Relaxed);
        if error {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
        let mut latencies = self.latencies.lock().await;
        latencies.push_back(latency_ms);
        while latencies.len() > LATENCY_WINDOW {
            latencies.pop_front();
        }
    }

    /// Measure timer drift as an event-loop delay proxy; spawned once by
    /// the worker runtime.
    pub fn start_loop_probe(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let telemetry = Arc::clone(self);
        tokio::spawn(async move {
            let tick = Duration::from_millis(500);
            loop {
                let before = Instant::now();
                tokio::time::sleep(tick).await;
                let overshoot = before.elapsed().saturating_sub(tick);
                *telemetry.loop_delay_ms.lock().await = overshoot.as_secs_f64() * 1_000.0;
            }
        })
    }

    /// Produce a fresh snapshot; refreshes process cpu/memory via sysinfo.
    pub async fn snapshot(&self) -> WorkerMetrics {
        let (cpu_current, rss, total_memory) = {
            let mut system = self.system.lock().await;
            system.refresh_processes();
            system.refresh_memory();
            match system.process(self.pid) {
                Some(process) => (
                    process.cpu_usage() as f64,
                    process.memory(),
                    system.total_memory(),
                ),
                None => (0.0, 0, system.total_memory()),
            }
        };

        let (cpu_avg, cpu_peak) = {
            let mut avg = self.cpu_avg.lock().await;
            avg.1 += 1;
            avg.0 += (cpu_current - avg.0) / avg.1 as f64;
            let mut peak = self.cpu_peak.lock().await;
            if cpu_current > *peak {
                *peak = cpu_current;
            }
            (avg.0, *peak)
        };

        let (p50, p95, p99) = {
            let latencies = self.latencies.lock().await;
            (
                percentile_of(&latencies, 0.50),
                percentile_of(&latencies, 0.95),
                percentile_of(&latencies, 0.99),
            )
        };

        let rps = {
            let mut window_started = self.window_started.lock().await;
            let elapsed = window_started.elapsed().as_secs_f64();
            if elapsed >= 1.0 {
                let count = self.window_requests.swap(0, Ordering::Relaxed);
                *window_started = Instant::now();
                count as f64 / elapsed
            } else {
                self.window_requests.load(Ordering::Relaxed) as f64 / elapsed.max(0.001)
            }
        };

        let delay_ms = *self.loop_delay_ms.lock().await;

        WorkerMetrics {
            worker_id: self.worker_id.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            cpu: CpuMetrics {
                current: cpu_current,
                avg: cpu_avg,
                peak: cpu_peak,
            },
            memory: MemoryMetrics {
                rss_bytes: rss,
                heap_bytes: 0,
                percentage: if total_memory > 0 {
                    100.0 * rss as f64 / total_memory as f64
                } else {
                    0.0
                },
            },
            network: NetworkMetrics::default(),
            requests: RequestMetrics {
                total: self.total_requests.load(Ordering::Relaxed),
                rps,
                errors: self.total_errors.load(Ordering::Relaxed),
                active_requests: self.active_requests.load(Ordering::Relaxed),
                p50_ms: p50,
                p95_ms: p95,
                p99_ms: p99,
            },
            health: HealthSnapshot::default(),
            gc: GcMetrics::default(),
            event_loop: EventLoopMetrics {
                delay_ms,
                utilization: 0.0,
            },
        }
    }
}

fn percentile_of(samples: &VecDeque<f64>, q: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((sorted.len() as f64 - 1.0) * q).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Master-side store of the latest snapshot per worker plus an aggregate
/// history ring.
pub struct MetricsStore {
    latest: DashMap<String, WorkerMetrics>,
    history: Mutex<VecDeque<ClusterMetrics>>,
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsStore {
    pub fn new() -> Self {
        Self {
            latest: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, metrics: WorkerMetrics) {
        debug!(worker = %metrics.worker_id, "metrics snapshot recorded");
        self.latest.insert(metrics.worker_id.clone(), metrics);
    }

    pub fn latest(&self, worker_id: &str) -> Option<WorkerMetrics> {
        self.latest.get(worker_id).map(|m| m.value().clone())
    }

    pub fn forget(&self, worker_id: &str) {
        self.latest.remove(worker_id);
    }

    /// Copy-aggregate every worker snapshot into one cluster view and push
    /// it onto the bounded history ring.
    pub async fn aggregate(&self) -> ClusterMetrics {
        let workers: Vec<WorkerMetrics> = self.latest.iter().map(|m| m.value().clone()).collect();
        let worker_count = workers.len();

        let total_requests = workers.iter().map(|w| w.requests.total).sum();
        let total_errors = workers.iter().map(|w| w.requests.errors).sum();
        let requests_per_second = workers.iter().map(|w| w.requests.rps).sum();
        let (avg_cpu, avg_memory, avg_rt) = if worker_count > 0 {
            (
                workers.iter().map(|w| w.cpu.current).sum::<f64>() / worker_count as f64,
                workers.iter().map(|w| w.memory.percentage).sum::<f64>() / worker_count as f64,
                workers.iter().map(|w| w.requests.p50_ms).sum::<f64>() / worker_count as f64,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        let aggregate = ClusterMetrics {
            timestamp: chrono::Utc::now().timestamp_millis(),
            worker_count,
            total_requests,
            total_errors,
            requests_per_second,
            avg_cpu,
            avg_memory_percentage: avg_memory,
            avg_response_time_ms: avg_rt,
            workers,
        };

        let mut history = self.history.lock().await;
        history.push_back(aggregate.clone());
        while history.len() > HISTORY_CAP {
            history.pop_front();
        }

        aggregate
    }

    pub async fn history(&self) -> Vec<ClusterMetrics> {
        self.history.lock().await.iter().cloned().collect()
    }

    pub async fn restore_history(&self, entries: Vec<ClusterMetrics>) {
        let mut history = self.history.lock().await;
        history.clear();
        for entry in entries.into_iter().take(HISTORY_CAP) {
            history.push_back(entry);
        }
    }
}

/// Export format for the metrics endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Prometheus,
    Csv,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(Self::Json),
            "prometheus" => Ok(Self::Prometheus),
            "csv" => Ok(Self::Csv),
            other => Err(Error::Validation(format!("unknown format: {}", other))),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Prometheus => "text/plain; version=0.0.4",
            Self::Csv => "text/csv",
        }
    }
}

/// Render the aggregate in the requested format.
pub fn export_metrics(metrics: &ClusterMetrics, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(metrics)?),
        ExportFormat::Prometheus => export_prometheus(metrics),
        ExportFormat::Csv => export_csv(metrics),
    }
}

fn export_prometheus(metrics: &ClusterMetrics) -> Result<String> {
    let registry = Registry::new();

    let requests = IntGaugeVec::new(
        Opts::new("swarmgate_worker_requests_total", "Requests handled"),
        &["worker_id"],
    )
    .map_err(|e| Error::Internal(e.to_string()))?;
    let errors = IntGaugeVec::new(
        Opts::new("swarmgate_worker_errors_total", "Errored requests"),
        &["worker_id"],
    )
    .map_err(|e| Error::Internal(e.to_string()))?;
    let cpu = GaugeVec::new(
        Opts::new("swarmgate_worker_cpu_percent", "Worker CPU usage"),
        &["worker_id"],
    )
    .map_err(|e| Error::Internal(e.to_string()))?;
    let memory = GaugeVec::new(
        Opts::new("swarmgate_worker_memory_percent", "Worker memory usage"),
        &["worker_id"],
    )
    .map_err(|e| Error::Internal(e.to_string()))?;
    let p95 = GaugeVec::new(
        Opts::new("swarmgate_worker_p95_ms", "Worker p95 latency"),
        &["worker_id"],
    )
    .map_err(|e| Error::Internal(e.to_string()))?;

    registry
        .register(Box::new(requests.clone()))
        .and_then(|_| registry.register(Box::new(errors.clone())))
        .and_then(|_| registry.register(Box::new(cpu.clone())))
        .and_then(|_| registry.register(Box::new(memory.clone())))
        .and_then(|_| registry.register(Box::new(p95.clone())))
        .map_err(|e| Error::Internal(e.to_string()))?;

    for worker in &metrics.workers {
        let id = worker.worker_id.as_str();
        requests
            .with_label_values(&[id])
            .set(worker.requests.total as i64);
        errors
            .with_label_values(&[id])
            .set(worker.requests.errors as i64);
        cpu.with_label_values(&[id]).set(worker.cpu.current);
        memory.with_label_values(&[id]).set(worker.memory.percentage);
        p95.with_label_values(&[id]).set(worker.requests.p95_ms);
    }

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| Error::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
}

fn export_csv(metrics: &ClusterMetrics) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record([
            "worker_id",
            "requests_total",
            "errors_total",
            "rps",
            "cpu_percent",
            "memory_percent",
            "p95_ms",
        ])
        .map_err(|e| Error::Serialization(e.to_string()))?;

    for worker in &metrics.workers {
        writer
            .write_record([
                worker.worker_id.clone(),
                worker.requests.total.to_string(),
                worker.requests.errors.to_string(),
                format!("{:.2}", worker.requests.rps),
                format!("{:.2}", worker.cpu.current),
                format!("{:.2}", worker.memory.percentage),
                format!("{:.2}", worker.requests.p95_ms),
            ])
            .map_err(|e| Error::Serialization(e.to_string()))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| Error::Serialization(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| Error::Serialization(e.to_string()))
}
