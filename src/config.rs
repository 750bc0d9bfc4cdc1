//! Configuration management for the swarmgate runtime

use crate::error::{Error, Result};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cluster: ClusterConfig,
    pub cache: CacheConfig,
    pub secure_cache: SecureCacheConfig,
    pub balancer: BalancerConfig,
    pub health: HealthConfig,
    pub scaling: ScalingConfig,
    pub ipc: IpcConfig,
    pub bridge: BridgeConfig,
    pub persistence: PersistenceConfig,
    pub trust_proxy: TrustProxyConfig,
    pub hot_reload: HotReloadConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: u32,
    pub request_timeout_seconds: u64,
    /// Per-request budget for the whole plugin chain, in milliseconds.
    pub plugin_chain_budget_ms: u64,
}

/// Cluster topology and worker supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub enabled: bool,
    /// 0 = one worker per CPU core
    pub workers: usize,
    /// Workers listen on base_port + index
    pub base_port: u16,
    pub respawn: bool,
    /// Restart budget per worker per hour
    pub max_restarts_per_hour: u32,
    pub restart_delay_ms: u64,
    pub graceful_shutdown_timeout_secs: u64,
    pub kill_timeout_secs: u64,
    /// Soft memory ceiling per worker in MB; 0 disables threshold restarts
    pub memory_threshold_mb: u64,
    /// Soft CPU ceiling per worker in percent; 0 disables threshold restarts
    pub cpu_threshold_percent: f64,
    /// Consecutive over-threshold checks before a resource_limit restart
    pub threshold_check_count: u32,
    pub zombie_poll_interval_secs: u64,
    /// Rolling update bounds
    pub max_unavailable: usize,
    pub max_surge: usize,
    pub health_check_grace_period_secs: u64,
}

/// Smart cache tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub default_ttl_secs: Option<u64>,
    pub strategy: String,
    pub cleanup_interval_secs: u64,
    pub memory_check_interval_secs: u64,
    /// Soft memory budget for the cache in bytes; 0 = unbounded
    pub max_memory_bytes: usize,
}

/// Secure cache overlay tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecureCacheConfig {
    pub enabled: bool,
    /// Entries below this size may skip encryption when marked non-sensitive
    pub bypass_below_bytes: usize,
    pub compress_above_bytes: usize,
    pub key_rotation_interval_secs: u64,
    /// Rotate keys after this many memory-pressure events; 0 disables
    pub rotation_pressure_threshold: u64,
}

/// Load balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub strategy: String,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout_secs: u64,
    pub session_affinity: bool,
    pub session_affinity_header: String,
    /// Minimum seconds between runtime strategy switches
    pub strategy_change_cooldown_secs: u64,
}

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub endpoint: String,
    pub max_failures: u32,
    pub memory_threshold_percent: f64,
    pub cpu_threshold_percent: f64,
    pub event_loop_delay_ms: u64,
}

/// Auto-scaler thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub enabled: bool,
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_step: usize,
    pub cooldown_secs: u64,
    pub evaluation_interval_secs: u64,
    pub cpu_up_threshold: f64,
    pub cpu_down_threshold: f64,
    pub memory_up_threshold: f64,
    pub memory_down_threshold: f64,
    pub response_time_threshold_ms: f64,
    pub queue_length_threshold: usize,
    pub idle_minutes_threshold: u64,
}

/// IPC bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub encrypt: bool,
    pub sign: bool,
    /// Cluster shared secret; generated at startup when absent
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    pub request_timeout_ms: u64,
    pub queue_capacity: usize,
    pub queue_timeout_secs: u64,
    /// Prefer MessagePack framing; JSON remains the fallback
    pub binary_codec: bool,
}

/// Hybrid core bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub enabled: bool,
    /// Path to the native HTTP engine binary
    pub engine_path: String,
    pub fallback: bool,
    pub request_timeout_ms: u64,
    pub max_outstanding: usize,
}

/// Cluster state persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: String,
    pub path: String,
    pub max_backups: usize,
}

/// Trust proxy rules, parsed and validated at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustProxyConfig {
    /// "false", "loopback", "linklocal", "uniquelocal", an IP, a CIDR,
    /// a comma-separated list of those, or a hop count
    pub trust: String,
}

/// Dev-only file watcher restart
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotReloadConfig {
    pub enabled: bool,
    pub watch_paths: Vec<String>,
    pub debounce_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            cluster: ClusterConfig::default(),
            cache: CacheConfig::default(),
            secure_cache: SecureCacheConfig::default(),
            balancer: BalancerConfig::default(),
            health: HealthConfig::default(),
            scaling: ScalingConfig::default(),
            ipc: IpcConfig::default(),
            bridge: BridgeConfig::default(),
            persistence: PersistenceConfig::default(),
            trust_proxy: TrustProxyConfig::default(),
            hot_reload: HotReloadConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 10_000,
            request_timeout_seconds: 30,
            plugin_chain_budget_ms: 10_000,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            workers: 0,
            base_port: 9100,
            respawn: true,
            max_restarts_per_hour: 10,
            restart_delay_ms: 1_000,
            graceful_shutdown_timeout_secs: 48,
            kill_timeout_secs: 15,
            memory_threshold_mb: 0,
            cpu_threshold_percent: 0.0,
            threshold_check_count: 3,
            zombie_poll_interval_secs: 10,
            max_unavailable: 1,
            max_surge: 1,
            health_check_grace_period_secs: 30,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            default_ttl_secs: Some(3_600),
            strategy: "adaptive".to_string(),
            cleanup_interval_secs: 60,
            memory_check_interval_secs: 30,
            max_memory_bytes: 100 * 1024 * 1024,
        }
    }
}

impl Default for SecureCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bypass_below_bytes: 256,
            compress_above_bytes: 1024,
            key_rotation_interval_secs: 24 * 3_600,
            rotation_pressure_threshold: 50,
        }
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: "round-robin".to_string(),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_secs: 60,
            session_affinity: false,
            session_affinity_header: "x-session-id".to_string(),
            strategy_change_cooldown_secs: 30,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 5,
            endpoint: "/health".to_string(),
            max_failures: 3,
            memory_threshold_percent: 90.0,
            cpu_threshold_percent: 95.0,
            event_loop_delay_ms: 100,
        }
    }
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_workers: 2,
            max_workers: 8,
            scale_step: 2,
            cooldown_secs: 180,
            evaluation_interval_secs: 30,
            cpu_up_threshold: 65.0,
            cpu_down_threshold: 25.0,
            memory_up_threshold: 80.0,
            memory_down_threshold: 40.0,
            response_time_threshold_ms: 500.0,
            queue_length_threshold: 100,
            idle_minutes_threshold: 5,
        }
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            encrypt: false,
            sign: true,
            secret: None,
            request_timeout_ms: 5_000,
            queue_capacity: 1_000,
            queue_timeout_secs: 30,
            binary_codec: true,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            engine_path: String::new(),
            fallback: true,
            request_timeout_ms: 30_000,
            max_outstanding: 1_024,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            path: "swarmgate-state.json".to_string(),
            max_backups: 3,
        }
    }
}

impl Default for TrustProxyConfig {
    fn default() -> Self {
        Self {
            trust: "false".to_string(),
        }
    }
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            watch_paths: vec!["src".to_string()],
            debounce_ms: 300,
        }
    }
}

impl Config {
    /// Load configuration from file, environment variables, or use defaults
    pub fn load() -> Result<Self> {
        let mut config = if let Ok(content) = fs::read_to_string("swarmgate.toml") {
            toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?
        } else {
            Self::default()
        };

        config.load_from_env();

        Ok(config)
    }

    /// Load configuration overrides from environment variables
    pub fn load_from_env(&mut self) {
        if let Ok(host) = env::var("SWARMGATE_HOST") {
            self.server.host = host;
        }

        if let Ok(port) = env::var("SWARMGATE_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }

        if let Ok(workers) = env::var("SWARMGATE_WORKERS") {
            if let Ok(workers) = workers.parse() {
                self.cluster.workers = workers;
                self.cluster.enabled = true;
            }
        }

        if let Ok(mode) = env::var("CLUSTER_MODE") {
            if mode == "true" {
                self.cluster.enabled = true;
            }
        }

        if let Ok(secret) = env::var("SWARMGATE_IPC_SECRET") {
            self.ipc.secret = Some(secret);
        }

        if let Ok(strategy) = env::var("SWARMGATE_LB_STRATEGY") {
            self.balancer.strategy = strategy;
        }

        if let Ok(trust) = env::var("SWARMGATE_TRUST_PROXY") {
            self.trust_proxy.trust = trust;
        }

        if let Ok(backend) = env::var("SWARMGATE_STATE_BACKEND") {
            self.persistence.backend = backend;
        }
    }

    /// Validate configuration; called once at startup
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::Config("Invalid server port".to_string()));
        }

        if self.cluster.enabled {
            let workers = self.effective_worker_count();
            if workers == 0 {
                return Err(Error::Config(
                    "Worker count must be greater than 0".to_string(),
                ));
            }
            if self.cluster.base_port == 0 {
                return Err(Error::Config("Invalid cluster base port".to_string()));
            }
            let top = self.cluster.base_port as u32 + workers as u32;
            if top > u16::MAX as u32 {
                return Err(Error::Config(format!(
                    "Worker port range exceeds 65535 (base {} + {} workers)",
                    self.cluster.base_port, workers
                )));
            }
        }

        if self.scaling.enabled {
            if self.scaling.min_workers == 0 {
                return Err(Error::Config("min_workers must be at least 1".to_string()));
            }
            if self.scaling.min_workers > self.scaling.max_workers {
                return Err(Error::Config(
                    "min_workers cannot exceed max_workers".to_string(),
                ));
            }
            if self.scaling.scale_step == 0 {
                return Err(Error::Config("scale_step must be at least 1".to_string()));
            }
        }

        match self.balancer.strategy.as_str() {
            "round-robin" | "least-connections" | "ip-hash" | "weighted"
            | "least-response-time" | "adaptive" | "resource-based" => {}
            other => {
                return Err(Error::Config(format!(
                    "Unknown load balancing strategy: {}",
                    other
                )))
            }
        }

        match self.cache.strategy.as_str() {
            "lru" | "lfu" | "adaptive" => {}
            other => {
                return Err(Error::Config(format!(
                    "Unknown cache eviction strategy: {}",
                    other
                )))
            }
        }

        match self.persistence.backend.as_str() {
            "memory" | "file" | "custom" => {}
            other => {
                return Err(Error::Config(format!(
                    "Unknown persistence backend: {}",
                    other
                )))
            }
        }

        if self.bridge.enabled && self.bridge.engine_path.is_empty() {
            return Err(Error::Config(
                "bridge.engine_path is required when the hybrid core is enabled".to_string(),
            ));
        }

        if (self.ipc.encrypt || self.ipc.sign) && self.cluster.enabled {
            // The secret may still be generated at startup; only reject the
            // degenerate explicit empty string.
            if let Some(secret) = &self.ipc.secret {
                if secret.is_empty() {
                    return Err(Error::Config("IPC secret cannot be empty".to_string()));
                }
            }
        }

        // Trust proxy rules must parse; a typo here must never fail open at
        // request time.
        crate::request::TrustProxy::parse(&self.trust_proxy.trust)?;

        Ok(())
    }

    /// Worker count with the CPU-count default applied
    pub fn effective_worker_count(&self) -> usize {
        if self.cluster.workers == 0 {
            num_cpus::get()
        } else {
            self.cluster.workers
        }
    }

    /// IPC secret as guarded key material
    pub fn ipc_secret(&self) -> Option<SecretString> {
        self.ipc.secret.clone().map(SecretString::from)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_seconds)
    }

    /// Get configuration summary for logging
    pub fn summary(&self) -> String {
        format!(
            "swarmgate config - server {}:{}, cluster: {} ({} workers), lb: {}, cache: {} ({} entries)",
            self.server.host,
            self.server.port,
            if self.cluster.enabled { "on" } else { "off" },
            self.effective_worker_count(),
            self.balancer.strategy,
            self.cache.strategy,
            self.cache.max_entries,
        )
    }
}
