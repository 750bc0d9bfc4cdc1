//! Cluster state persistence
//!
//! Only non-derived state is persisted: config snapshot, metric history,
//! balancer weights and trends. Worker identities are never restored;
//! workers respawn fresh on start.

use crate::config::{Config, PersistenceConfig};
use crate::error::{Error, Result};
use crate::monitoring::ClusterMetrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Bump when the on-disk layout changes; unknown versions are backed up
/// and ignored.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Worker summary as persisted (informational only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub pid: u32,
    pub status: String,
    pub started_at: i64,
    pub restarts: u32,
}

/// The persistable cluster state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentClusterState {
    pub version: u32,
    pub timestamp: i64,
    pub state: String,
    pub config: Config,
    pub workers: Vec<WorkerSummary>,
    pub metrics_history: Vec<ClusterMetrics>,
    pub balancer_strategy: String,
    pub balancer_weights: HashMap<String, f64>,
    /// Rolling efficiency-score trend
    pub efficiency_trend: Vec<f64>,
}

impl PersistentClusterState {
    pub fn new(config: Config) -> Self {
        Self {
            version: STATE_SCHEMA_VERSION,
            timestamp: chrono::Utc::now().timestamp_millis(),
            state: "stopped".to_string(),
            config,
            workers: Vec::new(),
            metrics_history: Vec::new(),
            balancer_strategy: "round-robin".to_string(),
            balancer_weights: HashMap::new(),
            efficiency_trend: Vec::new(),
        }
    }
}

/// Storage backend for the cluster state
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, state: &PersistentClusterState) -> Result<()>;
    async fn load(&self) -> Result<Option<PersistentClusterState>>;
}

/// In-memory backend (default; state dies with the process)
#[derive(Default)]
pub struct MemoryStore {
    slot: RwLock<Option<PersistentClusterState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save(&self, state: &PersistentClusterState) -> Result<()> {
        *self.slot.write().await = Some(state.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<PersistentClusterState>> {
        Ok(self.slot.read().await.clone())
    }
}

/// File backend: one primary file plus rotating backups
pub struct FileStore {
    path: PathBuf,
    max_backups: usize,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>, max_backups: usize) -> Self {
        Self {
            path: path.into(),
            max_backups,
        }
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(format!(".{}", index));
        PathBuf::from(os)
    }

    async fn rotate_backups(&self) -> Result<()> {
        if self.max_backups == 0 {
            return Ok(());
        }
        // Shift older backups up, dropping the oldest
        for index in (1..self.max_backups).rev() {
            let from = self.backup_path(index);
            if tokio::fs::try_exists(&from).await.unwrap_or(false) {
                let to = self.backup_path(index + 1);
                let _ = tokio::fs::rename(&from, &to).await;
            }
        }
        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            tokio::fs::rename(&self.path, self.backup_path(1)).await?;
        }
        Ok(())
    }

    async fn quarantine(&self, reason: &str) -> Result<()> {
        let mut os = self.path.clone().into_os_string();
        os.push(".invalid");
        let target = PathBuf::from(os);
        log::warn!("state file {} quarantined: {}", self.path.display(), reason);
        tokio::fs::rename(&self.path, &target).await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn save(&self, state: &PersistentClusterState) -> Result<()> {
        let serialized = serde_json::to_vec_pretty(state)?;

        self.rotate_backups().await?;

        // Write through a temp file so a crash never truncates the primary
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &serialized).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        log::info!(
            "cluster state saved to {} ({} bytes)",
            self.path.display(),
            serialized.len()
        );
        Ok(())
    }

    async fn load(&self) -> Result<Option<PersistentClusterState>> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(None);
        }
        let bytes = tokio::fs::read(&self.path).await?;
        let state: PersistentClusterState = match serde_json::from_slice(&bytes) {
            Ok(state) => state,
            Err(e) => {
                self.quarantine(&format!("parse error: {}", e)).await?;
                return Ok(None);
            }
        };

        if state.version != STATE_SCHEMA_VERSION {
            self.quarantine(&format!("unknown schema version {}", state.version))
                .await?;
            return Ok(None);
        }

        Ok(Some(state))
    }
}

/// Build the configured backend. The `custom` backend is supplied by the
/// embedder (redis deployments implement `StateStore` there).
pub fn make_store(
    config: &PersistenceConfig,
    custom: Option<Arc<dyn StateStore>>,
) -> Result<Arc<dyn StateStore>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "file" => Ok(Arc::new(FileStore::new(
            Path::new(&config.path),
            config.max_backups,
        ))),
        "custom" => custom.ok_or_else(|| {
            Error::Config("custom persistence backend selected but none supplied".to_string())
        }),
        other => Err(Error::Config(format!(
            "Unknown persistence backend: {}",
            other
        ))),
    }
}
