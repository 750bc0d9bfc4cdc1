//! Worker auto-scaling decisions
//!
//! The scaler only computes decisions; applying them (spawning or draining
//! workers) is the cluster manager's job. Targets always clamp to the
//! configured bounds and never fire inside the cooldown window.

use crate::config::ScalingConfig;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

/// Signals sampled from the metrics store each evaluation
#[derive(Debug, Clone, Default)]
pub struct ScalingSignals {
    pub cpu_avg: f64,
    pub memory_avg: f64,
    pub p95_response_time_ms: f64,
    pub queue_length: usize,
    pub idle_minutes: f64,
    pub active_workers: usize,
}

/// What the evaluation decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalingDecision {
    ScaleUp {
        from: usize,
        to: usize,
        reason: String,
    },
    ScaleDown {
        from: usize,
        to: usize,
        reason: String,
    },
    NoAction,
}

/// Emitted when an evaluation decides to act
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingTriggered {
    pub reason: String,
    pub current: usize,
    pub target: usize,
}

/// Threshold-driven auto-scaler with cooldown
pub struct AutoScaler {
    config: ScalingConfig,
    last_action: RwLock<Option<Instant>>,
    events: broadcast::Sender<ScalingTriggered>,
}

impl AutoScaler {
    pub fn new(config: ScalingConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            last_action: RwLock::new(None),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScalingTriggered> {
        self.events.subscribe()
    }

    pub fn bounds(&self) -> (usize, usize) {
        (self.config.min_workers, self.config.max_workers)
    }

    /// Evaluate the current signals. Returns `NoAction` inside the
    /// cooldown window regardless of pressure.
    pub async fn evaluate(&self, signals: &ScalingSignals) -> ScalingDecision {
        {
            let last = self.last_action.read().await;
            if let Some(last) = *last {
                if last.elapsed().as_secs() < self.config.cooldown_secs {
                    debug!("scaler inside cooldown window");
                    return ScalingDecision::NoAction;
                }
            }
        }

        let current = signals.active_workers;
        let cfg = &self.config;

        let mut up_reasons = Vec::new();
        if signals.cpu_avg > cfg.cpu_up_threshold {
            up_reasons.push(format!("cpu {:.1}%", signals.cpu_avg));
        }
        if signals.memory_avg > cfg.memory_up_threshold {
            up_reasons.push(format!("memory {:.1}%", signals.memory_avg));
        }
        if signals.p95_response_time_ms > cfg.response_time_threshold_ms {
            up_reasons.push(format!("p95 {:.0}ms", signals.p95_response_time_ms));
        }
        if signals.queue_length > cfg.queue_length_threshold {
            up_reasons.push(format!("queue {}", signals.queue_length));
        }

        if !up_reasons.is_empty() && current < cfg.max_workers {
            let target = (current + cfg.scale_step).min(cfg.max_workers);
            let reason = up_reasons.join(", ");
            info!(current, target, %reason, "scale-up triggered");
            let _ = self.events.send(ScalingTriggered {
                reason: reason.clone(),
                current,
                target,
            });
            return ScalingDecision::ScaleUp {
                from: current,
                to: target,
                reason,
            };
        }

        let calm = signals.cpu_avg < cfg.cpu_down_threshold
            && signals.memory_avg < cfg.memory_down_threshold
            && signals.idle_minutes >= cfg.idle_minutes_threshold as f64;

        if calm && current > cfg.min_workers {
            let target = current
                .saturating_sub(cfg.scale_step)
                .max(cfg.min_workers);
            let reason = format!(
                "cpu {:.1}%, memory {:.1}%, idle {:.0}m",
                signals.cpu_avg, signals.memory_avg, signals.idle_minutes
            );
            info!(current, target, %reason, "scale-down triggered");
            let _ = self.events.send(ScalingTriggered {
                reason: reason.clone(),
                current,
                target,
            });
            return ScalingDecision::ScaleDown {
                from: current,
                to: target,
                reason,
            };
        }

        ScalingDecision::NoAction
    }

    /// Record that the cluster manager finished applying an action; the
    /// cooldown clock starts here.
    pub async fn mark_action_complete(&self) {
        *self.last_action.write().await = Some(Instant::now());
    }

    pub async fn last_action_elapsed_secs(&self) -> Option<u64> {
        self.last_action
            .read()
            .await
            .map(|t| t.elapsed().as_secs())
    }
}
