//! Smart in-process cache with TTL and adaptive eviction
//!
//! Single-owner design: all entry state lives behind one lock, stats are
//! atomics updated alongside it. `get`/`set` never panic and never return an
//! error; internal failures degrade to a miss and bump the error counter.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Values stored in the cache report their approximate footprint so the
/// adaptive strategy and the memory accounting stay honest.
pub trait CacheValue: Clone + Send + Sync + 'static {
    fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

impl CacheValue for String {
    fn size_bytes(&self) -> usize {
        self.len()
    }
}

impl CacheValue for Vec<u8> {
    fn size_bytes(&self) -> usize {
        self.len()
    }
}

impl CacheValue for serde_json::Value {
    fn size_bytes(&self) -> usize {
        // Close enough for accounting; exact wire size is not needed here.
        self.to_string().len()
    }
}

/// Eviction strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    Lru,
    Lfu,
    Adaptive,
}

impl EvictionStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lru" => Some(Self::Lru),
            "lfu" => Some(Self::Lfu),
            "adaptive" => Some(Self::Adaptive),
            _ => None,
        }
    }
}

/// Memory pressure levels reported by the host process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    Low,
    Medium,
    High,
}

impl MemoryPressure {
    fn eviction_fraction(self) -> f64 {
        match self {
            MemoryPressure::Low => 0.10,
            MemoryPressure::Medium => 0.25,
            MemoryPressure::High => 0.50,
        }
    }
}

/// One cached entry with its bookkeeping
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    last_accessed_at: Instant,
    access_count: u64,
    frequency: u64,
    ttl: Option<Duration>,
    size_bytes: usize,
    priority_score: f64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.duration_since(self.created_at) > ttl,
            None => false,
        }
    }

    fn recency(&self, now: Instant) -> f64 {
        1.0 / (1.0 + now.duration_since(self.last_accessed_at).as_secs_f64())
    }

    fn composite_priority(&self, now: Instant) -> f64 {
        let size_weight = (self.size_bytes as f64 / 10_000.0).max(1.0);
        (self.frequency as f64 * 0.4 + self.recency(now) * 0.4) / size_weight * 0.2
            + self.priority_score * 0.1
    }
}

/// Item for `warm_cache`
#[derive(Debug, Clone)]
pub struct WarmItem<V> {
    pub key: String,
    pub value: V,
    pub priority: f64,
}

/// Prediction for `preload_predicted`
#[derive(Debug, Clone)]
pub struct AccessPrediction {
    pub key: String,
    pub probability: f64,
}

/// Snapshot of process metrics driving strategy adaptation
#[derive(Debug, Clone, Copy)]
pub struct AdaptationMetrics {
    /// 0.0 - 1.0
    pub memory_usage: f64,
    /// 0.0 - 1.0
    pub cpu_usage: f64,
    /// requests per second, informational
    pub request_rate: f64,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    adaptations: AtomicU64,
    memory_pressure_events: AtomicU64,
    error_events: AtomicU64,
}

struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Priority hints recorded by preload prediction, consumed on insert
    priority_hints: HashMap<String, f64>,
    memory_usage: usize,
    strategy: EvictionStrategy,
    last_adaptation: Option<Instant>,
    insertion_seq: u64,
    insertion_order: HashMap<String, u64>,
}

/// Smart cache with TTL, pluggable eviction, and memory-pressure response
pub struct SmartCache<V: CacheValue> {
    inner: RwLock<CacheInner<V>>,
    counters: CacheCounters,
    max_entries: usize,
    max_memory_bytes: usize,
    min_adaptation_gap: Duration,
}

/// Reported cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub max_size: usize,
    pub hit_rate: f64,
    pub utilization_rate: f64,
    pub memory_usage: usize,
    pub average_entry_size: f64,
    pub top_frequent_keys: Vec<(String, u64)>,
    pub adaptations: u64,
    pub memory_pressure_events: u64,
    pub error_events: u64,
    pub strategy: EvictionStrategy,
}

impl<V: CacheValue> SmartCache<V> {
    pub fn new(max_entries: usize, strategy: EvictionStrategy) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                entries: HashMap::new(),
                priority_hints: HashMap::new(),
                memory_usage: 0,
                strategy,
                last_adaptation: None,
                insertion_seq: 0,
                insertion_order: HashMap::new(),
            }),
            counters: CacheCounters::default(),
            max_entries,
            max_memory_bytes: 0,
            min_adaptation_gap: Duration::from_secs(30),
        }
    }

    pub fn with_memory_limit(mut self, max_memory_bytes: usize) -> Self {
        self.max_memory_bytes = max_memory_bytes;
        self
    }

    pub fn from_config(config: &crate::config::CacheConfig) -> Self {
        let strategy =
            EvictionStrategy::parse(&config.strategy).unwrap_or(EvictionStrategy::Adaptive);
        Self::new(config.max_entries, strategy).with_memory_limit(config.max_memory_bytes)
    }

    /// Look up a key. Expired entries are removed, counted as one eviction
    /// and a miss.
    pub async fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;

        let expired = match inner.entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            if let Some(removed) = inner.entries.remove(key) {
                inner.memory_usage = inner.memory_usage.saturating_sub(removed.size_bytes);
            }
            inner.insertion_order.remove(key);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        if let Some(entry) = inner.entries.get_mut(key) {
            entry.last_accessed_at = now;
            entry.access_count += 1;
            entry.frequency += 1;
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            Some(entry.value.clone())
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Insert a value; at capacity with an absent key, evict one victim
    /// first. Capacity 0 makes every `set` a no-op.
    pub async fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        if self.max_entries == 0 {
            return;
        }

        let key = key.into();
        let now = Instant::now();
        let size_bytes = value.size_bytes();
        let mut inner = self.inner.write().await;

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_entries {
            self.evict_locked(&mut inner, 1, now);
        }

        let existing_priority = inner.priority_hints.remove(&key).unwrap_or(0.0);

        if let Some(old) = inner.entries.remove(&key) {
            inner.memory_usage = inner.memory_usage.saturating_sub(old.size_bytes);
        }

        let mut entry = CacheEntry {
            value,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            frequency: 1,
            ttl,
            size_bytes,
            priority_score: existing_priority,
        };
        entry.priority_score = entry.composite_priority(now).max(existing_priority);

        inner.memory_usage += size_bytes;
        inner.insertion_seq += 1;
        let seq = inner.insertion_seq;
        inner.insertion_order.insert(key.clone(), seq);
        inner.entries.insert(key, entry);
    }

    /// Remove a key from every index.
    pub async fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.write().await;
        inner.priority_hints.remove(key);
        inner.insertion_order.remove(key);
        match inner.entries.remove(key) {
            Some(entry) => {
                inner.memory_usage = inner.memory_usage.saturating_sub(entry.size_bytes);
                true
            }
            None => false,
        }
    }

    /// Drop every entry and hint atomically. Counters survive a clear.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.priority_hints.clear();
        inner.insertion_order.clear();
        inner.memory_usage = 0;
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    pub async fn strategy(&self) -> EvictionStrategy {
        self.inner.read().await.strategy
    }

    /// Insert the highest-priority warm items, capped at 30% of capacity.
    /// Keys that are present and unexpired are left alone.
    pub async fn warm_cache(&self, mut items: Vec<WarmItem<V>>) {
        if self.max_entries == 0 {
            return;
        }

        let budget = (self.max_entries as f64 * 0.30).floor() as usize;
        items.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let now = Instant::now();
        let mut inserted = 0usize;
        for item in items {
            if inserted >= budget {
                break;
            }
            let occupied = {
                let inner = self.inner.read().await;
                inner
                    .entries
                    .get(&item.key)
                    .map(|e| !e.is_expired(now))
                    .unwrap_or(false)
            };
            if occupied {
                continue;
            }
            {
                let mut inner = self.inner.write().await;
                inner.priority_hints.insert(item.key.clone(), item.priority);
            }
            self.set(item.key, item.value, None).await;
            inserted += 1;
        }

        debug!(inserted, budget, "cache warm-up complete");
    }

    /// Record priority hints for keys predicted to be accessed soon.
    /// Only predictions above 0.7 count, capped at 10% of capacity.
    pub async fn preload_predicted(&self, predictions: Vec<AccessPrediction>) {
        let budget = (self.max_entries as f64 * 0.10).floor() as usize;
        let mut inner = self.inner.write().await;

        let mut recorded = 0usize;
        for prediction in predictions {
            if recorded >= budget {
                break;
            }
            if prediction.probability > 0.7 {
                inner
                    .priority_hints
                    .insert(prediction.key, prediction.probability);
                recorded += 1;
            }
        }
    }

    /// Re-evaluate the eviction strategy against process metrics. At most
    /// one adaptation per 30 s.
    pub async fn adapt_strategy(&self, metrics: AdaptationMetrics) -> Option<EvictionStrategy> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;

        if let Some(last) = inner.last_adaptation {
            if now.duration_since(last) < self.min_adaptation_gap {
                return None;
            }
        }

        let hit_rate = self.hit_rate();
        let target = if metrics.memory_usage > 0.9 {
            EvictionStrategy::Lru
        } else if hit_rate < 0.4 && metrics.memory_usage < 0.7 {
            EvictionStrategy::Lfu
        } else if hit_rate > 0.8 && metrics.memory_usage > 0.8 {
            EvictionStrategy::Lru
        } else {
            EvictionStrategy::Adaptive
        };

        inner.last_adaptation = Some(now);
        if target != inner.strategy {
            debug!(?target, hit_rate, mem = metrics.memory_usage, "cache strategy adapted");
            inner.strategy = target;
            self.counters.adaptations.fetch_add(1, Ordering::Relaxed);
            Some(target)
        } else {
            None
        }
    }

    /// Shed load under memory pressure: evict a fraction of entries plus
    /// everything expired.
    pub async fn handle_memory_pressure(&self, level: MemoryPressure) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write().await;

        self.counters
            .memory_pressure_events
            .fetch_add(1, Ordering::Relaxed);

        let expired = self.sweep_expired_locked(&mut inner, now);
        let count = (inner.entries.len() as f64 * level.eviction_fraction()).ceil() as usize;
        let evicted = self.evict_locked(&mut inner, count, now);

        warn!(
            ?level,
            evicted,
            expired,
            remaining = inner.entries.len(),
            "cache responded to memory pressure"
        );
        evicted + expired
    }

    /// Remove everything past its TTL. Used by the background sweeper.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        self.sweep_expired_locked(&mut inner, now)
    }

    /// Periodic memory check: degrade to pressure handling when over budget.
    pub async fn check_memory(&self) {
        if self.max_memory_bytes == 0 {
            return;
        }
        let usage = self.inner.read().await.memory_usage;
        let ratio = usage as f64 / self.max_memory_bytes as f64;
        if ratio > 1.0 {
            self.handle_memory_pressure(MemoryPressure::High).await;
        } else if ratio > 0.9 {
            self.handle_memory_pressure(MemoryPressure::Medium).await;
        } else if ratio > 0.8 {
            self.handle_memory_pressure(MemoryPressure::Low).await;
        }
    }

    /// Record an internal failure; the caller has already degraded to a
    /// miss or no-op.
    pub fn record_error(&self) {
        self.counters.error_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.read().await;

        let mut by_frequency: Vec<(String, u64)> = inner
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.frequency))
            .collect();
        by_frequency.sort_by(|a, b| b.1.cmp(&a.1));
        by_frequency.truncate(5);

        let size = inner.entries.len();
        let average_entry_size = if size > 0 {
            inner.memory_usage as f64 / size as f64
        } else {
            0.0
        };

        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            size,
            max_size: self.max_entries,
            hit_rate: self.hit_rate(),
            utilization_rate: if self.max_entries > 0 {
                size as f64 / self.max_entries as f64
            } else {
                0.0
            },
            memory_usage: inner.memory_usage,
            average_entry_size,
            top_frequent_keys: by_frequency,
            adaptations: self.counters.adaptations.load(Ordering::Relaxed),
            memory_pressure_events: self
                .counters
                .memory_pressure_events
                .load(Ordering::Relaxed),
            error_events: self.counters.error_events.load(Ordering::Relaxed),
            strategy: inner.strategy,
        }
    }

    fn sweep_expired_locked(&self, inner: &mut CacheInner<V>, now: Instant) -> usize {
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = inner.entries.remove(key) {
                inner.memory_usage = inner.memory_usage.saturating_sub(entry.size_bytes);
            }
            inner.insertion_order.remove(key);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        expired.len()
    }

    fn evict_locked(&self, inner: &mut CacheInner<V>, count: usize, now: Instant) -> usize {
        if count == 0 || inner.entries.is_empty() {
            return 0;
        }

        let mut candidates: Vec<(String, f64, Instant, u64)> = match inner.strategy {
            EvictionStrategy::Lru => inner
                .entries
                .iter()
                .map(|(k, e)| {
                    let order = inner.insertion_order.get(k).copied().unwrap_or(0);
                    (
                        k.clone(),
                        now.duration_since(e.last_accessed_at).as_secs_f64(),
                        e.last_accessed_at,
                        order,
                    )
                })
                .collect(),
            EvictionStrategy::Lfu => inner
                .entries
                .iter()
                .map(|(k, e)| {
                    let order = inner.insertion_order.get(k).copied().unwrap_or(0);
                    (k.clone(), e.frequency as f64, e.last_accessed_at, order)
                })
                .collect(),
            EvictionStrategy::Adaptive => inner
                .entries
                .iter()
                .map(|(k, e)| {
                    let order = inner.insertion_order.get(k).copied().unwrap_or(0);
                    (k.clone(), e.composite_priority(now), e.last_accessed_at, order)
                })
                .collect(),
        };

        match inner.strategy {
            // LRU evicts the entries idle longest, so sort idle time descending
            EvictionStrategy::Lru => candidates.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.3.cmp(&b.3))
            }),
            // LFU and Adaptive evict ascending score; ties go to the entry
            // accessed longer ago, then the older insertion
            _ => candidates.sort_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.2.cmp(&b.2))
                    .then(a.3.cmp(&b.3))
            }),
        }

        let mut evicted = 0usize;
        for (key, _, _, _) in candidates.into_iter().take(count) {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.memory_usage = inner.memory_usage.saturating_sub(entry.size_bytes);
            }
            inner.insertion_order.remove(&key);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            evicted += 1;
        }
        evicted
    }
}

/// Handle owning the background sweep/memory tasks; aborting it stops them.
pub struct CacheMaintenance {
    tasks: Vec<JoinHandle<()>>,
}

impl CacheMaintenance {
    /// Spawn the expired sweep (60 s) and memory check (30 s) loops.
    pub fn start<V: CacheValue>(
        cache: Arc<SmartCache<V>>,
        cleanup_interval: Duration,
        memory_interval: Duration,
    ) -> Self {
        let sweep_cache = Arc::clone(&cache);
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let removed = sweep_cache.sweep_expired().await;
                if removed > 0 {
                    debug!(removed, "expired cache entries swept");
                }
            }
        });

        let memory_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(memory_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                cache.check_memory().await;
            }
        });

        Self {
            tasks: vec![sweeper, memory_task],
        }
    }

    pub fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for CacheMaintenance {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize, strategy: EvictionStrategy) -> SmartCache<String> {
        SmartCache::new(capacity, strategy)
    }

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let cache = cache(10, EvictionStrategy::Lru);
        cache.set("alpha", "one".to_string(), None).await;
        assert_eq!(cache.get("alpha").await, Some("one".to_string()));
    }

    #[tokio::test]
    async fn test_expired_entry_returns_none_and_counts_eviction() {
        let cache = cache(10, EvictionStrategy::Lru);
        cache
            .set("short", "lived".to_string(), Some(Duration::from_millis(10)))
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(cache.get("short").await, None);
        let stats = cache.stats().await;
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test]
    async fn test_zero_capacity_set_is_noop() {
        let cache = cache(0, EvictionStrategy::Lru);
        cache.set("k", "v".to_string(), None).await;
        assert_eq!(cache.get("k").await, None);
        let stats = cache.stats().await;
        assert_eq!(stats.size, 0);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_lru_evicts_least_recently_used() {
        let cache = cache(2, EvictionStrategy::Lru);
        cache.set("a", "1".to_string(), None).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.set("b", "2".to_string(), None).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Touch "a" so "b" becomes the LRU victim
        cache.get("a").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.set("c", "3".to_string(), None).await;

        assert!(cache.get("a").await.is_some());
        assert!(cache.get("b").await.is_none());
        assert!(cache.get("c").await.is_some());
    }

    #[tokio::test]
    async fn test_lfu_evicts_lowest_frequency() {
        let cache = cache(2, EvictionStrategy::Lfu);
        cache.set("hot", "x".to_string(), None).await;
        cache.set("cold", "y".to_string(), None).await;
        for _ in 0..5 {
            cache.get("hot").await;
        }

        cache.set("new", "z".to_string(), None).await;
        assert!(cache.get("hot").await.is_some());
        assert!(cache.get("cold").await.is_none());
    }

    #[tokio::test]
    async fn test_adaptive_eviction_prefers_low_composite_priority() {
        // Capacity 3, equal sizes; A gains frequency, B and C stay cold.
        // Inserting D must evict B (lowest composite, older than C).
        let cache = cache(3, EvictionStrategy::Adaptive);
        cache.set("a", "x".repeat(100), None).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.set("b", "x".repeat(100), None).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.set("c", "x".repeat(100), None).await;

        for _ in 0..4 {
            cache.get("a").await;
        }

        cache.set("d", "x".repeat(100), None).await;

        assert!(cache.get("a").await.is_some());
        assert!(cache.get("b").await.is_none());
        assert!(cache.get("c").await.is_some());
        assert!(cache.get("d").await.is_some());
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let cache = cache(10, EvictionStrategy::Lru);
        cache.set("a", "1".to_string(), None).await;
        cache.set("b", "2".to_string(), None).await;

        assert!(cache.delete("a").await);
        assert!(!cache.delete("a").await);

        cache.clear().await;
        assert_eq!(cache.len().await, 0);
        let stats = cache.stats().await;
        assert_eq!(stats.memory_usage, 0);
    }

    #[tokio::test]
    async fn test_warm_cache_caps_at_thirty_percent() {
        let cache = cache(10, EvictionStrategy::Lru);
        let items: Vec<WarmItem<String>> = (0..10)
            .map(|i| WarmItem {
                key: format!("warm-{}", i),
                value: "v".to_string(),
                priority: i as f64,
            })
            .collect();

        cache.warm_cache(items).await;
        assert_eq!(cache.len().await, 3);

        // The highest priorities must be the ones kept
        assert!(cache.get("warm-9").await.is_some());
        assert!(cache.get("warm-7").await.is_some());
        assert!(cache.get("warm-0").await.is_none());
    }

    #[tokio::test]
    async fn test_warm_cache_skips_live_entries() {
        let cache = cache(10, EvictionStrategy::Lru);
        cache.set("present", "original".to_string(), None).await;

        cache
            .warm_cache(vec![WarmItem {
                key: "present".to_string(),
                value: "warmed".to_string(),
                priority: 10.0,
            }])
            .await;

        assert_eq!(cache.get("present").await, Some("original".to_string()));
    }

    #[tokio::test]
    async fn test_preload_predicted_filters_and_caps() {
        let cache = cache(20, EvictionStrategy::Adaptive);
        let mut predictions: Vec<AccessPrediction> = (0..10)
            .map(|i| AccessPrediction {
                key: format!("p-{}", i),
                probability: 0.95,
            })
            .collect();
        predictions.push(AccessPrediction {
            key: "unlikely".to_string(),
            probability: 0.5,
        });

        cache.preload_predicted(predictions).await;

        let inner = cache.inner.read().await;
        // 10% of 20 = 2 hints, low-probability key never recorded
        assert_eq!(inner.priority_hints.len(), 2);
        assert!(!inner.priority_hints.contains_key("unlikely"));
    }

    #[tokio::test]
    async fn test_adapt_strategy_rules_and_throttle() {
        let cache = cache(10, EvictionStrategy::Adaptive);

        // No traffic yet: hit rate 0 (<0.4) and low memory selects LFU
        let switched = cache
            .adapt_strategy(AdaptationMetrics {
                memory_usage: 0.5,
                cpu_usage: 0.2,
                request_rate: 10.0,
            })
            .await;
        assert_eq!(switched, Some(EvictionStrategy::Lfu));

        // Second adaptation inside the 30 s window is ignored
        let second = cache
            .adapt_strategy(AdaptationMetrics {
                memory_usage: 0.95,
                cpu_usage: 0.2,
                request_rate: 10.0,
            })
            .await;
        assert_eq!(second, None);
        assert_eq!(cache.strategy().await, EvictionStrategy::Lfu);
    }

    #[tokio::test]
    async fn test_memory_pressure_evicts_fraction() {
        let cache = cache(100, EvictionStrategy::Lru);
        for i in 0..100 {
            cache.set(format!("k-{}", i), "v".to_string(), None).await;
        }

        let removed = cache.handle_memory_pressure(MemoryPressure::Medium).await;
        assert_eq!(removed, 25);
        assert_eq!(cache.len().await, 75);

        let stats = cache.stats().await;
        assert_eq!(stats.memory_pressure_events, 1);
    }

    #[tokio::test]
    async fn test_concurrent_access_keeps_accounting_consistent() {
        let cache = Arc::new(SmartCache::<String>::new(64, EvictionStrategy::Adaptive));

        let writers = (0..32).map(|i| {
            let cache = Arc::clone(&cache);
            async move {
                cache.set(format!("k-{}", i), "v".repeat(16), None).await;
                cache.get(&format!("k-{}", i)).await
            }
        });
        let results = futures::future::join_all(writers).await;

        assert!(results.iter().all(|r| r.is_some()));
        let stats = cache.stats().await;
        assert_eq!(stats.size, 32);
        assert_eq!(stats.memory_usage, 32 * 16);
        assert_eq!(stats.hits, 32);
    }

    #[tokio::test]
    async fn test_stats_top_frequent_keys() {
        let cache = cache(10, EvictionStrategy::Lfu);
        cache.set("popular", "v".to_string(), None).await;
        cache.set("quiet", "v".to_string(), None).await;
        for _ in 0..3 {
            cache.get("popular").await;
        }

        let stats = cache.stats().await;
        assert_eq!(stats.top_frequent_keys.first().unwrap().0, "popular");
        assert!(stats.hit_rate > 0.0);
        assert_eq!(stats.size, 2);
    }
}
