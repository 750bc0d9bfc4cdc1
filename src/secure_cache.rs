//! Secure at-rest overlay for the smart cache
//!
//! Values are serialised, optionally gzip-deflated, then AES-256-GCM sealed
//! under the cache AAD domain. Auth-tag mismatches surface as
//! `integrity_violation` events and a miss, never as an error to the caller.

use crate::cache::{CacheStats, CacheValue, EvictionStrategy, SmartCache};
use crate::config::SecureCacheConfig;
use crate::crypto::{CipherSuite, SealedPayload, AAD_CACHE};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Security events emitted by the overlay
#[derive(Debug, Clone)]
pub enum SecurityEvent {
    IntegrityViolation { key: String },
    EncryptionFailure { key: String },
    KeyRotation { key_id: u32 },
}

/// How a value was stored
#[derive(Debug, Clone)]
enum StoredPayload {
    /// Small, non-sensitive values may skip encryption entirely
    Plain(Vec<u8>),
    Sealed {
        payload: SealedPayload,
        compressed: bool,
        key_id: u32,
    },
}

/// The unit actually held by the underlying smart cache
#[derive(Debug, Clone)]
struct SealedEntry {
    payload: StoredPayload,
    ttl: Option<Duration>,
}

impl CacheValue for SealedEntry {
    fn size_bytes(&self) -> usize {
        match &self.payload {
            StoredPayload::Plain(bytes) => bytes.len(),
            StoredPayload::Sealed { payload, .. } => payload.ciphertext.len() + 28,
        }
    }
}

struct KeyEpoch {
    current_id: u32,
    current: Arc<CipherSuite>,
    /// Previous epoch kept alive so lazily re-encrypted entries still open
    previous: Option<(u32, Arc<CipherSuite>)>,
}

/// Stats for the overlay: the wrapped cache plus security counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureCacheStats {
    #[serde(flatten)]
    pub cache: CacheStats,
    pub encryption_failures: u64,
    pub integrity_violations: u64,
    pub key_rotations: u64,
    pub current_key_id: u32,
}

/// Encrypting wrapper preserving the smart cache API
pub struct SecureCache {
    inner: Arc<SmartCache<SealedEntry>>,
    keys: RwLock<KeyEpoch>,
    config: SecureCacheConfig,
    encryption_failures: AtomicU64,
    integrity_violations: AtomicU64,
    key_rotations: AtomicU64,
    events: broadcast::Sender<SecurityEvent>,
}

impl SecureCache {
    pub fn new(
        max_entries: usize,
        strategy: EvictionStrategy,
        secret: &SecretString,
        config: SecureCacheConfig,
    ) -> crate::error::Result<Self> {
        let suite = CipherSuite::derive(secret)?;
        let (events, _) = broadcast::channel(64);

        Ok(Self {
            inner: Arc::new(SmartCache::new(max_entries, strategy)),
            keys: RwLock::new(KeyEpoch {
                current_id: 1,
                current: Arc::new(suite),
                previous: None,
            }),
            config,
            encryption_failures: AtomicU64::new(0),
            integrity_violations: AtomicU64::new(0),
            key_rotations: AtomicU64::new(0),
            events,
        })
    }

    /// Subscribe to integrity/rotation events.
    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.events.subscribe()
    }

    /// Store a value. `sensitive=false` allows the small-entry bypass.
    pub async fn set<T: Serialize>(
        &self,
        key: impl Into<String>,
        value: &T,
        ttl: Option<Duration>,
        sensitive: bool,
    ) {
        let key = key.into();
        let serialized = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %key, error = %e, "secure cache set failed to serialize");
                self.inner.record_error();
                return;
            }
        };

        if !sensitive && serialized.len() < self.config.bypass_below_bytes {
            let entry = SealedEntry {
                payload: StoredPayload::Plain(serialized),
                ttl,
            };
            self.inner.set(key, entry, ttl).await;
            return;
        }

        let (body, compressed) = self.maybe_compress(serialized);

        let keys = self.keys.read().await;
        match keys.current.seal(AAD_CACHE, &body) {
            Ok(payload) => {
                let entry = SealedEntry {
                    payload: StoredPayload::Sealed {
                        payload,
                        compressed,
                        key_id: keys.current_id,
                    },
                    ttl,
                };
                drop(keys);
                self.inner.set(key, entry, ttl).await;
            }
            Err(e) => {
                drop(keys);
                self.encryption_failures.fetch_add(1, Ordering::Relaxed);
                let _ = self.events.send(SecurityEvent::EncryptionFailure { key: key.clone() });
                warn!(key = %key, error = %e, "secure cache seal failed");
                self.inner.record_error();
            }
        }
    }

    /// Fetch and unseal a value. Tampered entries are dropped, counted, and
    /// reported as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = self.inner.get(key).await?;

        let (body, key_id, compressed) = match entry.payload {
            StoredPayload::Plain(bytes) => {
                return match serde_json::from_slice(&bytes) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        self.inner.record_error();
                        None
                    }
                };
            }
            StoredPayload::Sealed {
                ref payload,
                compressed,
                key_id,
            } => {
                let suite = self.suite_for(key_id).await;
                let Some(suite) = suite else {
                    // Entry sealed under an epoch we no longer hold
                    self.drop_violation(key).await;
                    return None;
                };
                match suite.open(AAD_CACHE, payload) {
                    Ok(plain) => (plain, key_id, compressed),
                    Err(_) => {
                        self.drop_violation(key).await;
                        return None;
                    }
                }
            }
        };

        let body = if compressed {
            match Self::gunzip(&body) {
                Ok(bytes) => bytes,
                Err(_) => {
                    self.drop_violation(key).await;
                    return None;
                }
            }
        } else {
            body
        };

        // Lazy re-encryption: entries read under a stale epoch are resealed
        // with the current key.
        let current_id = self.keys.read().await.current_id;
        if key_id != current_id {
            self.reseal(key, &body, entry.ttl).await;
        }

        match serde_json::from_slice(&body) {
            Ok(value) => Some(value),
            Err(_) => {
                self.inner.record_error();
                None
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.inner.delete(key).await
    }

    pub async fn clear(&self) {
        self.inner.clear().await;
    }

    pub async fn len(&self) -> usize {
        self.inner.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.is_empty().await
    }

    /// Rotate to a fresh epoch. Hot entries re-encrypt lazily on access.
    pub async fn rotate_keys(&self) -> crate::error::Result<u32> {
        let fresh_secret = SecretString::from(CipherSuite::generate_secret()?);
        let fresh = CipherSuite::derive(&fresh_secret)?;

        let mut keys = self.keys.write().await;
        let old_id = keys.current_id;
        let old = Arc::clone(&keys.current);
        keys.previous = Some((old_id, old));
        keys.current_id += 1;
        keys.current = Arc::new(fresh);
        let new_id = keys.current_id;
        drop(keys);

        self.key_rotations.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(SecurityEvent::KeyRotation { key_id: new_id });
        info!(key_id = new_id, "secure cache key rotated");
        Ok(new_id)
    }

    /// Rotate when the wrapped cache has absorbed enough pressure events.
    pub async fn rotate_if_pressured(&self) -> crate::error::Result<bool> {
        if self.config.rotation_pressure_threshold == 0 {
            return Ok(false);
        }
        let stats = self.inner.stats().await;
        let rotations = self.key_rotations.load(Ordering::Relaxed);
        let due =
            stats.memory_pressure_events >= self.config.rotation_pressure_threshold * (rotations + 1);
        if due {
            self.rotate_keys().await?;
        }
        Ok(due)
    }

    pub async fn stats(&self) -> SecureCacheStats {
        SecureCacheStats {
            cache: self.inner.stats().await,
            encryption_failures: self.encryption_failures.load(Ordering::Relaxed),
            integrity_violations: self.integrity_violations.load(Ordering::Relaxed),
            key_rotations: self.key_rotations.load(Ordering::Relaxed),
            current_key_id: self.keys.read().await.current_id,
        }
    }

    async fn suite_for(&self, key_id: u32) -> Option<Arc<CipherSuite>> {
        let keys = self.keys.read().await;
        if key_id == keys.current_id {
            return Some(Arc::clone(&keys.current));
        }
        match &keys.previous {
            Some((id, suite)) if *id == key_id => Some(Arc::clone(suite)),
            _ => None,
        }
    }

    async fn drop_violation(&self, key: &str) {
        self.integrity_violations.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(SecurityEvent::IntegrityViolation {
            key: key.to_string(),
        });
        self.inner.delete(key).await;
        warn!(key = %key, "secure cache integrity violation");
    }

    async fn reseal(&self, key: &str, body: &[u8], ttl: Option<Duration>) {
        let (compressed_body, compressed) = self.maybe_compress(body.to_vec());
        let keys = self.keys.read().await;
        if let Ok(payload) = keys.current.seal(AAD_CACHE, &compressed_body) {
            let entry = SealedEntry {
                payload: StoredPayload::Sealed {
                    payload,
                    compressed,
                    key_id: keys.current_id,
                },
                ttl,
            };
            drop(keys);
            self.inner.set(key.to_string(), entry, ttl).await;
            debug!(key = %key, "entry resealed under current key");
        }
    }

    fn maybe_compress(&self, bytes: Vec<u8>) -> (Vec<u8>, bool) {
        if bytes.len() <= self.config.compress_above_bytes {
            return (bytes, false);
        }
        match Self::gzip(&bytes) {
            Ok(compressed) if (compressed.len() as f64) < bytes.len() as f64 * 0.9 => {
                (compressed, true)
            }
            _ => (bytes, false),
        }
    }

    fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes)?;
        encoder.finish()
    }

    fn gunzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(bytes);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Scheduled key-rotation task
pub struct RotationSchedule {
    task: JoinHandle<()>,
}

impl RotationSchedule {
    pub fn start(cache: Arc<SecureCache>, interval: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh process
            // does not rotate at startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = cache.rotate_keys().await {
                    warn!(error = %e, "scheduled key rotation failed");
                }
            }
        });
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for RotationSchedule {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secure(config: SecureCacheConfig) -> SecureCache {
        SecureCache::new(
            64,
            EvictionStrategy::Adaptive,
            &SecretString::from("unit-test-secret"),
            config,
        )
        .unwrap()
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        data: Vec<u8>,
    }

    #[tokio::test]
    async fn test_sealed_round_trip() {
        let cache = secure(SecureCacheConfig::default());
        let value = Payload {
            name: "session".to_string(),
            data: vec![7; 512],
        };

        cache.set("k", &value, None, true).await;
        let read: Option<Payload> = cache.get("k").await;
        assert_eq!(read, Some(value));
    }

    #[tokio::test]
    async fn test_large_values_are_compressed() {
        let cache = secure(SecureCacheConfig::default());
        // Highly compressible payload well past the 1 KiB threshold
        let value = "a".repeat(16 * 1024);

        cache.set("big", &value, None, true).await;

        let entry = cache.inner.get("big").await.unwrap();
        match entry.payload {
            StoredPayload::Sealed {
                compressed,
                ref payload,
                ..
            } => {
                assert!(compressed);
                assert!(payload.ciphertext.len() < 16 * 1024);
            }
            _ => panic!("expected sealed payload"),
        }

        let read: Option<String> = cache.get("big").await;
        assert_eq!(read.unwrap().len(), 16 * 1024);
    }

    #[tokio::test]
    async fn test_small_non_sensitive_bypass() {
        let cache = secure(SecureCacheConfig::default());
        cache.set("tiny", &"ok", None, false).await;

        let entry = cache.inner.get("tiny").await.unwrap();
        assert!(matches!(entry.payload, StoredPayload::Plain(_)));

        // Sensitive values never bypass, regardless of size
        cache.set("tiny-secret", &"ok", None, true).await;
        let entry = cache.inner.get("tiny-secret").await.unwrap();
        assert!(matches!(entry.payload, StoredPayload::Sealed { .. }));
    }

    #[tokio::test]
    async fn test_tampered_entry_is_violation_and_miss() {
        let cache = secure(SecureCacheConfig::default());
        cache.set("k", &"value".to_string(), None, true).await;

        // Flip a ciphertext byte in place
        let mut entry = cache.inner.get("k").await.unwrap();
        if let StoredPayload::Sealed { ref mut payload, .. } = entry.payload {
            payload.ciphertext[0] ^= 0xff;
        }
        let ttl = entry.ttl;
        cache.inner.set("k".to_string(), entry, ttl).await;

        let mut events = cache.subscribe();
        let read: Option<String> = cache.get("k").await;
        assert_eq!(read, None);

        let stats = cache.stats().await;
        assert_eq!(stats.integrity_violations, 1);
        assert!(matches!(
            events.try_recv(),
            Ok(SecurityEvent::IntegrityViolation { .. })
        ));

        // The poisoned entry is gone
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_rotation_keeps_old_entries_readable() {
        let cache = secure(SecureCacheConfig::default());
        cache.set("pre", &"value".to_string(), None, true).await;

        let new_id = cache.rotate_keys().await.unwrap();
        assert_eq!(new_id, 2);

        // Old entry opens via the previous epoch and reseals lazily
        let read: Option<String> = cache.get("pre").await;
        assert_eq!(read, Some("value".to_string()));

        let entry = cache.inner.get("pre").await.unwrap();
        match entry.payload {
            StoredPayload::Sealed { key_id, .. } => assert_eq!(key_id, 2),
            _ => panic!("expected sealed payload"),
        }

        let stats = cache.stats().await;
        assert_eq!(stats.key_rotations, 1);
        assert_eq!(stats.current_key_id, 2);
    }
}
