//! Content-addressed embedding cache.
//!
//! [`EmbeddingCache`] stores embedding vectors keyed by the SHA-256 digest of
//! the input text, so identical text maps to the same key across process
//! restarts. Embeddings are deterministic (same model + text → same vector),
//! which makes them safe to reuse; chat responses are never cached.
//!
//! # Eviction
//!
//! Three mechanisms, applied in this order:
//!
//! 1. **TTL**: checked lazily on read. An expired entry is removed and the
//!    read counts as a miss. [`EmbeddingCache::evict_expired`] sweeps eagerly.
//! 2. **Capacity**: inserting a new key into a full cache evicts the single
//!    least-recently-used entry first.
//! 3. **Memory budget** (optional): after an insert, LRU entries are evicted
//!    until the estimated footprint fits under `max_memory_bytes`.
//!
//! A hit promotes the entry to most-recently-used.
//!
//! # Locking
//!
//! One coarse `parking_lot::Mutex` guards all state. Every operation is a
//! handful of map updates, so callers on async runtimes can use the cache
//! directly without suspending. Persistence I/O ([`store`]) runs on a
//! snapshot taken under the lock, never while holding it.

pub mod store;

pub use store::{CacheStore, JsonSnapshotStore};
#[cfg(feature = "sqlite")]
pub use store::SqliteStore;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::telemetry;
use crate::{HuginnError, Result};

/// Fixed per-entry bookkeeping cost added to the memory estimate.
pub const ENTRY_OVERHEAD_BYTES: usize = 96;

/// Configuration for the embedding cache.
///
/// ```rust
/// # use huginn::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .max_entries(5_000)
///     .ttl(Duration::from_secs(3600))
///     .max_memory_bytes(64 * 1024 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached entries. Default: 10,000.
    pub max_entries: usize,
    /// Time-to-live for cached entries. Default: 24 hours.
    #[serde(rename = "ttl_secs", with = "secs")]
    pub ttl: Duration,
    /// Optional cap on the estimated footprint in bytes. Default: none.
    pub max_memory_bytes: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl: Duration::from_secs(24 * 3600),
            max_memory_bytes: None,
        }
    }
}

impl CacheConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of cached entries.
    pub fn max_entries(mut self, n: usize) -> Self {
        self.max_entries = n;
        self
    }

    /// Set the time-to-live for cached entries.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Cap the estimated memory footprint.
    pub fn max_memory_bytes(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = Some(bytes);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(HuginnError::Configuration(
                "cache max_entries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// One cached embedding, in the shape shared by every persistence backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Hex SHA-256 of the input text.
    pub key: String,
    pub vector: Vec<f32>,
    pub inserted_at: DateTime<Utc>,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub memory_bytes: usize,
}

/// Derive the content-addressed key for `text`.
pub fn content_key(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Estimated footprint of one entry.
fn entry_bytes(key: &str, vector: &[f32]) -> usize {
    std::mem::size_of_val(vector) + key.len() + ENTRY_OVERHEAD_BYTES
}

struct Slot {
    vector: Vec<f32>,
    inserted_at: DateTime<Utc>,
    tick: u64,
    bytes: usize,
}

#[derive(Clone, Copy)]
enum EvictReason {
    Ttl,
    Capacity,
    Memory,
}

impl EvictReason {
    fn label(self) -> &'static str {
        match self {
            EvictReason::Ttl => "ttl",
            EvictReason::Capacity => "capacity",
            EvictReason::Memory => "memory",
        }
    }
}

#[derive(Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    /// Recency index: lowest tick is least recently used.
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    memory_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn touch(&mut self, key: &str) {
        let tick = self.bump();
        if let Some(slot) = self.slots.get_mut(key) {
            self.recency.remove(&slot.tick);
            slot.tick = tick;
            self.recency.insert(tick, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<Slot> {
        let slot = self.slots.remove(key)?;
        self.recency.remove(&slot.tick);
        self.memory_bytes -= slot.bytes;
        Some(slot)
    }

    fn evict(&mut self, key: &str, reason: EvictReason) {
        if self.remove(key).is_some() {
            self.evictions += 1;
            metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL, "reason" => reason.label())
                .increment(1);
        }
    }

    fn evict_lru(&mut self, reason: EvictReason) -> bool {
        let Some((_, key)) = self.recency.first_key_value() else {
            return false;
        };
        let key = key.clone();
        self.evict(&key, reason);
        true
    }

    fn insert(&mut self, key: String, vector: Vec<f32>, inserted_at: DateTime<Utc>) {
        let tick = self.bump();
        let bytes = entry_bytes(&key, &vector);
        self.memory_bytes += bytes;
        self.recency.insert(tick, key.clone());
        self.slots.insert(
            key,
            Slot {
                vector,
                inserted_at,
                tick,
                bytes,
            },
        );
    }
}

/// Thread-safe LRU + TTL embedding cache.
///
/// Share across clients by wrapping in an `Arc` and handing it to each
/// [`InferenceClientBuilder::cache`](crate::InferenceClientBuilder::cache).
pub struct EmbeddingCache {
    config: CacheConfig,
    ttl: Option<TimeDelta>,
    inner: Mutex<Inner>,
}

impl EmbeddingCache {
    /// Create an empty cache.
    ///
    /// Fails if `max_entries` is zero.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        // A TTL too large for chrono means entries never expire.
        let ttl = TimeDelta::from_std(config.ttl).ok();
        Ok(Self {
            config,
            ttl,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn is_expired(&self, inserted_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.ttl.is_some_and(|ttl| now - inserted_at >= ttl)
    }

    /// Look up the vector for `text`.
    ///
    /// Expired entries are removed and reported as a miss. A hit promotes
    /// the entry to most-recently-used.
    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        let key = content_key(text);
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let state = inner
            .slots
            .get(&key)
            .map(|slot| self.is_expired(slot.inserted_at, now));
        match state {
            Some(false) => {
                inner.hits += 1;
                inner.touch(&key);
                metrics::counter!(telemetry::CACHE_HITS_TOTAL).increment(1);
                inner.slots.get(&key).map(|slot| slot.vector.clone())
            }
            Some(true) => {
                inner.evict(&key, EvictReason::Ttl);
                inner.misses += 1;
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
                None
            }
            None => {
                inner.misses += 1;
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
                None
            }
        }
    }

    /// Insert (or replace) the vector for `text`.
    pub fn put(&self, text: &str, vector: Vec<f32>) {
        self.put_keyed(content_key(text), vector, Utc::now());
    }

    fn put_keyed(&self, key: String, vector: Vec<f32>, inserted_at: DateTime<Utc>) {
        let mut inner = self.inner.lock();

        if inner.remove(&key).is_none() {
            while inner.slots.len() >= self.config.max_entries {
                if !inner.evict_lru(EvictReason::Capacity) {
                    break;
                }
            }
        }
        inner.insert(key, vector, inserted_at);

        if let Some(budget) = self.config.max_memory_bytes {
            while inner.memory_bytes > budget {
                if !inner.evict_lru(EvictReason::Memory) {
                    break;
                }
            }
        }
    }

    /// Look up several texts at once, preserving order.
    pub fn get_batch(&self, texts: &[&str]) -> Vec<Option<Vec<f32>>> {
        texts.iter().map(|text| self.get(text)).collect()
    }

    /// Insert several vectors at once.
    ///
    /// `texts` and `vectors` correspond positionally; extra items on either
    /// side are ignored.
    pub fn put_batch(&self, texts: &[&str], vectors: &[Vec<f32>]) {
        for (text, vector) in texts.iter().zip(vectors) {
            self.put(text, vector.clone());
        }
    }

    /// Whether a live entry exists for `text`. Does not promote.
    pub fn contains(&self, text: &str) -> bool {
        let key = content_key(text);
        let now = Utc::now();
        let inner = self.inner.lock();
        inner
            .slots
            .get(&key)
            .is_some_and(|slot| !self.is_expired(slot.inserted_at, now))
    }

    /// Remove every expired entry, returning how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .slots
            .iter()
            .filter(|(_, slot)| self.is_expired(slot.inserted_at, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.evict(key, EvictReason::Ttl);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "evicted expired embeddings");
        }
        expired.len()
    }

    /// Drop every entry. Hit/miss counters are kept.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.slots.clear();
        inner.recency.clear();
        inner.memory_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            size: inner.slots.len(),
            memory_bytes: inner.memory_bytes,
        }
    }

    /// Copy out every live entry, least recently used first.
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        let now = Utc::now();
        let inner = self.inner.lock();
        inner
            .recency
            .values()
            .filter_map(|key| {
                let slot = inner.slots.get(key)?;
                (!self.is_expired(slot.inserted_at, now)).then(|| CacheEntry {
                    key: key.clone(),
                    vector: slot.vector.clone(),
                    inserted_at: slot.inserted_at,
                })
            })
            .collect()
    }

    /// Load persisted entries.
    ///
    /// Expired entries are skipped; the newest `max_entries` survive and the
    /// newest becomes most-recently-used. Returns the number restored.
    pub fn restore(&self, mut entries: Vec<CacheEntry>) -> usize {
        let now = Utc::now();
        entries.retain(|e| !self.is_expired(e.inserted_at, now));
        entries.sort_by(|a, b| b.inserted_at.cmp(&a.inserted_at));
        entries.truncate(self.config.max_entries);

        let count = entries.len();
        for entry in entries.into_iter().rev() {
            self.put_keyed(entry.key, entry.vector, entry.inserted_at);
        }
        count
    }

    /// Persist a snapshot to `store`.
    pub async fn save_to(&self, store: &dyn CacheStore) -> Result<usize> {
        let entries = self.snapshot();
        store.save(&entries).await?;
        Ok(entries.len())
    }

    /// Restore from `store`.
    ///
    /// Persistence failures are logged and treated as an empty store, so a
    /// corrupt or unreadable cache file never blocks startup.
    pub async fn load_from(&self, store: &dyn CacheStore) -> usize {
        match store.load().await {
            Ok(entries) => {
                let restored = self.restore(entries);
                debug!(restored, "restored embedding cache");
                restored
            }
            Err(e) => {
                warn!(error = %e, "failed to load embedding cache, starting empty");
                0
            }
        }
    }
}

/// Reassemble batch output from cached hits and backend results for misses.
///
/// `results` must hold exactly one vector per `None` in `cached`, in order.
pub(crate) fn merge_batch_results(
    cached: Vec<Option<Vec<f32>>>,
    results: Vec<Vec<f32>>,
) -> Result<Vec<Vec<f32>>> {
    let expected = cached.iter().filter(|c| c.is_none()).count();
    if results.len() != expected {
        return Err(HuginnError::MalformedResponse(format!(
            "expected {expected} embeddings, got {}",
            results.len()
        )));
    }
    let mut result_iter = results.into_iter();
    Ok(cached
        .into_iter()
        .map(|opt| opt.or_else(|| result_iter.next()).unwrap_or_default())
        .collect())
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
