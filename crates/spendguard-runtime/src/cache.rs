//! Response cache for spendguard-runtime.
//!
//! Keeps prior successful results keyed by a request fingerprint so
//! repeated requests, and requests that fall back during an outage, can be
//! served without spending budget.
//!
//! Entries carry their own expiry and are evicted lazily when read past it.
//! When full, moka drops the least-recently-accessed entry to make room.

use chrono::{DateTime, Utc};
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use spendguard_core::{Clock, OperationType};

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries held
    pub max_entries: usize,

    /// TTL applied when a caller does not specify one
    #[serde(with = "crate::config::duration_str")]
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            default_ttl: Duration::from_secs(3600),
        }
    }
}

/// Deterministic key derived from caller, operation and payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a request.
    ///
    /// `serde_json` object maps are key-sorted, so two payloads with the same
    /// fields in a different order hash identically.
    pub fn of(caller_id: &str, operation: OperationType, payload: &serde_json::Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(caller_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(operation.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(payload.to_string().as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cached result with bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub caller_id: String,
    pub operation: OperationType,
    pub payload: serde_json::Value,

    /// What producing this result cost originally
    pub cost: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_count: u64,
    pub last_accessed_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,

    /// Sum of original costs of every entry served from cache
    pub cost_savings: f64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Bounded, expiring cache of successful responses.
///
/// Capacity and least-recently-used eviction are moka's. Expiry is checked
/// against the injected clock so an entry is never served past `expires_at`.
pub struct ResponseCache {
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    cache: Cache<Fingerprint, Arc<Mutex<CacheEntry>>>,
    stats: Mutex<CacheStats>,
    evictions: Arc<AtomicU64>,
}

impl ResponseCache {
    /// Create a new cache with the given configuration.
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));
        let evicted = evictions.clone();
        let cache = Cache::builder()
            .max_capacity(config.max_entries.max(1) as u64)
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(move |fingerprint: Arc<Fingerprint>, _, cause| {
                if cause == RemovalCause::Size {
                    evicted.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(fingerprint = %fingerprint, "Evicted least-recently-used cache entry");
                }
            })
            .build();

        Self {
            clock,
            config,
            cache,
            stats: Mutex::new(CacheStats::default()),
            evictions,
        }
    }

    /// Look up a fingerprint.
    ///
    /// Expired entries are removed on access and reported as a miss.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let now = self.clock.now();
        let Some(slot) = self.cache.get(fingerprint) else {
            self.stats.lock().misses += 1;
            return None;
        };

        let entry = {
            let mut entry = slot.lock();
            if entry.is_expired_at(now) {
                None
            } else {
                entry.access_count += 1;
                entry.last_accessed_at = now;
                Some(entry.clone())
            }
        };

        let mut stats = self.stats.lock();
        match entry {
            Some(entry) => {
                stats.hits += 1;
                stats.cost_savings += entry.cost;
                Some(entry)
            }
            None => {
                stats.expirations += 1;
                stats.misses += 1;
                drop(stats);
                self.cache.invalidate(fingerprint);
                tracing::trace!(fingerprint = %fingerprint, "Cache entry expired on access");
                None
            }
        }
    }

    /// Store a result, evicting the least-recently-accessed entry if full.
    pub fn put(
        &self,
        fingerprint: Fingerprint,
        caller_id: &str,
        operation: OperationType,
        payload: serde_json::Value,
        cost: f64,
        ttl: Option<Duration>,
    ) {
        let now = self.clock.now();
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());

        self.insert(CacheEntry {
            fingerprint,
            caller_id: caller_id.to_string(),
            operation,
            payload,
            cost: cost.max(0.0),
            created_at: now,
            expires_at: now + ttl,
            access_count: 0,
            last_accessed_at: now,
        });
    }

    fn insert(&self, entry: CacheEntry) {
        self.cache
            .insert(entry.fingerprint.clone(), Arc::new(Mutex::new(entry)));
        // Apply size eviction now rather than on a later maintenance pass.
        self.cache.run_pending_tasks();
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<Arc<Fingerprint>> = self
            .cache
            .iter()
            .filter(|(_, slot)| slot.lock().is_expired_at(now))
            .map(|(fingerprint, _)| fingerprint)
            .collect();

        for fingerprint in &expired {
            self.cache.invalidate(fingerprint.as_ref());
        }
        self.cache.run_pending_tasks();
        self.stats.lock().expirations += expired.len() as u64;

        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "Purged expired cache entries");
        }
        expired.len()
    }

    /// Remove one entry.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        self.cache.remove(fingerprint).is_some()
    }

    /// Clear the cache.
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
    }

    pub fn len(&self) -> usize {
        self.cache.run_pending_tasks();
        self.cache.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        let entries = self.len();
        CacheStats {
            entries,
            capacity: self.config.max_entries,
            evictions: self.evictions.load(Ordering::Relaxed),
            ..self.stats.lock().clone()
        }
    }

    /// Live entries, least recently used first.
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        let now = self.clock.now();
        let mut entries: Vec<CacheEntry> = self
            .cache
            .iter()
            .map(|(_, slot)| slot.lock().clone())
            .filter(|entry| !entry.is_expired_at(now))
            .collect();
        entries.sort_by_key(|e| e.last_accessed_at);
        entries
    }

    /// Reload persisted entries, skipping expired ones.
    pub fn restore(&self, mut entries: Vec<CacheEntry>) {
        let now = self.clock.now();
        entries.retain(|e| !e.is_expired_at(now));
        entries.sort_by_key(|e| e.last_accessed_at);

        for entry in entries {
            self.insert(entry);
        }
        tracing::info!(entries = self.len(), "Cache restored from snapshot");
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheConfig::default(), Arc::new(spendguard_core::SystemClock))
    }
}
