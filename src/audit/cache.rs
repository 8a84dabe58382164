//! Content-addressed cache of past reviews.
//!
//! Keys are the normalized-code fingerprint qualified by thought number
//! (see `fingerprint`). Recency order is kept by an LRU list; entries are
//! bounded by count and by approximate memory, and expire lazily on access
//! after `max_age_ms`. Linearizable per key: one mutex guards the map,
//! recency order, and stats together, and is never held across an await.

use std::sync::Mutex;
use std::time::Instant;

use lru::LruCache;
use tracing::debug;

use crate::config::CacheConfig;
use crate::models::Review;

/// One cached review with its accounting fields.
#[derive(Debug, Clone)]
pub struct AuditCacheEntry {
    pub code_hash: String,
    pub review: Review,
    pub created_at_ms: i64,
    pub last_accessed_at_ms: i64,
    pub access_count: u64,
    pub size_bytes: usize,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub memory_bytes: usize,
    pub hit_rate: f64,
    pub average_access_time_ms: f64,
}

struct CacheInner {
    entries: LruCache<String, AuditCacheEntry>,
    memory_bytes: usize,
    hits: u64,
    misses: u64,
    total_access_micros: u128,
    total_accesses: u64,
}

pub struct AuditCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl AuditCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                memory_bytes: 0,
                hits: 0,
                misses: 0,
                total_access_micros: 0,
                total_accesses: 0,
            }),
        }
    }

    /// Look up a review by cache key. A hit bumps recency and the access
    /// counters; an entry past its TTL is removed and counted as a miss.
    pub fn get(&self, key: &str) -> Option<Review> {
        let started = Instant::now();
        let now = chrono::Utc::now().timestamp_millis();
        let mut inner = self.inner.lock().expect("cache mutex poisoned");

        let expired = matches!(
            inner.entries.peek(key),
            Some(entry) if now - entry.created_at_ms > self.config.max_age_ms
        );
        if expired {
            if let Some(entry) = inner.entries.pop(key) {
                inner.memory_bytes = inner.memory_bytes.saturating_sub(entry.size_bytes);
                debug!(key, "audit cache entry expired");
            }
        }

        let result = match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed_at_ms = now;
                entry.access_count += 1;
                Some(entry.review.clone())
            }
            None => None,
        };

        match &result {
            Some(_) => inner.hits += 1,
            None => inner.misses += 1,
        }
        inner.total_access_micros += started.elapsed().as_micros();
        inner.total_accesses += 1;

        result
    }

    /// Insert a review, evicting from the LRU end until both the entry
    /// count and the memory budget hold.
    pub fn put(&self, key: String, code_hash: String, review: Review) {
        if self.config.max_entries == 0 || self.config.max_memory_bytes == 0 {
            return;
        }

        let now = chrono::Utc::now().timestamp_millis();
        let size_bytes = key.len() + code_hash.len() + review.size_bytes();
        let entry = AuditCacheEntry {
            code_hash,
            review,
            created_at_ms: now,
            last_accessed_at_ms: now,
            access_count: 0,
            size_bytes,
        };

        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        if let Some(previous) = inner.entries.put(key, entry) {
            inner.memory_bytes = inner.memory_bytes.saturating_sub(previous.size_bytes);
        }
        inner.memory_bytes += size_bytes;

        while inner.entries.len() > self.config.max_entries
            || inner.memory_bytes > self.config.max_memory_bytes
        {
            match inner.entries.pop_lru() {
                Some((evicted_key, evicted)) => {
                    inner.memory_bytes = inner.memory_bytes.saturating_sub(evicted.size_bytes);
                    debug!(key = %evicted_key, "audit cache evicted LRU entry");
                }
                None => break,
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache mutex poisoned");
        let lookups = inner.hits + inner.misses;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            entries: inner.entries.len(),
            memory_bytes: inner.memory_bytes,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
            average_access_time_ms: if inner.total_accesses == 0 {
                0.0
            } else {
                (inner.total_access_micros as f64 / inner.total_accesses as f64) / 1000.0
            },
        }
    }
}
