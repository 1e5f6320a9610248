//! In-memory fallback cache with TTL and bounded capacity.
//!
//! Backed by a sharded map so operations on different keys never block
//! each other. When the cache is at capacity and a new key arrives, the
//! entry written least recently is evicted; expired entries are preferred
//! victims and are otherwise dropped lazily on read.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::catalog::Catalog;

/// Default maximum number of cached catalogs before eviction.
const DEFAULT_CAPACITY: usize = 1000;

struct MemEntry {
    catalog: Arc<Catalog>,
    expires_at: Instant,
    /// Monotonic write stamp, used for least-recently-written eviction.
    written: u64,
}

impl MemEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Process-local catalog cache. Serves alone when the durable backend is
/// disabled or its circuit breaker is open.
pub struct MemoryCache {
    entries: DashMap<String, MemEntry>,
    capacity: usize,
    write_counter: AtomicU64,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            write_counter: AtomicU64::new(0),
        }
    }

    /// Fetch a fresh entry. An expired entry is removed on the spot and
    /// reported as a miss.
    pub fn get(&self, key: &str) -> Option<Arc<Catalog>> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.is_expired() => true,
            Some(entry) => return Some(Arc::clone(&entry.catalog)),
            None => return None,
        };
        if expired {
            // The read guard is released above; removal must not run
            // while this thread still holds the shard lock.
            self.entries.remove_if(key, |_, e| e.is_expired());
        }
        None
    }

    /// Store a catalog under the key. Overwriting refreshes both the TTL
    /// and the entry's write position.
    pub fn put(&self, key: &str, catalog: Arc<Catalog>, ttl: Duration) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(key) {
            self.evict_one();
        }
        let written = self.write_counter.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            key.to_string(),
            MemEntry {
                catalog,
                expires_at: Instant::now() + ttl,
                written,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry whose key matches the glob pattern (`*` matches
    /// any run, `?` a single character). Returns how many were removed.
    pub fn clear_pattern(&self, pattern: &str) -> usize {
        if pattern == "*" {
            let removed = self.entries.len();
            self.entries.clear();
            return removed;
        }
        let Some(re) = glob_to_regex(pattern) else {
            return 0;
        };
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| re.is_match(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        doomed
            .iter()
            .filter(|key| self.entries.remove(key.as_str()).is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict expired entries first; otherwise the least-recently-written.
    fn evict_one(&self) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.is_expired())
            .map(|entry| entry.key().clone())
            .collect();
        if !expired.is_empty() {
            for key in expired {
                self.entries.remove(&key);
            }
            return;
        }

        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.written)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            tracing::debug!(key = %key, "memory cache full, evicting oldest entry");
            self.entries.remove(&key);
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Translate a Redis-style glob into an anchored regex. Returns None for
/// patterns the translation cannot express.
fn glob_to_regex(pattern: &str) -> Option<regex::Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    regex::Regex::new(&re).ok()
}
