// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request cache.
//!
//! Recent successful responses keyed by operation key
//! (`products:all:*`, `products:id:7`, ...), each valid for its own TTL.
//!
//! # Rules
//!
//! - An entry is served only while `now - stored_at < ttl`
//! - An expired entry is removed on lookup and counted, never returned
//! - Writing a key overwrites it (last call wins)
//! - Bounded by max entries with oldest-eviction
//!
//! Time comes from `tokio::time::Instant` so tests can pause and advance it.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::metrics;

#[derive(Clone, Debug)]
struct CacheEntry {
    payload: Value,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Lookups that found an entry past its TTL
    pub expired: u64,
    pub entries: usize,
    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
}

pub struct RequestCache {
    cache: DashMap<String, CacheEntry>,
    /// Insertion order for eviction (oldest first)
    order: Mutex<VecDeque<String>>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
}

impl RequestCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            cache: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.get_at(key, Instant::now())
    }

    /// Lookup as of `now`.
    pub fn get_at(&self, key: &str, now: Instant) -> Option<Value> {
        if let Some(entry) = self.cache.get(key) {
            if entry.is_fresh(now) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_lookup("hit");
                return Some(entry.payload.clone());
            }
            drop(entry); // Release read lock before removing
            self.remove(key);
            self.expired.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_lookup("expired");
        } else {
            metrics::record_cache_lookup("miss");
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, key: impl Into<String>, payload: Value, ttl: Duration) {
        self.insert_at(key, payload, ttl, Instant::now());
    }

    pub fn insert_at(&self, key: impl Into<String>, payload: Value, ttl: Duration, now: Instant) {
        let key = key.into();

        // Evict oldest if at capacity
        if !self.cache.contains_key(&key) && self.cache.len() >= self.max_entries {
            let mut order = self.order.lock();
            while self.cache.len() >= self.max_entries {
                match order.pop_front() {
                    Some(old_key) => {
                        self.cache.remove(&old_key);
                    }
                    None => break,
                }
            }
        }

        let entry = CacheEntry { payload, stored_at: now, ttl };
        if self.cache.insert(key.clone(), entry).is_none() {
            self.order.lock().push_back(key);
        }
        metrics::set_cache_entries(self.cache.len());
    }

    /// Remove a single key. Returns whether it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.remove(key)
    }

    /// Remove every key starting with `prefix` (e.g. `"products:"`).
    /// Returns the number of entries removed.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let before = self.cache.len();
        self.cache.retain(|key, _| !key.starts_with(prefix));
        self.order.lock().retain(|key| !key.starts_with(prefix));
        metrics::set_cache_entries(self.cache.len());
        before.saturating_sub(self.cache.len())
    }

    pub fn clear(&self) {
        self.cache.clear();
        self.order.lock().clear();
        metrics::set_cache_entries(0);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            expired: self.expired.load(Ordering::Relaxed),
            entries: self.cache.len(),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    fn remove(&self, key: &str) -> bool {
        let removed = self.cache.remove(key).is_some();
        if removed {
            self.order.lock().retain(|k| k != key);
        }
        removed
    }
}

impl Default for RequestCache {
    fn default() -> Self {
        Self::new(500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(300);

    #[test]
    fn test_fresh_hit_and_expiry_boundary() {
        let cache = RequestCache::new(10);
        let t0 = Instant::now();
        cache.insert_at("products:all:*", json!([1, 2]), TTL, t0);

        let just_before = t0 + TTL - Duration::from_millis(1);
        assert_eq!(cache.get_at("products:all:*", just_before), Some(json!([1, 2])));

        let just_after = t0 + TTL + Duration::from_millis(1);
        assert_eq!(cache.get_at("products:all:*", just_after), None);
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expired, 1);
    }

    #[test]
    fn test_exact_ttl_is_expired() {
        let cache = RequestCache::new(10);
        let t0 = Instant::now();
        cache.insert_at("k", json!(1), TTL, t0);
        assert_eq!(cache.get_at("k", t0 + TTL), None);
    }

    #[test]
    fn test_overwrite_refreshes() {
        let cache = RequestCache::new(10);
        let t0 = Instant::now();
        cache.insert_at("k", json!("old"), TTL, t0);
        let t1 = t0 + Duration::from_secs(200);
        cache.insert_at("k", json!("new"), TTL, t1);

        assert_eq!(cache.get_at("k", t0 + Duration::from_secs(400)), Some(json!("new")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_prefix() {
        let cache = RequestCache::new(10);
        cache.insert("products:all:*", json!([]), TTL);
        cache.insert("products:id:7", json!({}), TTL);
        cache.insert("news:all:*", json!([]), TTL);

        assert_eq!(cache.invalidate_prefix("products:"), 2);
        assert!(cache.get("products:id:7").is_none());
        assert!(cache.get("news:all:*").is_some());
    }

    #[test]
    fn test_eviction_oldest_first() {
        let cache = RequestCache::new(3);
        for i in 0..5 {
            cache.insert(format!("k{}", i), json!(i), TTL);
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.get("k0").is_none());
        assert!(cache.get("k1").is_none());
        assert_eq!(cache.get("k4"), Some(json!(4)));
    }

    #[test]
    fn test_reinserted_key_not_evicted_by_stale_order() {
        let cache = RequestCache::new(2);
        cache.insert("a", json!(1), TTL);
        cache.invalidate("a");
        cache.insert("b", json!(2), TTL);
        cache.insert("a", json!(3), TTL);
        cache.insert("c", json!(4), TTL);

        // "b" was the oldest live entry
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a"), Some(json!(3)));
    }

    #[test]
    fn test_stats_hit_rate() {
        let cache = RequestCache::default();
        cache.insert("k", json!(1), TTL);
        cache.get("k");
        cache.get("k");
        cache.get("missing");
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }
}
