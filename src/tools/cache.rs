use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::ToolCacheConfig;

/// One cached tool result. Exclusive to its owning cache instance.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key:           String,
    pub value:         Value,
    pub created_at:    Instant,
    pub last_accessed: Instant,
    pub access_count:  u64,
    pub ttl:           Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) > self.ttl
    }
}

/// Snapshot of cache effectiveness.
///
/// `total_accesses` is the sum of per-entry hit counts — it counts cache
/// hits, not all lookups.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub size:           usize,
    pub hits:           u64,
    pub misses:         u64,
    pub total_accesses: u64,
    pub hit_rate:       f64,
}

struct CacheInner {
    entries:      HashMap<String, CacheEntry>,
    hits:         u64,
    misses:       u64,
    last_cleanup: Instant,
}

/// LRU + TTL result cache for tool invocations.
///
/// Owned by a single agent or executor instance; all access goes through
/// one internal lock. Size enforcement runs at most once per
/// `cleanup_interval`, except that the hard `max_cache_size` cap is always
/// enforced on insert. `force_cleanup` bypasses the throttle.
pub struct ToolCache {
    config: ToolCacheConfig,
    inner:  Mutex<CacheInner>,
}

impl ToolCache {
    pub fn new(config: ToolCacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner {
                entries:      HashMap::new(),
                hits:         0,
                misses:       0,
                last_cleanup: Instant::now(),
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.config.default_ttl_secs)
    }

    /// Look up a key. Expired entries are removed and count as misses.
    pub fn get(&self, key: &str) -> Option<Value> {
        if !self.config.enabled {
            return None;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("cache lock poisoned");

        let expired = match inner.entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                inner.misses += 1;
                return None;
            }
        };
        if expired {
            inner.entries.remove(key);
            inner.misses += 1;
            return None;
        }

        inner.hits += 1;
        let entry = inner.entries.get_mut(key).expect("entry checked above");
        entry.last_accessed = now;
        entry.access_count += 1;
        Some(entry.value.clone())
    }

    /// Insert a successful result. Failures must never be inserted.
    pub fn insert(&self, key: impl Into<String>, value: Value, ttl: Duration) {
        if !self.config.enabled {
            return;
        }
        let key = key.into();
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                value,
                created_at:    now,
                last_accessed: now,
                access_count:  0,
                ttl,
            },
        );

        // Hard cap is unconditional; threshold-based trimming is throttled.
        if inner.entries.len() > self.config.max_cache_size {
            Self::evict_lru(&mut inner.entries, self.eviction_target());
        } else if now.duration_since(inner.last_cleanup).as_secs()
            >= self.config.cleanup_interval_secs
        {
            inner.last_cleanup = now;
            Self::remove_expired(&mut inner.entries, now);
            let threshold =
                (self.config.max_cache_size as f64 * self.config.cleanup_threshold) as usize;
            if inner.entries.len() >= threshold.max(1) {
                Self::evict_lru(&mut inner.entries, self.eviction_target());
            }
        }
    }

    /// Run expiry and LRU trimming immediately, ignoring the interval
    /// throttle.
    pub fn force_cleanup(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.last_cleanup = now;
        Self::remove_expired(&mut inner.entries, now);
        let threshold =
            (self.config.max_cache_size as f64 * self.config.cleanup_threshold) as usize;
        if inner.entries.len() >= threshold.max(1) {
            Self::evict_lru(&mut inner.entries, self.eviction_target());
        }
    }

    fn eviction_target(&self) -> usize {
        ((self.config.max_cache_size as f64 * 0.8) as usize).max(1)
    }

    fn remove_expired(entries: &mut HashMap<String, CacheEntry>, now: Instant) {
        entries.retain(|_, entry| !entry.is_expired(now));
    }

    fn evict_lru(entries: &mut HashMap<String, CacheEntry>, target: usize) {
        while entries.len() > target {
            let oldest = entries
                .values()
                .min_by_key(|e| e.last_accessed)
                .map(|e| e.key.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Drop entries whose key starts with `<tool_name>.` (or equals it).
    /// Returns the number of entries removed.
    pub fn invalidate_tool(&self, tool_name: &str) -> usize {
        let prefix = format!("{}.", tool_name);
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let before = inner.entries.len();
        inner
            .entries
            .retain(|key, _| !(key.starts_with(&prefix) || key == tool_name));
        before - inner.entries.len()
    }

    /// Drop entries whose key contains `pattern`. Returns the number removed.
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !key.contains(pattern));
        before - inner.entries.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache lock poisoned");
        let lookups = inner.hits + inner.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            inner.hits as f64 / lookups as f64
        };
        CacheStats {
            size:           inner.entries.len(),
            hits:           inner.hits,
            misses:         inner.misses,
            total_accesses: inner.entries.values().map(|e| e.access_count).sum(),
            hit_rate,
        }
    }
}

impl Default for ToolCache {
    fn default() -> Self {
        Self::new(ToolCacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn small_cache(max: usize) -> ToolCache {
        ToolCache::new(ToolCacheConfig {
            max_cache_size: max,
            ..ToolCacheConfig::default()
        })
    }

    #[test]
    fn hit_after_insert() {
        let cache = small_cache(10);
        cache.insert("calculator.add:k1", json!(8), Duration::from_secs(60));
        assert_eq!(cache.get("calculator.add:k1"), Some(json!(8)));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.total_accesses, 1);
    }

    #[test]
    fn miss_is_counted() {
        let cache = small_cache(10);
        assert_eq!(cache.get("absent"), None);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.0);
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache = small_cache(10);
        cache.insert("k", json!(1), Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn hard_cap_evicts_lru() {
        let cache = small_cache(1);
        cache.insert("a.op:1", json!(1), Duration::from_secs(60));
        cache.insert("b.op:2", json!(2), Duration::from_secs(60));
        assert_eq!(cache.len(), 1);
        // The older entry went first.
        assert_eq!(cache.get("b.op:2"), Some(json!(2)));
    }

    #[test]
    fn invalidate_by_tool_name() {
        let cache = small_cache(10);
        cache.insert("calculator.add:1", json!(1), Duration::from_secs(60));
        cache.insert("calculator.mul:2", json!(2), Duration::from_secs(60));
        cache.insert("web.search:3", json!(3), Duration::from_secs(60));
        let removed = cache.invalidate_tool("calculator");
        assert_eq!(removed, 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn force_cleanup_trims_to_80_percent() {
        let cache = small_cache(10);
        for i in 0..10 {
            cache.insert(format!("t.op:{}", i), json!(i), Duration::from_secs(60));
            // Distinct last_accessed ordering.
            std::thread::sleep(Duration::from_millis(2));
        }
        cache.force_cleanup();
        assert!(cache.len() <= 8);
    }

    #[test]
    fn disabled_cache_never_stores() {
        let cache = ToolCache::new(ToolCacheConfig {
            enabled: false,
            ..ToolCacheConfig::default()
        });
        cache.insert("k", json!(1), Duration::from_secs(60));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 0);
    }
}
