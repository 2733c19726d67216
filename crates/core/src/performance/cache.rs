//! Bounded TTL cache with hybrid recency/frequency eviction.
//!
//! When full, the entry with the lowest `(hits + 1) / (1 + seconds idle)`
//! is evicted, so a small set of files re-read throughout one merge session
//! outlives a burst of one-off reads.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry<V> {
    value: V,
    inserted: Instant,
    last_access: Instant,
    hits: u64,
}

impl<V> Entry<V> {
    fn score(&self, now: Instant) -> f64 {
        let idle = now.duration_since(self.last_access).as_secs_f64();
        (self.hits as f64 + 1.0) / (1.0 + idle)
    }
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    stats: CacheStats,
}

pub struct HybridCache<K, V> {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> HybridCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("cache mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let expired = match inner.entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.inserted) < self.ttl => {
                entry.hits += 1;
                entry.last_access = now;
                let value = entry.value.clone();
                inner.stats.hits += 1;
                return Some(value);
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.remove(key);
            inner.stats.expirations += 1;
        }
        inner.stats.misses += 1;
        None
    }

    pub fn insert(&self, key: K, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    fn insert_at(&self, key: K, value: V, now: Instant) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            Self::evict(inner, now, self.ttl);
        }
        inner.entries.insert(
            key,
            Entry {
                value,
                inserted: now,
                last_access: now,
                hits: 0,
            },
        );
    }

    /// Drop expired entries first; if none, the lowest-scoring one.
    fn evict(inner: &mut Inner<K, V>, now: Instant, ttl: Duration) {
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, e| now.duration_since(e.inserted) < ttl);
        let expired = before - inner.entries.len();
        if expired > 0 {
            inner.stats.expirations += expired as u64;
            return;
        }
        let victim = inner
            .entries
            .iter()
            .min_by(|a, b| a.1.score(now).total_cmp(&b.1.score(now)))
            .map(|(k, _)| k.clone());
        if let Some(key) = victim {
            inner.entries.remove(&key);
            inner.stats.evictions += 1;
        }
    }

    pub fn get_or_insert_with<F, E>(&self, key: K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(v) = self.get(&key) {
            return Ok(v);
        }
        let value = load()?;
        self.insert(key, value.clone());
        Ok(value)
    }

    pub fn invalidate(&self, key: &K) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        let n = inner.entries.len();
        inner.entries.clear();
        debug!(dropped = n, "cache cleared");
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.entries.len(),
            ..inner.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_miss_accounting() {
        let cache = HybridCache::new(10, Duration::from_secs(60));
        assert_eq!(cache.get(&"a"), None);
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = HybridCache::new(10, Duration::from_secs(5));
        let t0 = Instant::now();
        cache.insert_at("a", 1, t0);
        assert_eq!(cache.get_at(&"a", t0 + Duration::from_secs(4)), Some(1));
        assert_eq!(cache.get_at(&"a", t0 + Duration::from_secs(6)), None);
        assert_eq!(cache.stats().expirations, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_frequently_used_entry_survives_eviction() {
        let cache = HybridCache::new(2, Duration::from_secs(3600));
        let t0 = Instant::now();
        cache.insert_at("hot", 1, t0);
        cache.insert_at("cold", 2, t0);
        for i in 1..=5 {
            cache.get_at(&"hot", t0 + Duration::from_millis(i));
        }
        cache.insert_at("new", 3, t0 + Duration::from_millis(10));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&"hot").is_some());
        assert!(cache.get(&"cold").is_none());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_get_or_insert_with_loads_once() {
        let cache: HybridCache<String, usize> = HybridCache::new(4, Duration::from_secs(60));
        let mut calls = 0;
        for _ in 0..3 {
            let v: Result<usize, ()> = cache.get_or_insert_with("k".into(), || {
                calls += 1;
                Ok(42)
            });
            assert_eq!(v, Ok(42));
        }
        assert_eq!(calls, 1);
    }
}
