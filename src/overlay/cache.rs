//! Bounded cache with capacity and TTL eviction.
//!
//! Replaces the soft-reference caches of older designs with explicit
//! limits: entries expire after a time-to-live and the least recently used
//! entry is evicted when the capacity is exceeded. Eviction is
//! approximate-LRU: last-access timestamps, not a strict recency list.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// A capacity- and TTL-bounded map.
#[derive(Debug)]
pub struct BoundedCache<K, V> {
    entries: HashMap<K, CacheSlot<V>>,
    capacity: usize,
    ttl: Duration,
}

#[derive(Debug)]
struct CacheSlot<V> {
    value: V,
    last_access: Instant,
}

impl<K: Eq + Hash + Clone, V> BoundedCache<K, V> {
    /// Create a cache holding at most `capacity` entries, each living at
    /// most `ttl` since its last access.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        BoundedCache { entries: HashMap::new(), capacity: capacity.max(1), ttl }
    }

    /// Insert or refresh an entry, evicting the stalest one when full.
    pub fn insert(&mut self, key: K, value: V) {
        let now = Instant::now();
        self.entries.retain(|_, slot| now.duration_since(slot.last_access) < self.ttl);
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, slot)| slot.last_access)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key, CacheSlot { value, last_access: now });
    }

    /// Look up an entry, refreshing its recency.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(slot) => now.duration_since(slot.last_access) >= self.ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        let slot = self.entries.get_mut(key)?;
        slot.last_access = now;
        Some(&slot.value)
    }

    /// Whether the key is present and fresh, without refreshing recency.
    pub fn contains(&self, key: &K) -> bool {
        self.entries
            .get(key)
            .map(|slot| Instant::now().duration_since(slot.last_access) < self.ttl)
            .unwrap_or(false)
    }

    /// Drop an entry.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|slot| slot.value)
    }

    /// Current number of entries, fresh or not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
