//! Per-node lock lookup caches.
//!
//! One concurrent map per memory node, holding weak references so that a
//! cached entry never keeps a lock structure alive and never counts toward
//! its reference count.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use serde::Serialize;

use crate::error::Result;
use crate::resource::ResourceLock;

#[derive(Debug)]
struct NodeCache {
    entries: DashMap<u64, Weak<ResourceLock>, FxBuildHasher>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl NodeCache {
    fn new() -> Self {
        Self {
            entries: DashMap::with_hasher(FxBuildHasher),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }
}

/// Cache statistics, summed over all nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Lookups answered from a node cache.
    pub hits: u64,
    /// Lookups that fell through to the global table.
    pub misses: u64,
    /// Entries dropped to stay under capacity, or found stale.
    pub evictions: u64,
    /// Live entries across all nodes.
    pub entries: usize,
}

impl CacheStats {
    /// Fraction of lookups that hit, 0.0 when nothing was looked up.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        // Reason: counters stay far below 2^52 in practice
        #[allow(clippy::cast_precision_loss)]
        let rate = self.hits as f64 / total as f64;
        rate
    }
}

/// NUMA-local lookup caches in front of a lock table.
#[derive(Debug)]
pub struct NumaLockCache {
    nodes: Vec<NodeCache>,
    capacity: usize,
}

impl NumaLockCache {
    /// Creates `nodes` empty caches of `capacity` entries each.
    pub fn new(nodes: usize, capacity: usize) -> Result<Self> {
        let nodes = nodes.max(1);
        let mut caches = Vec::new();
        caches.try_reserve_exact(nodes)?;
        caches.extend((0..nodes).map(|_| NodeCache::new()));
        Ok(Self {
            nodes: caches,
            capacity,
        })
    }

    /// Number of node caches.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Per-node entry limit.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Looks up `resource_id` in the cache of `node`.
    ///
    /// Only returns locks that still exist and were allocated on `node`.
    /// Stale entries are dropped on the way.
    pub fn lookup(&self, node: usize, resource_id: u64) -> Option<Arc<ResourceLock>> {
        let cache = self.nodes.get(node)?;
        let found = cache
            .entries
            .get(&resource_id)
            .and_then(|entry| entry.value().upgrade());

        match found {
            Some(lock) if lock.numa_node() == node => {
                cache.hits.fetch_add(1, Ordering::Relaxed);
                Some(lock)
            }
            Some(_) => {
                cache.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                // A fresh entry may have replaced the dead one meanwhile.
                if cache
                    .entries
                    .remove_if(&resource_id, |_, weak| weak.strong_count() == 0)
                    .is_some()
                {
                    cache.evictions.fetch_add(1, Ordering::Relaxed);
                }
                cache.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Caches `lock` on `node`.
    ///
    /// Returns false when the lock lives on another node, the key is
    /// already cached, or the capacity is 0.
    pub fn insert(&self, node: usize, lock: &Arc<ResourceLock>) -> bool {
        let Some(cache) = self.nodes.get(node) else {
            return false;
        };
        if self.capacity == 0 || lock.numa_node() != node {
            return false;
        }
        let resource_id = lock.resource_id();
        if cache.entries.contains_key(&resource_id) {
            return false;
        }
        if cache.entries.len() >= self.capacity {
            self.make_room(cache);
        }
        cache
            .entries
            .insert(resource_id, Arc::downgrade(lock))
            .is_none()
    }

    fn make_room(&self, cache: &NodeCache) {
        let before = cache.entries.len();
        cache.entries.retain(|_, weak| weak.strong_count() > 0);
        let mut evicted = before.saturating_sub(cache.entries.len());

        while cache.entries.len() >= self.capacity {
            // The shard guard of `iter()` must be gone before `remove`.
            let victim = cache.entries.iter().next().map(|entry| *entry.key());
            match victim {
                Some(key) => {
                    if cache.entries.remove(&key).is_some() {
                        evicted += 1;
                    }
                }
                None => break,
            }
        }
        cache
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
    }

    /// Drops `resource_id` from the cache of `node`.
    pub fn invalidate(&self, node: usize, resource_id: u64) {
        if let Some(cache) = self.nodes.get(node) {
            cache.entries.remove(&resource_id);
        }
    }

    /// Drops `resource_id` from every node cache.
    pub fn invalidate_all(&self, resource_id: u64) {
        for cache in &self.nodes {
            cache.entries.remove(&resource_id);
        }
    }

    /// Statistics summed over all nodes.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.nodes.iter().fold(CacheStats::default(), |acc, cache| CacheStats {
            hits: acc.hits + cache.hits.load(Ordering::Relaxed),
            misses: acc.misses + cache.misses.load(Ordering::Relaxed),
            evictions: acc.evictions + cache.evictions.load(Ordering::Relaxed),
            entries: acc.entries + cache.entries.len(),
        })
    }

    /// Statistics of a single node cache.
    #[must_use]
    pub fn node_stats(&self, node: usize) -> Option<CacheStats> {
        self.nodes.get(node).map(|cache| CacheStats {
            hits: cache.hits.load(Ordering::Relaxed),
            misses: cache.misses.load(Ordering::Relaxed),
            evictions: cache.evictions.load(Ordering::Relaxed),
            entries: cache.entries.len(),
        })
    }

    /// Clears hit/miss/eviction counters, keeping the entries.
    pub fn reset_stats(&self) {
        for cache in &self.nodes {
            cache.hits.store(0, Ordering::Relaxed);
            cache.misses.store(0, Ordering::Relaxed);
            cache.evictions.store(0, Ordering::Relaxed);
        }
    }
}
