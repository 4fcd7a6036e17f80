//! Tests for topology mapping and node caches.

use super::*;
use crate::resource::ResourceLock;
use std::sync::Arc;

fn lock_on(resource_id: u64, node: usize) -> Arc<ResourceLock> {
    Arc::new(ResourceLock::new(resource_id, node))
}

#[test]
fn test_static_topology_uniform_is_node_zero() {
    let topology = StaticTopology::uniform();
    assert_eq!(topology.node_count(), 1);
    assert_eq!(topology.current_node(), 0);
}

#[test]
fn test_static_topology_zero_nodes_becomes_one() {
    assert_eq!(StaticTopology::new(0).node_count(), 1);
}

#[test]
fn test_pinned_thread_maps_to_its_node() {
    let topology = StaticTopology::new(4);
    std::thread::spawn(move || {
        pin_current_thread(2);
        assert_eq!(topology.current_node(), 2);
        pin_current_thread(6);
        assert_eq!(topology.current_node(), 2);
        unpin_current_thread();
        assert!(topology.current_node() < 4);
    })
    .join()
    .unwrap();
}

#[test]
fn test_cache_hit_requires_matching_node() {
    let cache = NumaLockCache::new(2, 16).unwrap();
    let lock = lock_on(7, 1);

    assert!(!cache.insert(0, &lock), "insert on a foreign node must be refused");
    assert!(cache.insert(1, &lock));
    assert!(!cache.insert(1, &lock), "duplicate insert must be refused");

    let hit = cache.lookup(1, 7).unwrap();
    assert!(Arc::ptr_eq(&hit, &lock));
    assert!(cache.lookup(0, 7).is_none());

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
}

#[test]
fn test_cache_entry_does_not_keep_lock_alive() {
    let cache = NumaLockCache::new(1, 16).unwrap();
    let lock = lock_on(3, 0);
    cache.insert(0, &lock);
    assert_eq!(Arc::strong_count(&lock), 1);

    drop(lock);
    assert!(cache.lookup(0, 3).is_none());
    assert_eq!(cache.stats().entries, 0);
    assert_eq!(cache.stats().evictions, 1);
}

#[test]
fn test_cache_evicts_at_capacity() {
    let cache = NumaLockCache::new(1, 2).unwrap();
    let locks: Vec<_> = (0..3).map(|id| lock_on(id, 0)).collect();
    for lock in &locks {
        assert!(cache.insert(0, lock));
    }
    let stats = cache.node_stats(0).unwrap();
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.evictions, 1);
    // The most recent insert always survives
    assert!(cache.lookup(0, 2).is_some());
}

#[test]
fn test_cache_zero_capacity_never_stores() {
    let cache = NumaLockCache::new(1, 0).unwrap();
    let lock = lock_on(1, 0);
    assert!(!cache.insert(0, &lock));
    assert_eq!(cache.stats().entries, 0);
}

#[test]
fn test_cache_invalidate_and_reset() {
    let cache = NumaLockCache::new(2, 8).unwrap();
    let a = lock_on(1, 0);
    let b = lock_on(1, 1);
    cache.insert(0, &a);
    cache.insert(1, &b);
    cache.lookup(0, 1);

    cache.invalidate_all(1);
    assert_eq!(cache.stats().entries, 0);

    cache.reset_stats();
    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses, stats.evictions), (0, 0, 0));
}

#[test]
fn test_lookup_on_unknown_node_is_none() {
    let cache = NumaLockCache::new(1, 8).unwrap();
    assert!(cache.lookup(5, 1).is_none());
    assert!(!cache.insert(5, &lock_on(1, 5)));
}

#[test]
fn test_dead_entry_cleanup_spares_fresh_insert() {
    let cache = Arc::new(NumaLockCache::new(1, 8).unwrap());
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let lookups = {
        let cache = Arc::clone(&cache);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !stop.load(std::sync::atomic::Ordering::Acquire) {
                let _ = cache.lookup(0, 1);
            }
        })
    };

    for _ in 0..5_000 {
        let lock = lock_on(1, 0);
        // Clears a dead entry left by the previous round, if still there
        let _ = cache.lookup(0, 1);
        if cache.insert(0, &lock) {
            let hit = cache.lookup(0, 1).expect("live entry must not be evicted");
            assert!(Arc::ptr_eq(&hit, &lock));
        }
    }

    stop.store(true, std::sync::atomic::Ordering::Release);
    lookups.join().unwrap();
}
