//! Integration tests for the SLRU cache: insert deduplication, segment
//! ordering, weight accounting, resurrection, and ghost shadows.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use millrace::cache::{CacheError, CachedValue, SlruCache, SlruCacheConfig};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

// ===== Fixtures =====

#[derive(Debug)]
struct Entry {
    key: String,
    weight: AtomicU64,
}

impl Entry {
    fn new(key: &str, weight: u64) -> Arc<Self> {
        Arc::new(Self {
            key: key.to_string(),
            weight: AtomicU64::new(weight),
        })
    }
}

impl CachedValue for Entry {
    type Key = String;

    fn cache_key(&self) -> String {
        self.key.clone()
    }

    fn weight(&self) -> u64 {
        self.weight.load(Ordering::Relaxed)
    }
}

fn key(s: &str) -> String {
    s.to_string()
}

/// Single shard, no ghosts: eviction order is fully deterministic.
fn plain_cache(capacity: u64) -> SlruCache<Entry> {
    SlruCache::new(SlruCacheConfig {
        capacity,
        younger_size_fraction: 0.25,
        shard_count: 1,
        ghost_caches_enabled: false,
        ..SlruCacheConfig::default()
    })
    .expect("cache config")
}

fn insert(cache: &SlruCache<Entry>, name: &str, weight: u64) -> Arc<Entry> {
    let value = Entry::new(name, weight);
    let cookie = cache.begin_insert(&key(name));
    assert!(cookie.is_active(), "insert for {name} was already in flight");
    cookie.end_insert(value.clone());
    value
}

// ===== Insert deduplication =====

#[test]
fn concurrent_inserts_converge_on_one_value() {
    let cache = SlruCache::new(SlruCacheConfig {
        capacity: 1024,
        shard_count: 4,
        ghost_caches_enabled: false,
        ..SlruCacheConfig::default()
    })
    .expect("cache config");
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let winners = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let cache = cache.clone();
            let barrier = barrier.clone();
            let winners = winners.clone();
            thread::spawn(move || {
                barrier.wait();
                let mut cookie = cache.begin_insert(&key("hot"));
                if cookie.is_active() {
                    winners.fetch_add(1, Ordering::Relaxed);
                    let value = Entry::new("hot", 1);
                    thread::sleep(Duration::from_millis(5));
                    cookie.end_insert(value.clone());
                    value
                } else {
                    let future = cookie.take_future().expect("joiner future");
                    match future.wait_timeout(TEST_TIMEOUT) {
                        Ok(result) => result.expect("joined insert"),
                        Err(_) => panic!("insert never resolved"),
                    }
                }
            })
        })
        .collect();

    let values: Vec<Arc<Entry>> = handles
        .into_iter()
        .map(|h| h.join().expect("worker thread"))
        .collect();

    assert_eq!(winners.load(Ordering::Relaxed), 1);
    for value in &values[1..] {
        assert!(Arc::ptr_eq(&values[0], value));
    }
    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, threads as u64 - 1);
}

#[test]
fn failed_inserts_propagate_to_joiners_and_allow_retry() {
    let cache = plain_cache(16);
    let loser_future = {
        let winner = cache.begin_insert(&key("fetch"));
        assert!(winner.is_active());
        let mut joiner = cache.begin_insert(&key("fetch"));
        assert!(!joiner.is_active());
        let future = joiner.take_future().expect("joiner future");
        winner.cancel(CacheError::failed("backing read failed"));
        future
    };
    match loser_future.wait() {
        Err(CacheError::Failed { reason }) => assert_eq!(reason, "backing read failed"),
        other => panic!("expected the insert failure, got {other:?}"),
    }

    // The slot is free again; a retry claims it.
    let retry = cache.begin_insert(&key("fetch"));
    assert!(retry.is_active());
    retry.end_insert(Entry::new("fetch", 1));
    assert!(cache.find(&key("fetch")).is_some());
}

#[test]
fn dropping_an_active_cookie_aborts_joiners() {
    let cache = plain_cache(16);
    let winner = cache.begin_insert(&key("doomed"));
    assert!(winner.is_active());
    let mut joiner = cache.begin_insert(&key("doomed"));
    let future = joiner.take_future().expect("joiner future");
    drop(winner);
    assert!(matches!(future.wait(), Err(CacheError::Aborted)));
    assert!(cache.find(&key("doomed")).is_none());
}

#[test]
fn pending_inserts_block_removal() {
    let cache = plain_cache(16);
    let cookie = cache.begin_insert(&key("held"));
    assert!(cookie.is_active());
    assert!(!cache.try_remove(&key("held")));
    cookie.end_insert(Entry::new("held", 1));
    assert!(cache.try_remove(&key("held")));
    assert!(cache.find(&key("held")).is_none());
    assert_eq!(cache.stats().resident_items, 0);
}

// ===== Segment ordering and weight =====

#[test]
fn eviction_takes_the_coldest_younger_entry() {
    let cache = plain_cache(3);
    insert(&cache, "a", 1);
    insert(&cache, "b", 1);
    insert(&cache, "c", 1);

    // The hit moves "a" into the protected segment before "d" lands.
    assert!(cache.find(&key("a")).is_some());
    insert(&cache, "d", 1);

    assert!(cache.find(&key("b")).is_none(), "coldest entry survived");
    assert!(cache.find(&key("a")).is_some());
    assert!(cache.find(&key("c")).is_some());
    assert!(cache.find(&key("d")).is_some());
    let stats = cache.stats();
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.resident_items, 3);
}

#[test]
fn explicit_touch_protects_like_a_hit() {
    let cache = SlruCache::new(SlruCacheConfig {
        capacity: 3,
        younger_size_fraction: 0.25,
        shard_count: 1,
        touch_buffer_capacity: 1,
        ghost_caches_enabled: false,
        ..SlruCacheConfig::default()
    })
    .expect("cache config");
    insert(&cache, "a", 1);
    insert(&cache, "b", 1);
    insert(&cache, "c", 1);

    // Way past the touch buffer's capacity; overflow applies inline.
    for _ in 0..100 {
        cache.touch(&key("a"));
    }
    insert(&cache, "d", 1);

    assert!(cache.find(&key("a")).is_some());
    assert!(cache.find(&key("b")).is_none());
}

#[test]
fn resident_weight_stays_within_capacity() {
    let cache = plain_cache(10);
    for i in 0..20 {
        insert(&cache, &format!("entry-{i}"), 3);
        assert!(
            cache.stats().resident_weight <= 10,
            "weight overran the capacity"
        );
    }
    assert_eq!(cache.stats().resident_items, 3);

    // An entry heavier than the whole cache never stays resident.
    insert(&cache, "oversized", 50);
    assert!(cache.find(&key("oversized")).is_none());
    assert!(cache.stats().resident_weight <= 10);
}

#[test]
fn update_weight_rebalances_and_evicts() {
    let cache = plain_cache(10);
    let grown = insert(&cache, "grown", 2);
    insert(&cache, "other", 2);

    grown.weight.store(9, Ordering::Relaxed);
    assert!(cache.update_weight(&key("grown")));

    // 9 + 2 exceeds the capacity; the heavier, colder entry goes.
    assert!(cache.find(&key("grown")).is_none());
    assert!(cache.find(&key("other")).is_some());
    assert!(cache.stats().resident_weight <= 10);

    assert!(!cache.update_weight(&key("missing")));
}

#[test]
fn reconfigure_shrinks_and_validates() {
    let cache = plain_cache(8);
    for name in ["a", "b", "c", "d"] {
        insert(&cache, name, 2);
    }
    assert_eq!(cache.stats().resident_weight, 8);

    cache.reconfigure(4, 0.25).expect("shrink");
    assert!(cache.stats().resident_weight <= 4);

    assert!(cache.reconfigure(0, 0.25).is_err());
    assert!(cache.reconfigure(8, 1.5).is_err());
}

// ===== Resurrection =====

#[test]
fn evicted_values_resurrect_while_referenced() {
    let cache = plain_cache(2);
    let held = insert(&cache, "x", 1);
    insert(&cache, "y", 1);
    insert(&cache, "z", 1);
    assert!(cache.find(&key("x")).is_none(), "x should have been evicted");

    let future = cache.lookup(&key("x")).expect("resurrectable value");
    let revived = future.wait().expect("resurrected value");
    assert!(Arc::ptr_eq(&held, &revived));

    // Back to resident, with its weight counted again.
    assert!(cache.find(&key("x")).is_some());
    assert!(cache.stats().resident_weight <= 2);
}

#[test]
fn dead_references_do_not_resurrect() {
    let cache = plain_cache(2);
    let value = insert(&cache, "gone", 1);
    insert(&cache, "b", 1);
    insert(&cache, "c", 1);
    drop(value);

    assert!(cache.lookup(&key("gone")).is_none());
    assert!(cache.find(&key("gone")).is_none());
}

// ===== Ghost shadows =====

#[test]
fn ghost_shadows_remember_evicted_keys() {
    // Defaults keep ghosts on: small shadow at half capacity, large at
    // double.
    let cache = SlruCache::new(SlruCacheConfig {
        capacity: 2,
        younger_size_fraction: 0.25,
        shard_count: 1,
        ..SlruCacheConfig::default()
    })
    .expect("cache config");
    insert(&cache, "a", 1);
    insert(&cache, "b", 1);
    insert(&cache, "c", 1);

    // "a" fell out of the real cache and the half-size shadow, but the
    // double-size shadow still remembers it.
    let cookie = cache.begin_insert(&key("a"));
    assert!(cookie.is_active());
    drop(cookie);

    let ghosts = cache.ghost_stats().expect("ghosts enabled");
    assert_eq!(ghosts.small.hits, 0);
    assert_eq!(ghosts.small.misses, 4);
    assert_eq!(ghosts.large.hits, 1);
    assert_eq!(ghosts.large.misses, 3);
}
