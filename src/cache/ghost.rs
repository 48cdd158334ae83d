//! Ghost caches: presence-only shadows of a shard at alternative
//! capacities. They track keys and weights but hold no values; their hit
//! counters estimate what the hit rate would be if the real cache were
//! resized.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use super::GhostStats;
use crate::cache::list::{LruList, SlotId};

struct GhostEntry {
    weight: u64,
    slot: SlotId,
}

struct GhostState<K> {
    entries: HashMap<K, GhostEntry>,
    lru: LruList<K>,
    total_weight: u64,
    capacity: u64,
}

pub(crate) struct GhostShard<K> {
    state: Mutex<GhostState<K>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: Eq + Hash + Clone> GhostShard<K> {
    pub fn new(capacity: u64) -> Self {
        Self {
            state: Mutex::new(GhostState {
                entries: HashMap::new(),
                lru: LruList::new(),
                total_weight: 0,
                capacity,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Records one probe: a hit refreshes the entry's LRU position.
    pub fn find(&self, key: &K) {
        let mut guard = self.state.lock().expect("ghost cache lock poisoned");
        let state = &mut *guard;
        match state.entries.get_mut(key) {
            Some(entry) => {
                state.lru.remove(entry.slot);
                entry.slot = state.lru.push_front(key.clone());
                self.hits.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Inserts presence for `key`. Returns true when the key was new; an
    /// existing entry is just refreshed.
    pub fn insert(&self, key: &K, weight: u64) -> bool {
        let mut guard = self.state.lock().expect("ghost cache lock poisoned");
        let state = &mut *guard;
        match state.entries.get_mut(key) {
            Some(entry) => {
                state.lru.remove(entry.slot);
                entry.slot = state.lru.push_front(key.clone());
                false
            }
            None => {
                let slot = state.lru.push_front(key.clone());
                state.entries.insert(key.clone(), GhostEntry { weight, slot });
                state.total_weight += weight;
                Self::trim_locked(state);
                true
            }
        }
    }

    pub fn update_weight(&self, key: &K, weight: u64) {
        let mut guard = self.state.lock().expect("ghost cache lock poisoned");
        let state = &mut *guard;
        if let Some(entry) = state.entries.get_mut(key) {
            state.total_weight = state.total_weight - entry.weight + weight;
            entry.weight = weight;
            Self::trim_locked(state);
        }
    }

    /// Re-admits an evicted-but-alive key at the front.
    pub fn resurrect(&self, key: &K, weight: u64) {
        let mut guard = self.state.lock().expect("ghost cache lock poisoned");
        let state = &mut *guard;
        match state.entries.get_mut(key) {
            Some(entry) => {
                state.lru.remove(entry.slot);
                entry.slot = state.lru.push_front(key.clone());
                state.total_weight = state.total_weight - entry.weight + weight;
                entry.weight = weight;
            }
            None => {
                let slot = state.lru.push_front(key.clone());
                state.entries.insert(key.clone(), GhostEntry { weight, slot });
                state.total_weight += weight;
            }
        }
        Self::trim_locked(state);
    }

    pub fn remove(&self, key: &K) {
        let mut guard = self.state.lock().expect("ghost cache lock poisoned");
        let state = &mut *guard;
        if let Some(entry) = state.entries.remove(key) {
            state.lru.remove(entry.slot);
            state.total_weight -= entry.weight;
        }
    }

    pub fn set_capacity(&self, capacity: u64) {
        let mut guard = self.state.lock().expect("ghost cache lock poisoned");
        let state = &mut *guard;
        state.capacity = capacity;
        Self::trim_locked(state);
    }

    pub fn stats(&self) -> GhostStats {
        GhostStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn trim_locked(state: &mut GhostState<K>) {
        while state.total_weight > state.capacity {
            let Some(key) = state.lru.pop_back() else {
                break;
            };
            if let Some(entry) = state.entries.remove(&key) {
                state.total_weight -= entry.weight;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_presence_not_values() {
        let ghost: GhostShard<u32> = GhostShard::new(100);
        assert!(ghost.insert(&1, 40));
        assert!(!ghost.insert(&1, 40));
        ghost.find(&1);
        ghost.find(&2);
        let stats = ghost.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn evicts_by_weight_in_lru_order() {
        let ghost: GhostShard<u32> = GhostShard::new(100);
        ghost.insert(&1, 40);
        ghost.insert(&2, 40);
        // The refresh keeps key 1 young, so key 2 goes first.
        ghost.find(&1);
        ghost.insert(&3, 40);
        ghost.find(&2);
        ghost.find(&1);
        ghost.find(&3);
        let stats = ghost.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 3);
    }

    #[test]
    fn update_weight_can_evict() {
        let ghost: GhostShard<u32> = GhostShard::new(100);
        ghost.insert(&1, 10);
        ghost.insert(&2, 10);
        ghost.update_weight(&2, 200);
        // Key 2 outgrew the whole ghost; both entries are gone.
        ghost.find(&1);
        ghost.find(&2);
        assert_eq!(ghost.stats().hits, 0);
    }

    #[test]
    fn remove_releases_weight() {
        let ghost: GhostShard<u32> = GhostShard::new(50);
        ghost.insert(&1, 50);
        ghost.remove(&1);
        assert!(ghost.insert(&2, 50));
        ghost.find(&2);
        assert_eq!(ghost.stats().hits, 1);
    }
}
