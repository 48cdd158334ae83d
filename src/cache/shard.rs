//! One cache shard: an SLRU (younger/older segment) item table behind a
//! read-write lock, a bounded touch buffer so hits stay on the read path,
//! and optional ghost shadows.
//!
//! Locking discipline: evicted values and insert waiters are collected
//! under the write lock but resolved or dropped only after it is released,
//! so value destructors and waiter wakeups never run inside the shard lock.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock, Weak};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};

use super::{CacheCounters, CacheError, CachedValue, GhostStats, SlruCacheConfig, ValueFuture};
use crate::cache::ghost::GhostShard;
use crate::cache::list::{Location, LruList};

type Waiter<V> = Sender<Result<Arc<V>, CacheError>>;

struct Item<V: CachedValue> {
    /// `None` while an insert is in flight.
    value: Option<Arc<V>>,
    weight: u64,
    location: Location,
    waiters: Vec<Waiter<V>>,
}

struct ShardState<V: CachedValue> {
    items: HashMap<V::Key, Item<V>>,
    /// Weak handles to every value that passed through, resident or
    /// evicted. Entries are pruned lazily when an upgrade fails.
    value_map: HashMap<V::Key, Weak<V>>,
    younger: LruList<V::Key>,
    older: LruList<V::Key>,
    younger_weight: u64,
    older_weight: u64,
    capacity: u64,
    younger_size_fraction: f64,
}

enum BeginOutcome<V: CachedValue> {
    Ready(Arc<V>),
    Joined(Receiver<Result<Arc<V>, CacheError>>),
    Resurrected(Arc<V>, u64),
    Started(Receiver<Result<Arc<V>, CacheError>>),
}

pub(crate) struct Shard<V: CachedValue> {
    state: RwLock<ShardState<V>>,
    touch_tx: Sender<V::Key>,
    touch_rx: Receiver<V::Key>,
    counters: Arc<CacheCounters>,
    small_ghost: Option<GhostShard<V::Key>>,
    large_ghost: Option<GhostShard<V::Key>>,
    small_ghost_ratio: f64,
    large_ghost_ratio: f64,
}

fn ghost_capacity(capacity: u64, ratio: f64) -> u64 {
    ((capacity as f64 * ratio) as u64).max(1)
}

impl<V: CachedValue> Shard<V> {
    pub fn new(config: &SlruCacheConfig, capacity: u64, counters: Arc<CacheCounters>) -> Self {
        let (touch_tx, touch_rx) = channel::bounded(config.touch_buffer_capacity);
        let (small_ghost, large_ghost) = if config.ghost_caches_enabled {
            (
                Some(GhostShard::new(ghost_capacity(
                    capacity,
                    config.small_ghost_ratio,
                ))),
                Some(GhostShard::new(ghost_capacity(
                    capacity,
                    config.large_ghost_ratio,
                ))),
            )
        } else {
            (None, None)
        };
        Self {
            state: RwLock::new(ShardState {
                items: HashMap::new(),
                value_map: HashMap::new(),
                younger: LruList::new(),
                older: LruList::new(),
                younger_weight: 0,
                older_weight: 0,
                capacity,
                younger_size_fraction: config.younger_size_fraction,
            }),
            touch_tx,
            touch_rx,
            counters,
            small_ghost,
            large_ghost,
            small_ghost_ratio: config.small_ghost_ratio,
            large_ghost_ratio: config.large_ghost_ratio,
        }
    }

    /// Resident-only probe. A hit queues a touch instead of taking the
    /// write lock.
    pub fn find(&self, key: &V::Key) -> Option<Arc<V>> {
        self.ghost_probe(key);
        let found = {
            let state = self.state.read().expect("cache shard lock poisoned");
            match state.items.get(key) {
                Some(Item {
                    value: Some(value), ..
                }) => Some(value.clone()),
                _ => None,
            }
        };
        match found {
            Some(value) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.queue_touch(key.clone());
                Some(value)
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Full probe: resident hit, joining an in-flight insert, or
    /// resurrecting an evicted value that is still referenced elsewhere.
    pub fn lookup(&self, key: &V::Key) -> Option<ValueFuture<V>> {
        if let Some(value) = self.find(key) {
            return Some(ValueFuture::ready(Ok(value)));
        }
        let (outcome, evicted) = {
            let mut guard = self.state.write().expect("cache shard lock poisoned");
            let state = &mut *guard;
            Self::drain_touches_locked(&self.touch_rx, state);
            if let Some(item) = state.items.get_mut(key) {
                match &item.value {
                    // Landed while we upgraded the lock.
                    Some(value) => (Some(BeginOutcome::Ready(value.clone())), Vec::new()),
                    None => {
                        let (tx, rx) = channel::bounded(1);
                        item.waiters.push(tx);
                        (Some(BeginOutcome::Joined(rx)), Vec::new())
                    }
                }
            } else if let Some(value) = state.value_map.get(key).and_then(Weak::upgrade) {
                let weight = value.weight();
                Self::insert_resident_locked(state, key, value.clone(), weight);
                let evicted = Self::trim_locked(state, &self.counters);
                (Some(BeginOutcome::Resurrected(value, weight)), evicted)
            } else {
                state.value_map.remove(key);
                (None, Vec::new())
            }
        };
        drop(evicted);
        match outcome {
            Some(BeginOutcome::Ready(value)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.queue_touch(key.clone());
                Some(ValueFuture::ready(Ok(value)))
            }
            Some(BeginOutcome::Joined(rx)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(ValueFuture::pending(rx))
            }
            Some(BeginOutcome::Resurrected(value, weight)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.ghost_resurrect(key, weight);
                Some(ValueFuture::ready(Ok(value)))
            }
            Some(BeginOutcome::Started(_)) | None => None,
        }
    }

    /// Claims the insert slot for `key`. Returns `(active, future,
    /// in_small_ghost, in_large_ghost)`; only an active caller may finish
    /// the insert.
    pub fn begin_insert(&self, key: &V::Key) -> (bool, ValueFuture<V>, bool, bool) {
        self.ghost_probe(key);
        let (outcome, evicted) = {
            let mut guard = self.state.write().expect("cache shard lock poisoned");
            let state = &mut *guard;
            Self::drain_touches_locked(&self.touch_rx, state);
            if let Some(item) = state.items.get_mut(key) {
                match &item.value {
                    Some(value) => (BeginOutcome::Ready(value.clone()), Vec::new()),
                    None => {
                        let (tx, rx) = channel::bounded(1);
                        item.waiters.push(tx);
                        (BeginOutcome::Joined(rx), Vec::new())
                    }
                }
            } else if let Some(value) = state.value_map.get(key).and_then(Weak::upgrade) {
                let weight = value.weight();
                Self::insert_resident_locked(state, key, value.clone(), weight);
                let evicted = Self::trim_locked(state, &self.counters);
                (BeginOutcome::Resurrected(value, weight), evicted)
            } else {
                state.value_map.remove(key);
                let (tx, rx) = channel::bounded(1);
                state.items.insert(
                    key.clone(),
                    Item {
                        value: None,
                        weight: 0,
                        location: Location::None,
                        waiters: vec![tx],
                    },
                );
                (BeginOutcome::Started(rx), Vec::new())
            }
        };
        drop(evicted);
        match outcome {
            BeginOutcome::Ready(value) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.queue_touch(key.clone());
                (false, ValueFuture::ready(Ok(value)), false, false)
            }
            BeginOutcome::Joined(rx) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                (false, ValueFuture::pending(rx), false, false)
            }
            BeginOutcome::Resurrected(value, weight) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.ghost_resurrect(key, weight);
                (false, ValueFuture::ready(Ok(value)), false, false)
            }
            BeginOutcome::Started(rx) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                let in_small = self
                    .small_ghost
                    .as_ref()
                    .is_some_and(|ghost| ghost.insert(key, 0));
                let in_large = self
                    .large_ghost
                    .as_ref()
                    .is_some_and(|ghost| ghost.insert(key, 0));
                (true, ValueFuture::pending(rx), in_small, in_large)
            }
        }
    }

    /// Publishes the value for a pending insert and wakes every waiter.
    pub fn end_insert(&self, key: &V::Key, value: Arc<V>, update_ghosts: bool) {
        let weight = value.weight();
        let (waiters, evicted) = {
            let mut guard = self.state.write().expect("cache shard lock poisoned");
            let state = &mut *guard;
            Self::drain_touches_locked(&self.touch_rx, state);
            Self::end_insert_locked(state, &self.counters, key, value.clone(), weight)
        };
        if update_ghosts {
            if let Some(ghost) = &self.small_ghost {
                ghost.update_weight(key, weight);
            }
            if let Some(ghost) = &self.large_ghost {
                ghost.update_weight(key, weight);
            }
        }
        for tx in waiters {
            let _ = tx.send(Ok(value.clone()));
        }
        drop(evicted);
    }

    /// Abandons a pending insert and fails every waiter with `error`.
    pub fn cancel_insert(
        &self,
        key: &V::Key,
        error: CacheError,
        in_small_ghost: bool,
        in_large_ghost: bool,
    ) {
        let waiters = {
            let mut guard = self.state.write().expect("cache shard lock poisoned");
            let state = &mut *guard;
            Self::drain_touches_locked(&self.touch_rx, state);
            Self::cancel_locked(state, key)
        };
        if in_small_ghost && let Some(ghost) = &self.small_ghost {
            ghost.remove(key);
        }
        if in_large_ghost && let Some(ghost) = &self.large_ghost {
            ghost.remove(key);
        }
        for tx in waiters {
            let _ = tx.send(Err(error.clone()));
        }
    }

    /// Removes a resident item. Pending inserts are left to their cookie.
    pub fn try_remove(&self, key: &V::Key) -> bool {
        let removed = {
            let mut guard = self.state.write().expect("cache shard lock poisoned");
            let state = &mut *guard;
            Self::drain_touches_locked(&self.touch_rx, state);
            Self::remove_locked(state, key)
        };
        match removed {
            Some(value) => {
                if let Some(ghost) = &self.small_ghost {
                    ghost.remove(key);
                }
                if let Some(ghost) = &self.large_ghost {
                    ghost.remove(key);
                }
                drop(value);
                true
            }
            None => false,
        }
    }

    /// Re-reads the value's weight and rebalances. Returns false when the
    /// key is not resident.
    pub fn update_weight(&self, key: &V::Key) -> bool {
        let (updated_weight, evicted) = {
            let mut guard = self.state.write().expect("cache shard lock poisoned");
            let state = &mut *guard;
            Self::drain_touches_locked(&self.touch_rx, state);
            Self::update_weight_locked(state, &self.counters, key)
        };
        drop(evicted);
        match updated_weight {
            Some(weight) => {
                if let Some(ghost) = &self.small_ghost {
                    ghost.update_weight(key, weight);
                }
                if let Some(ghost) = &self.large_ghost {
                    ghost.update_weight(key, weight);
                }
                true
            }
            None => false,
        }
    }

    pub fn queue_touch(&self, key: V::Key) {
        match self.touch_tx.try_send(key) {
            Ok(()) => {}
            Err(TrySendError::Full(key)) => {
                // Overflow: apply everything inline under the write lock.
                let mut guard = self.state.write().expect("cache shard lock poisoned");
                let state = &mut *guard;
                Self::drain_touches_locked(&self.touch_rx, state);
                Self::apply_touch_locked(state, &key);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn reconfigure(&self, capacity: u64, younger_size_fraction: f64) {
        let evicted = {
            let mut guard = self.state.write().expect("cache shard lock poisoned");
            let state = &mut *guard;
            Self::drain_touches_locked(&self.touch_rx, state);
            state.capacity = capacity;
            state.younger_size_fraction = younger_size_fraction;
            Self::trim_locked(state, &self.counters)
        };
        drop(evicted);
        if let Some(ghost) = &self.small_ghost {
            ghost.set_capacity(ghost_capacity(capacity, self.small_ghost_ratio));
        }
        if let Some(ghost) = &self.large_ghost {
            ghost.set_capacity(ghost_capacity(capacity, self.large_ghost_ratio));
        }
    }

    /// `(resident_items, pending_items, resident_weight)`.
    pub fn snapshot(&self) -> (usize, usize, u64) {
        let state = self.state.read().expect("cache shard lock poisoned");
        let resident = state.younger.len() + state.older.len();
        let pending = state.items.len() - resident;
        (resident, pending, state.younger_weight + state.older_weight)
    }

    pub fn ghost_snapshot(&self) -> Option<(GhostStats, GhostStats)> {
        match (&self.small_ghost, &self.large_ghost) {
            (Some(small), Some(large)) => Some((small.stats(), large.stats())),
            _ => None,
        }
    }

    fn ghost_probe(&self, key: &V::Key) {
        if let Some(ghost) = &self.small_ghost {
            ghost.find(key);
        }
        if let Some(ghost) = &self.large_ghost {
            ghost.find(key);
        }
    }

    fn ghost_resurrect(&self, key: &V::Key, weight: u64) {
        if let Some(ghost) = &self.small_ghost {
            ghost.resurrect(key, weight);
        }
        if let Some(ghost) = &self.large_ghost {
            ghost.resurrect(key, weight);
        }
    }

    fn drain_touches_locked(touch_rx: &Receiver<V::Key>, state: &mut ShardState<V>) {
        while let Ok(key) = touch_rx.try_recv() {
            Self::apply_touch_locked(state, &key);
        }
    }

    /// Moves a resident item to the front of the older segment.
    fn apply_touch_locked(state: &mut ShardState<V>, key: &V::Key) {
        let Some(item) = state.items.get_mut(key) else {
            return;
        };
        match item.location {
            Location::Younger(id) => {
                if state.younger.remove(id).is_some() {
                    state.younger_weight -= item.weight;
                    item.location = Location::Older(state.older.push_front(key.clone()));
                    state.older_weight += item.weight;
                }
            }
            Location::Older(id) => {
                if state.older.remove(id).is_some() {
                    item.location = Location::Older(state.older.push_front(key.clone()));
                }
            }
            Location::None => {}
        }
    }

    fn insert_resident_locked(state: &mut ShardState<V>, key: &V::Key, value: Arc<V>, weight: u64) {
        let id = state.younger.push_front(key.clone());
        state.younger_weight += weight;
        state.items.insert(
            key.clone(),
            Item {
                value: Some(value),
                weight,
                location: Location::Younger(id),
                waiters: Vec::new(),
            },
        );
    }

    fn end_insert_locked(
        state: &mut ShardState<V>,
        counters: &CacheCounters,
        key: &V::Key,
        value: Arc<V>,
        weight: u64,
    ) -> (Vec<Waiter<V>>, Vec<Arc<V>>) {
        let Some(item) = state.items.get_mut(key) else {
            return (Vec::new(), Vec::new());
        };
        item.value = Some(value.clone());
        item.weight = weight;
        item.location = Location::Younger(state.younger.push_front(key.clone()));
        state.younger_weight += weight;
        let waiters = std::mem::take(&mut item.waiters);
        state.value_map.insert(key.clone(), Arc::downgrade(&value));
        let evicted = Self::trim_locked(state, counters);
        (waiters, evicted)
    }

    fn cancel_locked(state: &mut ShardState<V>, key: &V::Key) -> Vec<Waiter<V>> {
        match state.items.get(key) {
            Some(item) if item.value.is_none() => state
                .items
                .remove(key)
                .map(|item| item.waiters)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    fn remove_locked(state: &mut ShardState<V>, key: &V::Key) -> Option<Arc<V>> {
        if state.items.get(key)?.value.is_none() {
            return None;
        }
        let item = state.items.remove(key)?;
        match item.location {
            Location::Younger(id) => {
                state.younger.remove(id);
                state.younger_weight -= item.weight;
            }
            Location::Older(id) => {
                state.older.remove(id);
                state.older_weight -= item.weight;
            }
            Location::None => {}
        }
        state.value_map.remove(key);
        item.value
    }

    fn update_weight_locked(
        state: &mut ShardState<V>,
        counters: &CacheCounters,
        key: &V::Key,
    ) -> (Option<u64>, Vec<Arc<V>>) {
        let Some(item) = state.items.get_mut(key) else {
            return (None, Vec::new());
        };
        let Some(value) = &item.value else {
            return (None, Vec::new());
        };
        let new_weight = value.weight();
        let old_weight = item.weight;
        item.weight = new_weight;
        match item.location {
            Location::Younger(_) => {
                state.younger_weight = state.younger_weight - old_weight + new_weight;
            }
            Location::Older(_) => {
                state.older_weight = state.older_weight - old_weight + new_weight;
            }
            Location::None => {}
        }
        let evicted = Self::trim_locked(state, counters);
        (Some(new_weight), evicted)
    }

    /// Restores the two SLRU bounds: the older segment stays within its
    /// protected share, then total weight is forced under capacity by
    /// evicting from the younger tail.
    fn trim_locked(state: &mut ShardState<V>, counters: &CacheCounters) -> Vec<Arc<V>> {
        let mut evicted = Vec::new();
        let protected_limit =
            (state.capacity as f64 * (1.0 - state.younger_size_fraction)) as u64;
        while state.older_weight > protected_limit {
            let Some(key) = state.older.pop_back() else {
                break;
            };
            if let Some(item) = state.items.get_mut(&key) {
                state.older_weight -= item.weight;
                state.younger_weight += item.weight;
                item.location = Location::Younger(state.younger.push_front(key.clone()));
            }
        }
        while state.younger_weight + state.older_weight > state.capacity {
            let Some(key) = state.younger.pop_back() else {
                break;
            };
            if let Some(item) = state.items.remove(&key) {
                state.younger_weight -= item.weight;
                counters.evictions.fetch_add(1, Ordering::Relaxed);
                // The weak handle in value_map stays; a later lookup can
                // resurrect the value while someone still holds it.
                if let Some(value) = item.value {
                    evicted.push(value);
                }
            }
        }
        evicted
    }
}
