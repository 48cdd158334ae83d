//! Sharded SLRU value cache with single-flight inserts.
//!
//! Values implement [`CachedValue`] and are stored behind `Arc`s in one of
//! `shard_count` independent shards. Each shard splits its items into a
//! probationary younger segment and a protected older segment; repeated
//! hits promote an item, and eviction always takes the younger tail.
//!
//! Inserting is a two-phase protocol: [`SlruCache::begin_insert`] hands
//! out an [`InsertCookie`], and exactly one caller per key gets an active
//! cookie and produces the value while everyone else waits on a
//! [`ValueFuture`]. Dropping an active cookie without finishing aborts
//! the waiters, leaving the key free to retry.
//!
//! Evicted values are only detached, not destroyed: as long as somebody
//! still holds the `Arc`, a later lookup resurrects the value into the
//! cache instead of recomputing it.

use std::hash::{BuildHasher, Hash, RandomState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Transience;

mod ghost;
mod list;
mod shard;

use shard::Shard;

// ===== Errors =====

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The inserting side went away without publishing a value.
    #[error("value insertion aborted")]
    Aborted,
    /// The inserting side reported a failure.
    #[error("value insertion failed: {reason}")]
    Failed { reason: String },
    #[error("invalid cache config: {reason}")]
    InvalidConfig { reason: String },
}

impl CacheError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            Self::Aborted | Self::Failed { .. } => Transience::Retryable,
            Self::InvalidConfig { .. } => Transience::Permanent,
        }
    }
}

// ===== Value contract =====

/// A value that can live in the cache.
///
/// `weight` is re-read on [`SlruCache::update_weight`], so values whose
/// size changes over time can report it through an atomic.
pub trait CachedValue: Send + Sync + 'static {
    type Key: Eq + Hash + Clone + Send + Sync + 'static;

    fn cache_key(&self) -> Self::Key;

    fn weight(&self) -> u64 {
        1
    }
}

// ===== Configuration =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlruCacheConfig {
    /// Total weight budget across all shards.
    #[serde(default = "default_capacity")]
    pub capacity: u64,
    /// Share of each shard reserved for the probationary segment.
    #[serde(default = "default_younger_size_fraction")]
    pub younger_size_fraction: f64,
    /// Number of shards; must be a power of two.
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,
    /// Touches buffered per shard before hits fall back to the write lock.
    #[serde(default = "default_touch_buffer_capacity")]
    pub touch_buffer_capacity: usize,
    /// Keep ghost shadows for sizing experiments.
    #[serde(default = "default_ghost_caches_enabled")]
    pub ghost_caches_enabled: bool,
    /// Ghost capacity as a multiple of the shard capacity.
    #[serde(default = "default_small_ghost_ratio")]
    pub small_ghost_ratio: f64,
    #[serde(default = "default_large_ghost_ratio")]
    pub large_ghost_ratio: f64,
}

fn default_capacity() -> u64 {
    1 << 20
}

fn default_younger_size_fraction() -> f64 {
    0.25
}

fn default_shard_count() -> usize {
    16
}

fn default_touch_buffer_capacity() -> usize {
    65_536
}

fn default_ghost_caches_enabled() -> bool {
    true
}

fn default_small_ghost_ratio() -> f64 {
    0.5
}

fn default_large_ghost_ratio() -> f64 {
    2.0
}

impl Default for SlruCacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            younger_size_fraction: default_younger_size_fraction(),
            shard_count: default_shard_count(),
            touch_buffer_capacity: default_touch_buffer_capacity(),
            ghost_caches_enabled: default_ghost_caches_enabled(),
            small_ghost_ratio: default_small_ghost_ratio(),
            large_ghost_ratio: default_large_ghost_ratio(),
        }
    }
}

impl SlruCacheConfig {
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.capacity == 0 {
            return Err(CacheError::InvalidConfig {
                reason: "capacity must be positive".into(),
            });
        }
        if self.shard_count == 0 || !self.shard_count.is_power_of_two() {
            return Err(CacheError::InvalidConfig {
                reason: format!("shard_count must be a power of two, got {}", self.shard_count),
            });
        }
        if !(self.younger_size_fraction > 0.0 && self.younger_size_fraction < 1.0) {
            return Err(CacheError::InvalidConfig {
                reason: format!(
                    "younger_size_fraction must lie in (0, 1), got {}",
                    self.younger_size_fraction
                ),
            });
        }
        if self.touch_buffer_capacity == 0 {
            return Err(CacheError::InvalidConfig {
                reason: "touch_buffer_capacity must be positive".into(),
            });
        }
        if self.ghost_caches_enabled
            && !(self.small_ghost_ratio > 0.0 && self.large_ghost_ratio > 0.0)
        {
            return Err(CacheError::InvalidConfig {
                reason: "ghost ratios must be positive".into(),
            });
        }
        Ok(())
    }
}

// ===== Futures and cookies =====

enum FutureState<V: CachedValue> {
    Ready(Result<Arc<V>, CacheError>),
    Pending(Receiver<Result<Arc<V>, CacheError>>),
}

/// A value that is either already resident or still being produced.
pub struct ValueFuture<V: CachedValue> {
    state: FutureState<V>,
}

impl<V: CachedValue> ValueFuture<V> {
    pub(crate) fn ready(result: Result<Arc<V>, CacheError>) -> Self {
        Self {
            state: FutureState::Ready(result),
        }
    }

    pub(crate) fn pending(rx: Receiver<Result<Arc<V>, CacheError>>) -> Self {
        Self {
            state: FutureState::Pending(rx),
        }
    }

    /// Blocks until the insert completes.
    pub fn wait(self) -> Result<Arc<V>, CacheError> {
        match self.state {
            FutureState::Ready(result) => result,
            FutureState::Pending(rx) => rx.recv().unwrap_or_else(|_| Err(CacheError::Aborted)),
        }
    }

    /// Like [`wait`](Self::wait), returning the future back on timeout.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Result<Arc<V>, CacheError>, Self> {
        match self.state {
            FutureState::Ready(result) => Ok(result),
            FutureState::Pending(rx) => match rx.recv_timeout(timeout) {
                Ok(result) => Ok(result),
                Err(RecvTimeoutError::Disconnected) => Ok(Err(CacheError::Aborted)),
                Err(RecvTimeoutError::Timeout) => Err(Self {
                    state: FutureState::Pending(rx),
                }),
            },
        }
    }

    /// Non-blocking probe.
    pub fn try_get(&self) -> Option<Result<Arc<V>, CacheError>> {
        match &self.state {
            FutureState::Ready(result) => Some(result.clone()),
            FutureState::Pending(rx) => rx.try_recv().ok(),
        }
    }
}

/// Outcome of [`SlruCache::begin_insert`].
///
/// An active cookie owns the insert slot for its key: the holder must call
/// [`end_insert`](Self::end_insert) or [`cancel`](Self::cancel). Dropping
/// an active cookie cancels with [`CacheError::Aborted`].
pub struct InsertCookie<V: CachedValue> {
    cache: SlruCache<V>,
    key: V::Key,
    active: bool,
    future: Option<ValueFuture<V>>,
    in_small_ghost: bool,
    in_large_ghost: bool,
}

impl<V: CachedValue> InsertCookie<V> {
    /// True when this caller won the insert race and must produce the value.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn key(&self) -> &V::Key {
        &self.key
    }

    /// The future every participant can wait on. Yields `None` on the
    /// second call.
    pub fn take_future(&mut self) -> Option<ValueFuture<V>> {
        self.future.take()
    }

    /// Publishes the value, wakes all waiters, and consumes the cookie.
    pub fn end_insert(mut self, value: Arc<V>) {
        assert!(self.active, "end_insert on an inactive cookie");
        self.active = false;
        let shard = self.cache.inner.shard(&self.key);
        shard.end_insert(&self.key, value, self.in_small_ghost || self.in_large_ghost);
    }

    /// Fails all waiters with `error` and consumes the cookie.
    pub fn cancel(mut self, error: CacheError) {
        assert!(self.active, "cancel on an inactive cookie");
        self.active = false;
        let shard = self.cache.inner.shard(&self.key);
        shard.cancel_insert(&self.key, error, self.in_small_ghost, self.in_large_ghost);
    }
}

impl<V: CachedValue> Drop for InsertCookie<V> {
    fn drop(&mut self) {
        if self.active {
            let shard = self.cache.inner.shard(&self.key);
            shard.cancel_insert(
                &self.key,
                CacheError::Aborted,
                self.in_small_ghost,
                self.in_large_ghost,
            );
        }
    }
}

// ===== Statistics =====

#[derive(Default)]
pub(crate) struct CacheCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub resident_items: usize,
    pub pending_items: usize,
    pub resident_weight: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GhostStats {
    pub hits: u64,
    pub misses: u64,
}

/// Hit statistics for the two ghost shadows, aggregated across shards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheGhostStats {
    pub small: GhostStats,
    pub large: GhostStats,
}

// ===== Cache =====

struct CacheInner<V: CachedValue> {
    shards: Vec<Shard<V>>,
    shard_mask: u64,
    hasher: RandomState,
    counters: Arc<CacheCounters>,
    ghosts_enabled: bool,
}

impl<V: CachedValue> CacheInner<V> {
    fn shard(&self, key: &V::Key) -> &Shard<V> {
        let index = (self.hasher.hash_one(key) & self.shard_mask) as usize;
        &self.shards[index]
    }
}

/// Cheaply cloneable handle to a sharded SLRU cache.
pub struct SlruCache<V: CachedValue> {
    inner: Arc<CacheInner<V>>,
}

impl<V: CachedValue> Clone for SlruCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: CachedValue> SlruCache<V> {
    pub fn new(config: SlruCacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        let counters = Arc::new(CacheCounters::default());
        let shard_capacity = (config.capacity / config.shard_count as u64).max(1);
        let shards = (0..config.shard_count)
            .map(|_| Shard::new(&config, shard_capacity, counters.clone()))
            .collect();
        Ok(Self {
            inner: Arc::new(CacheInner {
                shards,
                shard_mask: (config.shard_count - 1) as u64,
                hasher: RandomState::new(),
                counters,
                ghosts_enabled: config.ghost_caches_enabled,
            }),
        })
    }

    /// Returns the value if it is resident right now. Never blocks on an
    /// in-flight insert.
    pub fn find(&self, key: &V::Key) -> Option<Arc<V>> {
        self.inner.shard(key).find(key)
    }

    /// Resident values resolve immediately; in-flight inserts yield a
    /// pending future; evicted-but-alive values are resurrected.
    pub fn lookup(&self, key: &V::Key) -> Option<ValueFuture<V>> {
        self.inner.shard(key).lookup(key)
    }

    /// Starts or joins an insert for `key`.
    pub fn begin_insert(&self, key: &V::Key) -> InsertCookie<V> {
        let (active, future, in_small_ghost, in_large_ghost) =
            self.inner.shard(key).begin_insert(key);
        InsertCookie {
            cache: self.clone(),
            key: key.clone(),
            active,
            future: Some(future),
            in_small_ghost,
            in_large_ghost,
        }
    }

    /// Records a hit for recency without looking the value up.
    pub fn touch(&self, key: &V::Key) {
        self.inner.shard(key).queue_touch(key.clone());
    }

    /// Removes a resident value. Returns false for absent keys and keys
    /// with an insert still in flight.
    pub fn try_remove(&self, key: &V::Key) -> bool {
        self.inner.shard(key).try_remove(key)
    }

    /// Re-reads the weight of a resident value and rebalances.
    pub fn update_weight(&self, key: &V::Key) -> bool {
        self.inner.shard(key).update_weight(key)
    }

    /// Applies a new capacity and segment split to every shard.
    pub fn reconfigure(
        &self,
        capacity: u64,
        younger_size_fraction: f64,
    ) -> Result<(), CacheError> {
        if capacity == 0 {
            return Err(CacheError::InvalidConfig {
                reason: "capacity must be positive".into(),
            });
        }
        if !(younger_size_fraction > 0.0 && younger_size_fraction < 1.0) {
            return Err(CacheError::InvalidConfig {
                reason: format!(
                    "younger_size_fraction must lie in (0, 1), got {younger_size_fraction}"
                ),
            });
        }
        let shard_capacity = (capacity / self.inner.shards.len() as u64).max(1);
        for shard in &self.inner.shards {
            shard.reconfigure(shard_capacity, younger_size_fraction);
        }
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            hits: self.inner.counters.hits.load(Ordering::Relaxed),
            misses: self.inner.counters.misses.load(Ordering::Relaxed),
            evictions: self.inner.counters.evictions.load(Ordering::Relaxed),
            ..CacheStats::default()
        };
        for shard in &self.inner.shards {
            let (resident, pending, weight) = shard.snapshot();
            stats.resident_items += resident;
            stats.pending_items += pending;
            stats.resident_weight += weight;
        }
        stats
    }

    /// `None` when ghost shadows are disabled.
    pub fn ghost_stats(&self) -> Option<CacheGhostStats> {
        if !self.inner.ghosts_enabled {
            return None;
        }
        let mut total = CacheGhostStats::default();
        for shard in &self.inner.shards {
            let (small, large) = shard.ghost_snapshot()?;
            total.small.hits += small.hits;
            total.small.misses += small.misses;
            total.large.hits += large.hits;
            total.large.misses += large.misses;
        }
        Some(total)
    }
}
