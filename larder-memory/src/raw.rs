// Copyright 2026 larder Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    hash::Hash,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use equivalent::Equivalent;
use larder_common::{
    code::{HashBuilder, Key, Value},
    error::{Error, Result},
    event::RemovalListener,
    ticker::{duration_to_nanos, Ticker},
};
use parking_lot::RwLock;

use crate::{
    eviction::EvictionPolicy,
    expiration::ExpirationPolicy,
    inflight::{Enqueue, LoadCell},
    notifier::RemovalNotifier,
    segment::{Lookup, Segment, SegmentContext, MAX_TABLE_LEN},
    stats::{CacheStats, StatsCounter},
    value::Strength,
};

/// The weigher for the in-memory cache.
///
/// The weigher assigns each entry its share of the maximum weight.
pub trait Weigher<K, V>: Fn(&K, &V) -> u64 + Send + Sync + 'static {}
impl<K, V, T> Weigher<K, V> for T where T: Fn(&K, &V) -> u64 + Send + Sync + 'static {}

/// Largest number of segments.
pub const MAX_SEGMENTS: usize = 1 << 16;

/// Every 64th read on a segment tries to run its cleanup.
const DRAIN_THRESHOLD: usize = 0x3F;

pub struct RawCacheConfig<K, V, S> {
    pub initial_capacity: usize,
    pub concurrency_level: usize,
    pub max_weight: Option<u64>,
    pub weigher: Option<Arc<dyn Weigher<K, V>>>,
    pub key_strength: Strength,
    pub value_strength: Strength,
    pub expire_after_write: Option<Duration>,
    pub expire_after_access: Option<Duration>,
    pub refresh_after_write: Option<Duration>,
    pub ticker: Arc<dyn Ticker>,
    pub removal_listener: Option<Arc<dyn RemovalListener<K, V>>>,
    pub record_stats: bool,
    pub hash_builder: S,
}

/// Smallest power of two not below the concurrency level. A bounded cache stops splitting once segments would hold
/// fewer than 20 units of weight each.
fn segment_count(concurrency_level: usize, max_weight: Option<u64>) -> usize {
    let level = concurrency_level.min(MAX_SEGMENTS);
    let mut count = 1usize;
    while count < level && max_weight.is_none_or(|max| count as u64 * 20 <= max) {
        count <<= 1;
    }
    count
}

/// Power of two table length holding this segment's share of the initial capacity.
fn segment_table_len(initial_capacity: usize, segments: usize, max_weight: Option<u64>, weighted: bool) -> usize {
    let mut capacity = initial_capacity.min(MAX_TABLE_LEN);
    if let (Some(max), false) = (max_weight, weighted) {
        capacity = capacity.min(usize::try_from(max).unwrap_or(usize::MAX));
    }
    capacity.div_ceil(segments).max(1).next_power_of_two()
}

/// What a loading lookup found.
pub enum Probe<V> {
    /// A live value.
    Hit(Arc<V>),
    /// A live value that is due for refresh. The caller owns the refresh.
    Refresh { old: Arc<V>, cell: Arc<LoadCell<V>> },
    /// Another caller is loading the key.
    Wait(Arc<LoadCell<V>>),
    /// The caller installed the placeholder and must load the key.
    Lead(Arc<LoadCell<V>>),
}

struct SegmentSlot<K, V> {
    segment: RwLock<Segment<K, V>>,
    /// Live entry count published on every write-lock release.
    len: AtomicUsize,
    reads: AtomicUsize,
}

struct RawCacheInner<K, V, S> {
    slots: Vec<SegmentSlot<K, V>>,
    segment_shift: u32,
    hash_builder: S,
    context: Arc<SegmentContext<K, V>>,
}

/// The segmented cache engine shared by the public cache types.
pub struct RawCache<K, V, S> {
    inner: Arc<RawCacheInner<K, V, S>>,
}

impl<K, V, S> Clone for RawCache<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Fails the load if the loader unwinds.
struct LoadGuard<'a, K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    cache: &'a RawCache<K, V, S>,
    key: &'a Arc<K>,
    hash: u64,
    cell: &'a Arc<LoadCell<V>>,
    start: u64,
    armed: bool,
}

impl<K, V, S> Drop for LoadGuard<'_, K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let elapsed = self.cache.now().saturating_sub(self.start);
        self.cache.inner.context.stats.record_load_exception(elapsed);
        self.cache.abandon(self.key, self.hash, self.cell);
    }
}

impl<K, V, S> RawCache<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    pub fn new(config: RawCacheConfig<K, V, S>) -> Self {
        // A zero expiration retains nothing.
        let zero_expiry = config.expire_after_write == Some(Duration::ZERO)
            || config.expire_after_access == Some(Duration::ZERO);
        let max_weight = if zero_expiry { Some(0) } else { config.max_weight };

        let segments = segment_count(config.concurrency_level, max_weight);
        let table_len = segment_table_len(
            config.initial_capacity,
            segments,
            max_weight,
            config.weigher.is_some(),
        );
        let expiration = ExpirationPolicy::new(config.expire_after_write, config.expire_after_access);

        let context = Arc::new(SegmentContext {
            ticker: config.ticker,
            expiration,
            key_strength: config.key_strength,
            value_strength: config.value_strength,
            weigher: config.weigher,
            refresh_after_write: config.refresh_after_write.map(duration_to_nanos),
            tracks_access: max_weight.is_some() || expiration.expires_after_access(),
            notifier: RemovalNotifier::new(config.removal_listener),
            stats: StatsCounter::new(config.record_stats),
        });

        let slots = (0..segments)
            .map(|index| SegmentSlot {
                segment: RwLock::new(Segment::new(
                    table_len,
                    EvictionPolicy::for_segment(max_weight, segments, index),
                    context.clone(),
                )),
                len: AtomicUsize::new(0),
                reads: AtomicUsize::new(0),
            })
            .collect();

        tracing::debug!(
            segments,
            table_len,
            ?max_weight,
            key_strength = ?config.key_strength,
            value_strength = ?config.value_strength,
            "[raw]: cache built"
        );

        Self {
            inner: Arc::new(RawCacheInner {
                slots,
                segment_shift: 64 - segments.trailing_zeros(),
                hash_builder: config.hash_builder,
                context,
            }),
        }
    }

    pub fn segments(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn hash<Q>(&self, key: &Q) -> u64
    where
        Q: Hash + ?Sized,
    {
        self.inner.hash_builder.hash_one(key)
    }

    /// Segments are picked by the high bits of the hash, buckets by the low bits.
    fn segment_index(&self, hash: u64) -> usize {
        match self.inner.segment_shift {
            64 => 0,
            shift => (hash >> shift) as usize,
        }
    }

    fn now(&self) -> u64 {
        self.inner.context.ticker.read()
    }

    /// Run `f` under the write lock of a segment, then deliver the removals it queued.
    fn with_segment<R>(&self, index: usize, f: impl FnOnce(&mut Segment<K, V>) -> R) -> R {
        let slot = &self.inner.slots[index];
        let res = {
            let mut segment = slot.segment.write();
            let res = f(&mut segment);
            slot.len.store(segment.len(), Ordering::Release);
            res
        };
        self.inner.context.notifier.drain();
        res
    }

    fn post_read_cleanup(&self, index: usize) {
        let slot = &self.inner.slots[index];
        if slot.reads.fetch_add(1, Ordering::Relaxed) & DRAIN_THRESHOLD != DRAIN_THRESHOLD {
            return;
        }
        if let Some(mut segment) = slot.segment.try_write() {
            segment.run_cleanup(self.now());
            slot.len.store(segment.len(), Ordering::Release);
        }
        self.inner.context.notifier.drain();
    }

    #[cfg_attr(feature = "tracing", fastrace::trace(name = "larder::memory::raw::get"))]
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let hash = self.hash(key);
        let index = self.segment_index(hash);
        let now = self.now();
        let lookup = self.inner.slots[index].segment.read().lookup(hash, key, now);
        let res = match lookup {
            Lookup::Hit { value, .. } => {
                self.inner.context.stats.record_hits(1);
                Some(value)
            }
            Lookup::Loading(_) | Lookup::Miss => {
                self.inner.context.stats.record_misses(1);
                None
            }
        };
        self.post_read_cleanup(index);
        res
    }

    /// Find a live value, or claim or join the load of `key`.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "larder::memory::raw::probe"))]
    pub fn probe(&self, key: &Arc<K>, hash: u64) -> Probe<V> {
        let index = self.segment_index(hash);
        let stats = &self.inner.context.stats;
        let now = self.now();
        let lookup = self.inner.slots[index]
            .segment
            .read()
            .lookup(hash, key.as_ref(), now);

        match lookup {
            Lookup::Hit { value, refresh } => {
                stats.record_hits(1);
                let refreshing = refresh
                    .then(|| self.with_segment(index, |segment| segment.begin_refresh(key, hash, now, false)))
                    .flatten();
                self.post_read_cleanup(index);
                match refreshing {
                    Some((cell, old)) => Probe::Refresh { old, cell },
                    None => Probe::Hit(value),
                }
            }
            Lookup::Loading(cell) => {
                stats.record_misses(1);
                Probe::Wait(cell)
            }
            Lookup::Miss => match self.with_segment(index, |segment| segment.begin_load(key, hash, now)) {
                Enqueue::Hit(value) => {
                    stats.record_hits(1);
                    Probe::Hit(value)
                }
                Enqueue::Wait(cell) => {
                    stats.record_misses(1);
                    Probe::Wait(cell)
                }
                Enqueue::Lead(cell) => {
                    stats.record_misses(1);
                    Probe::Lead(cell)
                }
            },
        }
    }

    /// Start a refresh of a live entry regardless of its age.
    pub fn begin_refresh(&self, key: &Arc<K>, hash: u64) -> Option<(Arc<LoadCell<V>>, Arc<V>)> {
        let index = self.segment_index(hash);
        let now = self.now();
        self.with_segment(index, |segment| segment.begin_refresh(key, hash, now, true))
    }

    /// Join a load started by another caller.
    pub fn wait(&self, cell: &LoadCell<V>, hash: u64) -> Result<Arc<V>> {
        if cell.is_loading_thread() {
            return Err(Error::recursive_load(hash));
        }
        cell.wait()
    }

    /// Run `loader` for a load or refresh owned by the caller and publish its outcome to the segment and to every
    /// waiter.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "larder::memory::raw::load"))]
    pub fn load<F>(&self, key: &Arc<K>, hash: u64, cell: &Arc<LoadCell<V>>, loader: F) -> Result<Arc<V>>
    where
        F: FnOnce(&K) -> anyhow::Result<Option<V>>,
    {
        let stats = &self.inner.context.stats;
        let mut guard = LoadGuard {
            cache: self,
            key,
            hash,
            cell,
            start: self.now(),
            armed: true,
        };
        let res = loader(key);
        guard.armed = false;

        let now = self.now();
        let elapsed = now.saturating_sub(guard.start);
        let outcome = match res {
            Ok(Some(value)) => {
                stats.record_load_success(elapsed);
                Ok(Arc::new(value))
            }
            Ok(None) => {
                stats.record_load_exception(elapsed);
                Err(Error::null_value().with_context("hash", hash))
            }
            Err(e) => {
                stats.record_load_exception(elapsed);
                Err(Error::load(e).with_context("hash", hash))
            }
        };

        let index = self.segment_index(hash);
        self.with_segment(index, |segment| {
            segment.complete_load(key, hash, cell, outcome.as_ref().ok(), now)
        });
        cell.complete(outcome.clone());
        outcome
    }

    /// Give up a load that will never produce a value. A refreshing entry keeps its old value, and waiters fail with
    /// [`ErrorKind::TaskCancelled`](larder_common::error::ErrorKind::TaskCancelled).
    pub fn abandon(&self, key: &Arc<K>, hash: u64, cell: &Arc<LoadCell<V>>) {
        let now = self.now();
        let index = self.segment_index(hash);
        self.with_segment(index, |segment| segment.complete_load(key, hash, cell, None, now));
        cell.complete(Err(Error::load_cancelled(hash)));
    }

    #[cfg_attr(feature = "tracing", fastrace::trace(name = "larder::memory::raw::insert"))]
    pub fn insert(&self, key: Arc<K>, value: Arc<V>) -> Option<Arc<V>> {
        let hash = self.hash(key.as_ref());
        let now = self.now();
        self.with_segment(self.segment_index(hash), |segment| {
            segment.insert(&key, hash, &value, false, now)
        })
    }

    /// Insert unless a live value exists. Returns the existing value.
    pub fn insert_if_absent(&self, key: Arc<K>, value: Arc<V>) -> Option<Arc<V>> {
        let hash = self.hash(key.as_ref());
        let now = self.now();
        self.with_segment(self.segment_index(hash), |segment| {
            segment.insert(&key, hash, &value, true, now)
        })
    }

    #[cfg_attr(feature = "tracing", fastrace::trace(name = "larder::memory::raw::remove"))]
    pub fn remove<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let hash = self.hash(key);
        let now = self.now();
        self.with_segment(self.segment_index(hash), |segment| segment.remove(hash, key, now))
    }

    /// Clear segment by segment. No two segment locks are ever held together.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "larder::memory::raw::clear"))]
    pub fn clear(&self) {
        for index in 0..self.inner.slots.len() {
            self.with_segment(index, |segment| segment.clear());
        }
        tracing::trace!(segments = self.inner.slots.len(), "[raw]: cleared");
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let hash = self.hash(key);
        let now = self.now();
        self.inner.slots[self.segment_index(hash)]
            .segment
            .read()
            .contains(hash, key, now)
    }

    /// Approximate count of live entries.
    pub fn len(&self) -> usize {
        self.inner
            .slots
            .iter()
            .map(|slot| slot.len.load(Ordering::Acquire))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total weight of live entries.
    pub fn weight(&self) -> u64 {
        self.inner
            .slots
            .iter()
            .map(|slot| slot.segment.read().weight())
            .sum()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.context.stats.snapshot()
    }

    /// Run full housekeeping on every segment.
    pub fn clean_up(&self) {
        for index in 0..self.inner.slots.len() {
            let now = self.now();
            self.with_segment(index, |segment| segment.run_cleanup(now));
        }
    }

    pub fn release_soft_values(&self) {
        for index in 0..self.inner.slots.len() {
            self.with_segment(index, |segment| segment.release_soft_values());
        }
    }

    /// Snapshot of the live entries, segment by segment.
    pub fn entries(&self) -> Vec<(Arc<K>, Arc<V>)> {
        let now = self.now();
        self.inner
            .slots
            .iter()
            .flat_map(|slot| slot.segment.read().entries(now))
            .collect()
    }

    #[cfg(any(test, feature = "test_utils"))]
    pub fn table_lens(&self) -> Vec<usize> {
        self.inner
            .slots
            .iter()
            .map(|slot| slot.segment.read().table_len())
            .collect()
    }

    #[cfg(any(test, feature = "test_utils"))]
    pub fn segment_max_weights(&self) -> Vec<Option<u64>> {
        self.inner
            .slots
            .iter()
            .map(|slot| slot.segment.read().eviction().max_weight())
            .collect()
    }

    #[cfg(any(test, feature = "test_utils"))]
    pub fn assert_consistent(&self) {
        for slot in self.inner.slots.iter() {
            let segment = slot.segment.read();
            segment.assert_consistent();
            assert_eq!(slot.len.load(Ordering::Acquire), segment.len(), "published segment length");
        }
    }

    #[cfg(any(test, feature = "test_utils"))]
    pub fn mod_counts(&self) -> Vec<u64> {
        self.inner
            .slots
            .iter()
            .map(|slot| slot.segment.read().mod_count())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use itertools::Itertools;
    use larder_common::{code::DefaultHasher, ticker::SystemTicker};
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    use super::*;

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<RawCache<u64, u64, DefaultHasher>>();
    }

    fn config(concurrency_level: usize, max_weight: Option<u64>) -> RawCacheConfig<u64, u64, DefaultHasher> {
        RawCacheConfig {
            initial_capacity: 16,
            concurrency_level,
            max_weight,
            weigher: None,
            key_strength: Strength::Strong,
            value_strength: Strength::Strong,
            expire_after_write: None,
            expire_after_access: None,
            refresh_after_write: None,
            ticker: Arc::new(SystemTicker::default()),
            removal_listener: None,
            record_stats: true,
            hash_builder: DefaultHasher::default(),
        }
    }

    #[test]
    fn test_segment_count() {
        assert_eq!(segment_count(4, None), 4);
        assert_eq!(segment_count(1, None), 1);
        assert_eq!(segment_count(3, None), 4);
        assert_eq!(segment_count(1 << 20, None), MAX_SEGMENTS);

        // Bounded caches keep at least 20 units per segment.
        assert_eq!(segment_count(4, Some(0)), 1);
        assert_eq!(segment_count(4, Some(39)), 2);
        assert_eq!(segment_count(4, Some(40)), 4);
        assert_eq!(segment_count(64, Some(100)), 8);
    }

    #[test]
    fn test_segment_count_is_power_of_two() {
        let mut rng = SmallRng::seed_from_u64(114514);
        for _ in 0..1000 {
            let level = rng.random_range(1..=1 << 18);
            let max_weight = rng.random_bool(0.5).then(|| rng.random_range(0..1 << 20));
            let count = segment_count(level, max_weight);
            assert!(count.is_power_of_two());
            assert!(count <= MAX_SEGMENTS);
            assert!(count >= level.min(MAX_SEGMENTS) || max_weight.is_some());
        }
    }

    #[test]
    fn test_segment_table_len() {
        assert_eq!(segment_table_len(16, 4, None, false), 4);
        assert_eq!(segment_table_len(5, 4, None, false), 2);
        assert_eq!(segment_table_len(0, 4, None, false), 1);
        assert_eq!(segment_table_len(16, 1, None, false), 16);
        assert_eq!(segment_table_len(100, 1, Some(10), false), 16);
        assert_eq!(segment_table_len(100, 1, Some(10), true), 128);
        assert_eq!(segment_table_len(usize::MAX, 1, None, false), MAX_TABLE_LEN);
    }

    #[test]
    fn test_default_sizing() {
        let cache = RawCache::new(config(4, None));
        assert_eq!(cache.segments(), 4);
        assert_eq!(cache.table_lens(), vec![4; 4]);
        assert_eq!(cache.segment_max_weights(), vec![None; 4]);
    }

    #[test]
    fn test_bound_distribution() {
        let cache = RawCache::new(config(4, Some(1003)));
        assert_eq!(cache.segment_max_weights(), vec![Some(251), Some(251), Some(251), Some(250)]);

        let cache = RawCache::new(config(4, Some(0)));
        assert_eq!(cache.segments(), 1);
        assert_eq!(cache.segment_max_weights(), vec![Some(0)]);
    }

    #[test]
    fn test_zero_expiry_retains_nothing() {
        let mut config = config(4, None);
        config.expire_after_access = Some(Duration::ZERO);
        let cache = RawCache::new(config);
        assert_eq!(cache.segments(), 1);

        assert_eq!(cache.insert(Arc::new(1), Arc::new(1)), None);
        assert_eq!(cache.get(&1u64), None);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().eviction_count, 1);
    }

    #[test]
    fn test_insert_get_remove() {
        let cache = RawCache::new(config(4, None));
        assert_eq!(cache.insert(Arc::new(1), Arc::new(10)), None);
        assert_eq!(cache.insert(Arc::new(1), Arc::new(11)).as_deref(), Some(&10));
        assert_eq!(cache.insert_if_absent(Arc::new(1), Arc::new(12)).as_deref(), Some(&11));
        assert_eq!(cache.get(&1u64).as_deref(), Some(&11));
        assert!(cache.contains_key(&1u64));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.weight(), 1);

        assert_eq!(cache.remove(&1u64).as_deref(), Some(&11));
        assert_eq!(cache.remove(&1u64), None);
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 0);
        cache.assert_consistent();
    }

    #[test]
    fn test_probe_claims_once() {
        let cache = RawCache::new(config(1, None));
        let key = Arc::new(7u64);
        let hash = cache.hash(key.as_ref());

        let Probe::Lead(cell) = cache.probe(&key, hash) else {
            panic!("first probe must lead");
        };
        assert!(matches!(cache.probe(&key, hash), Probe::Wait(c) if Arc::ptr_eq(&c, &cell)));
        // Placeholders are invisible.
        assert!(cache.is_empty());
        assert!(!cache.contains_key(&7u64));
        assert_eq!(cache.get(&7u64), None);

        let value = cache.load(&key, hash, &cell, |k| Ok(Some(k * 2))).unwrap();
        assert_eq!(*value, 14);
        assert!(matches!(cache.probe(&key, hash), Probe::Hit(v) if *v == 14));
        assert_eq!(cache.len(), 1);
        cache.assert_consistent();
    }

    #[test]
    fn test_recursive_wait_is_rejected() {
        let cache = RawCache::new(config(1, None));
        let key = Arc::new(1u64);
        let hash = cache.hash(key.as_ref());
        let Probe::Lead(cell) = cache.probe(&key, hash) else {
            panic!("first probe must lead");
        };
        let err = cache.wait(&cell, hash).unwrap_err();
        assert_eq!(err.kind(), larder_common::error::ErrorKind::RecursiveLoad);
        cache.load(&key, hash, &cell, |_| Ok(None)).unwrap_err();
        assert!(cache.is_empty());
        cache.assert_consistent();
    }

    #[test]
    fn test_clear_bumps_mod_counts() {
        let cache = RawCache::new(config(4, None));
        for i in 0..64u64 {
            cache.insert(Arc::new(i), Arc::new(i));
        }
        let before = cache.mod_counts();
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.entries().is_empty());
        for (b, a) in before.iter().zip_eq(cache.mod_counts().iter()) {
            assert!(*b == 0 || a > b);
        }
        cache.assert_consistent();
    }

    #[test]
    fn test_table_expands() {
        let cache = RawCache::new(config(1, None));
        assert_eq!(cache.table_lens(), vec![16]);
        for i in 0..100u64 {
            cache.insert(Arc::new(i), Arc::new(i));
        }
        assert_eq!(cache.table_lens(), vec![256]);
        assert_eq!(cache.len(), 100);
        for i in 0..100u64 {
            assert_eq!(cache.get(&i).as_deref(), Some(&i));
        }
        cache.assert_consistent();
    }

    #[test_log::test]
    fn test_fuzzy() {
        const CAPACITY: u64 = 256;

        let cache = RawCache::new(config(8, Some(CAPACITY)));
        let handles = (0..8)
            .map(|i| {
                let cache = cache.clone();
                thread::spawn(move || {
                    let mut rng = SmallRng::seed_from_u64(i);
                    for _ in 0..10000 {
                        let key = rng.random_range(0..1024u64);
                        match rng.random_range(0..100) {
                            0 => cache.clear(),
                            1..=30 => {
                                cache.insert(Arc::new(key), Arc::new(key));
                            }
                            31..=40 => {
                                cache.remove(&key);
                            }
                            41..=50 => {
                                let key = Arc::new(key);
                                let hash = cache.hash(key.as_ref());
                                let value = match cache.probe(&key, hash) {
                                    Probe::Hit(value) => Ok(value),
                                    Probe::Wait(cell) => cache.wait(&cell, hash),
                                    Probe::Lead(cell) | Probe::Refresh { cell, .. } => {
                                        cache.load(&key, hash, &cell, |k| Ok(Some(*k)))
                                    }
                                };
                                assert_eq!(*value.unwrap(), *key);
                            }
                            _ => {
                                if let Some(value) = cache.get(&key) {
                                    assert_eq!(*value, key);
                                }
                            }
                        }
                    }
                })
            })
            .collect_vec();
        for handle in handles {
            handle.join().unwrap();
        }

        cache.assert_consistent();
        assert!(cache.len() as u64 <= CAPACITY);
        assert!(cache.weight() <= CAPACITY);
    }
}
