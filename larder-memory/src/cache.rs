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

use std::{convert::Infallible, fmt::Debug, hash::Hash, ops::Deref, sync::Arc, time::Duration};

use equivalent::Equivalent;
use larder_common::{
    code::{DefaultHasher, HashBuilder, Key, Value},
    error::{Error, Result},
    event::RemovalListener,
    spawn::Spawner,
    ticker::{SystemTicker, Ticker},
};

use crate::{
    inflight::LoadCell,
    raw::{Probe, RawCache, RawCacheConfig, Weigher},
    stats::CacheStats,
    value::Strength,
    view::CacheView,
};

const DEFAULT_INITIAL_CAPACITY: usize = 16;
const DEFAULT_CONCURRENCY_LEVEL: usize = 4;

/// Computes values for a [`LoadingCache`].
///
/// Returning `Ok(None)` means the key has no value. Callers that demanded a value receive an
/// [`ErrorKind::NullValue`](larder_common::error::ErrorKind::NullValue) error.
pub trait CacheLoader<K, V>: Send + Sync + 'static {
    /// Load the value of `key`.
    fn load(&self, key: &K) -> anyhow::Result<Option<V>>;

    /// Compute a replacement for a value that is due for refresh. Defaults to [`CacheLoader::load`].
    #[expect(unused_variables)]
    fn reload(&self, key: &K, old: &V) -> anyhow::Result<Option<V>> {
        self.load(key)
    }
}

impl<K, V, F> CacheLoader<K, V> for F
where
    F: Fn(&K) -> anyhow::Result<Option<V>> + Send + Sync + 'static,
{
    fn load(&self, key: &K) -> anyhow::Result<Option<V>> {
        self(key)
    }
}

/// In-memory cache builder.
///
/// Every option may be set at most once. Setters reject invalid values and conflicts with options set earlier, and
/// [`CacheBuilder::build`] rejects combinations that are incomplete.
pub struct CacheBuilder<K, V, S> {
    initial_capacity: Option<usize>,
    concurrency_level: Option<usize>,
    maximum_size: Option<u64>,
    maximum_weight: Option<u64>,
    weigher: Option<Arc<dyn Weigher<K, V>>>,
    key_strength: Option<Strength>,
    value_strength: Option<Strength>,
    expire_after_write: Option<Duration>,
    expire_after_access: Option<Duration>,
    refresh_after_write: Option<Duration>,
    ticker: Option<Arc<dyn Ticker>>,
    removal_listener: Option<Arc<dyn RemovalListener<K, V>>>,
    record_stats: bool,
    hash_builder: S,
    spawner: Option<Spawner>,
}

impl<K, V, S> Debug for CacheBuilder<K, V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheBuilder")
            .field("initial_capacity", &self.initial_capacity)
            .field("concurrency_level", &self.concurrency_level)
            .field("maximum_size", &self.maximum_size)
            .field("maximum_weight", &self.maximum_weight)
            .field("key_strength", &self.key_strength)
            .field("value_strength", &self.value_strength)
            .field("expire_after_write", &self.expire_after_write)
            .field("expire_after_access", &self.expire_after_access)
            .field("refresh_after_write", &self.refresh_after_write)
            .field("record_stats", &self.record_stats)
            .finish()
    }
}

impl<K, V> Default for CacheBuilder<K, V, DefaultHasher>
where
    K: Key,
    V: Value,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> CacheBuilder<K, V, DefaultHasher>
where
    K: Key,
    V: Value,
{
    /// Create a builder with nothing set.
    pub fn new() -> Self {
        Self {
            initial_capacity: None,
            concurrency_level: None,
            maximum_size: None,
            maximum_weight: None,
            weigher: None,
            key_strength: None,
            value_strength: None,
            expire_after_write: None,
            expire_after_access: None,
            refresh_after_write: None,
            ticker: None,
            removal_listener: None,
            record_stats: false,
            hash_builder: DefaultHasher::default(),
            spawner: None,
        }
    }
}

impl<K, V, S> CacheBuilder<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    /// Set the expected number of entries. Defaults to 16.
    pub fn with_initial_capacity(mut self, initial_capacity: usize) -> Result<Self> {
        if self.initial_capacity.is_some() {
            return Err(Error::already_set("initial_capacity"));
        }
        self.initial_capacity = Some(initial_capacity);
        Ok(self)
    }

    /// Set the expected number of concurrently writing threads. Defaults to 4.
    ///
    /// The cache is split into the smallest power of two segments not below this level.
    pub fn with_concurrency_level(mut self, concurrency_level: usize) -> Result<Self> {
        if self.concurrency_level.is_some() {
            return Err(Error::already_set("concurrency_level"));
        }
        if concurrency_level == 0 {
            return Err(Error::invalid_argument("concurrency_level", "must be positive"));
        }
        self.concurrency_level = Some(concurrency_level);
        Ok(self)
    }

    /// Bound the cache by entry count.
    ///
    /// A bound of zero keeps nothing: every loaded or inserted value is evicted immediately.
    pub fn with_maximum_size(mut self, maximum_size: u64) -> Result<Self> {
        if self.maximum_size.is_some() {
            return Err(Error::already_set("maximum_size"));
        }
        if self.maximum_weight.is_some() {
            return Err(Error::illegal_state("maximum_size", "maximum weight was already set"));
        }
        if self.weigher.is_some() {
            return Err(Error::illegal_state("maximum_size", "maximum size can not be combined with a weigher"));
        }
        self.maximum_size = Some(maximum_size);
        Ok(self)
    }

    /// Bound the cache by total weight. Requires a weigher.
    pub fn with_maximum_weight(mut self, maximum_weight: u64) -> Result<Self> {
        if self.maximum_weight.is_some() {
            return Err(Error::already_set("maximum_weight"));
        }
        if self.maximum_size.is_some() {
            return Err(Error::illegal_state("maximum_weight", "maximum size was already set"));
        }
        self.maximum_weight = Some(maximum_weight);
        Ok(self)
    }

    /// Set the weigher used with [`CacheBuilder::with_maximum_weight`].
    pub fn with_weigher(mut self, weigher: impl Weigher<K, V>) -> Result<Self> {
        if self.weigher.is_some() {
            return Err(Error::already_set("weigher"));
        }
        if self.maximum_size.is_some() {
            return Err(Error::illegal_state("weigher", "weigher can not be combined with maximum size"));
        }
        self.weigher = Some(Arc::new(weigher));
        Ok(self)
    }

    /// Hold keys weakly. Entries are collected once callers drop every `Arc` of their key.
    pub fn with_weak_keys(mut self) -> Result<Self> {
        if let Some(strength) = self.key_strength {
            return Err(Error::illegal_state("key_strength", format!("key strength was already set to {strength:?}")));
        }
        self.key_strength = Some(Strength::Weak);
        Ok(self)
    }

    fn with_value_strength(mut self, strength: Strength) -> Result<Self> {
        if let Some(current) = self.value_strength {
            return Err(Error::illegal_state(
                "value_strength",
                format!("value strength was already set to {current:?}"),
            ));
        }
        self.value_strength = Some(strength);
        Ok(self)
    }

    /// Hold values weakly. Entries are collected once callers drop every `Arc` of their value.
    pub fn with_weak_values(self) -> Result<Self> {
        self.with_value_strength(Strength::Weak)
    }

    /// Hold values softly. [`Cache::release_soft_values`] drops them all.
    pub fn with_soft_values(self) -> Result<Self> {
        self.with_value_strength(Strength::Soft)
    }

    /// Expire entries a fixed time after they were written. Zero keeps nothing.
    pub fn with_expire_after_write(mut self, duration: Duration) -> Result<Self> {
        if self.expire_after_write.is_some() {
            return Err(Error::already_set("expire_after_write"));
        }
        self.expire_after_write = Some(duration);
        Ok(self)
    }

    /// Expire entries a fixed time after they were last read or written. Zero keeps nothing.
    pub fn with_expire_after_access(mut self, duration: Duration) -> Result<Self> {
        if self.expire_after_access.is_some() {
            return Err(Error::already_set("expire_after_access"));
        }
        self.expire_after_access = Some(duration);
        Ok(self)
    }

    /// Reload entries on the first read after they are older than `duration`.
    ///
    /// Readers keep seeing the old value while the reload runs.
    pub fn with_refresh_after_write(mut self, duration: Duration) -> Result<Self> {
        if self.refresh_after_write.is_some() {
            return Err(Error::already_set("refresh_after_write"));
        }
        if duration.is_zero() {
            return Err(Error::invalid_argument("refresh_after_write", "must be positive"));
        }
        self.refresh_after_write = Some(duration);
        Ok(self)
    }

    /// Set the clock used for expiration, refresh and load timing.
    pub fn with_ticker<T: Ticker>(mut self, ticker: Arc<T>) -> Result<Self> {
        if self.ticker.is_some() {
            return Err(Error::already_set("ticker"));
        }
        self.ticker = Some(ticker);
        Ok(self)
    }

    /// Set the listener that observes every removal.
    pub fn with_removal_listener(mut self, listener: impl RemovalListener<K, V>) -> Result<Self> {
        if self.removal_listener.is_some() {
            return Err(Error::already_set("removal_listener"));
        }
        self.removal_listener = Some(Arc::new(listener));
        Ok(self)
    }

    /// Enable [`Cache::stats`].
    pub fn with_record_stats(mut self) -> Self {
        self.record_stats = true;
        self
    }

    /// Set the runtime that runs background reloads of a [`LoadingCache`].
    pub fn with_spawner(mut self, spawner: impl Into<Spawner>) -> Result<Self> {
        if self.spawner.is_some() {
            return Err(Error::already_set("spawner"));
        }
        self.spawner = Some(spawner.into());
        Ok(self)
    }

    /// Set the hash builder.
    pub fn with_hash_builder<OS>(self, hash_builder: OS) -> CacheBuilder<K, V, OS>
    where
        OS: HashBuilder,
    {
        CacheBuilder {
            initial_capacity: self.initial_capacity,
            concurrency_level: self.concurrency_level,
            maximum_size: self.maximum_size,
            maximum_weight: self.maximum_weight,
            weigher: self.weigher,
            key_strength: self.key_strength,
            value_strength: self.value_strength,
            expire_after_write: self.expire_after_write,
            expire_after_access: self.expire_after_access,
            refresh_after_write: self.refresh_after_write,
            ticker: self.ticker,
            removal_listener: self.removal_listener,
            record_stats: self.record_stats,
            hash_builder,
            spawner: self.spawner,
        }
    }

    fn into_config(self) -> Result<(RawCacheConfig<K, V, S>, Option<Spawner>)> {
        match (self.weigher.is_some(), self.maximum_weight.is_some()) {
            (true, false) => return Err(Error::illegal_state("weigher", "weigher requires a maximum weight")),
            (false, true) => return Err(Error::illegal_state("maximum_weight", "maximum weight requires a weigher")),
            _ => {}
        }

        let config = RawCacheConfig {
            initial_capacity: self.initial_capacity.unwrap_or(DEFAULT_INITIAL_CAPACITY),
            concurrency_level: self.concurrency_level.unwrap_or(DEFAULT_CONCURRENCY_LEVEL),
            max_weight: self.maximum_size.or(self.maximum_weight),
            weigher: self.weigher,
            key_strength: self.key_strength.unwrap_or_default(),
            value_strength: self.value_strength.unwrap_or_default(),
            expire_after_write: self.expire_after_write,
            expire_after_access: self.expire_after_access,
            refresh_after_write: self.refresh_after_write,
            ticker: self.ticker.unwrap_or_else(|| Arc::new(SystemTicker::default())),
            removal_listener: self.removal_listener,
            record_stats: self.record_stats,
            hash_builder: self.hash_builder,
        };
        Ok((config, self.spawner))
    }

    /// Build a cache that loads through per-call loaders.
    pub fn build(self) -> Result<Cache<K, V, S>> {
        let (config, spawner) = self.into_config()?;
        Ok(Cache {
            raw: RawCache::new(config),
            spawner,
        })
    }

    /// Build a cache bound to `loader`.
    pub fn build_loading(self, loader: impl CacheLoader<K, V>) -> Result<LoadingCache<K, V, S>> {
        Ok(LoadingCache {
            cache: self.build()?,
            loader: Arc::new(loader),
        })
    }
}

/// A concurrent, segmented, optionally bounded and self-expiring cache.
///
/// Concurrent requests for a missing key run the loader once. Every other caller waits for and shares its outcome.
pub struct Cache<K, V, S = DefaultHasher> {
    raw: RawCache<K, V, S>,
    spawner: Option<Spawner>,
}

impl<K, V, S> Clone for Cache<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            spawner: self.spawner.clone(),
        }
    }
}

impl<K, V, S> Debug for Cache<K, V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").finish_non_exhaustive()
    }
}

impl<K, V> Cache<K, V, DefaultHasher>
where
    K: Key,
    V: Value,
{
    /// Create a cache builder.
    pub fn builder() -> CacheBuilder<K, V, DefaultHasher> {
        CacheBuilder::new()
    }
}

impl<K, V, S> Cache<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    /// Get the value of `key`, loading it with `loader` on a miss.
    ///
    /// If another caller is already loading the key, wait for its outcome instead. Returns
    /// [`ErrorKind::Load`](larder_common::error::ErrorKind::Load) if the loader fails,
    /// [`ErrorKind::NullValue`](larder_common::error::ErrorKind::NullValue) if it returns no value, and
    /// [`ErrorKind::RecursiveLoad`](larder_common::error::ErrorKind::RecursiveLoad) if it asks for the key it is
    /// loading.
    pub fn get<F, E>(&self, key: impl Into<Arc<K>>, loader: F) -> Result<Arc<V>>
    where
        F: FnOnce(&K) -> std::result::Result<Option<V>, E>,
        E: Into<anyhow::Error>,
    {
        let key = key.into();
        let hash = self.raw.hash(key.as_ref());
        match self.raw.probe(&key, hash) {
            Probe::Hit(value) => Ok(value),
            Probe::Wait(cell) => self.raw.wait(&cell, hash),
            Probe::Lead(cell) => self.raw.load(&key, hash, &cell, |k| loader(k).map_err(Into::into)),
            Probe::Refresh { old, cell } => {
                match self.raw.load(&key, hash, &cell, |k| loader(k).map_err(Into::into)) {
                    Ok(value) => Ok(value),
                    Err(e) => {
                        tracing::warn!(error = %e, "[cache]: refresh failed, keeping the old value");
                        Ok(old)
                    }
                }
            }
        }
    }

    /// Get the value of `key`, computing it with an infallible function on a miss.
    pub fn get_with<F>(&self, key: impl Into<Arc<K>>, f: F) -> Result<Arc<V>>
    where
        F: FnOnce(&K) -> V,
    {
        self.get(key, |k| Ok::<_, Infallible>(Some(f(k))))
    }

    /// Get the value of `key` if it is present and live. Never loads or waits.
    pub fn get_if_present<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.raw.get(key)
    }

    /// Insert a value, replacing any value or pending load of the key.
    pub fn insert(&self, key: impl Into<Arc<K>>, value: impl Into<Arc<V>>) {
        self.raw.insert(key.into(), value.into());
    }

    /// Remove the entry of `key`, including a pending load.
    pub fn invalidate<Q>(&self, key: &Q)
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.raw.remove(key);
    }

    /// Remove the entries of all `keys`.
    pub fn invalidate_all_keys<'a, I, Q>(&self, keys: I)
    where
        I: IntoIterator<Item = &'a Q>,
        Q: Hash + Equivalent<K> + ?Sized + 'a,
    {
        for key in keys {
            self.raw.remove(key);
        }
    }

    /// Remove every entry, segment by segment.
    pub fn invalidate_all(&self) {
        self.raw.clear();
    }

    /// Approximate number of live entries.
    pub fn size(&self) -> usize {
        self.raw.len()
    }

    /// Total weight of live entries. Equals [`Cache::size`] without a weigher.
    pub fn weight(&self) -> u64 {
        self.raw.weight()
    }

    /// Snapshot of the statistics. All zero unless stats recording is enabled.
    pub fn stats(&self) -> CacheStats {
        self.raw.stats()
    }

    /// Run pending maintenance now: expiration, reclaimed entries and eviction.
    pub fn clean_up(&self) {
        self.raw.clean_up();
    }

    /// Release every soft value. Their entries are removed as collected.
    pub fn release_soft_values(&self) {
        self.raw.release_soft_values();
    }

    /// A map-like view of the cache.
    pub fn as_map(&self) -> CacheView<'_, K, V, S> {
        CacheView::new(&self.raw)
    }

    /// Number of segments.
    pub fn segments(&self) -> usize {
        self.raw.segments()
    }

    /// Table length of every segment.
    #[cfg(any(test, feature = "test_utils"))]
    pub fn table_lens(&self) -> Vec<usize> {
        self.raw.table_lens()
    }

    /// Share of the bound of every segment.
    #[cfg(any(test, feature = "test_utils"))]
    pub fn segment_max_weights(&self) -> Vec<Option<u64>> {
        self.raw.segment_max_weights()
    }

    /// Structural modification count of every segment.
    #[cfg(any(test, feature = "test_utils"))]
    pub fn mod_counts(&self) -> Vec<u64> {
        self.raw.mod_counts()
    }

    /// Panic if any segment's bookkeeping disagrees with its entries.
    #[cfg(any(test, feature = "test_utils"))]
    pub fn assert_consistent(&self) {
        self.raw.assert_consistent();
    }
}

/// A [`Cache`] bound to a [`CacheLoader`].
pub struct LoadingCache<K, V, S = DefaultHasher> {
    cache: Cache<K, V, S>,
    loader: Arc<dyn CacheLoader<K, V>>,
}

impl<K, V, S> Clone for LoadingCache<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            loader: self.loader.clone(),
        }
    }
}

impl<K, V, S> Debug for LoadingCache<K, V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadingCache").finish_non_exhaustive()
    }
}

impl<K, V, S> Deref for LoadingCache<K, V, S> {
    type Target = Cache<K, V, S>;

    fn deref(&self) -> &Self::Target {
        &self.cache
    }
}

impl<K, V, S> LoadingCache<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    /// Get the value of `key`, loading it on a miss.
    ///
    /// With a spawner configured, a due refresh runs in the background and the current value is returned.
    /// Otherwise the refresh runs on the calling thread.
    pub fn get(&self, key: impl Into<Arc<K>>) -> Result<Arc<V>> {
        let key = key.into();
        let raw = &self.cache.raw;
        let hash = raw.hash(key.as_ref());
        match raw.probe(&key, hash) {
            Probe::Hit(value) => Ok(value),
            Probe::Wait(cell) => raw.wait(&cell, hash),
            Probe::Lead(cell) => raw.load(&key, hash, &cell, |k| self.loader.load(k)),
            Probe::Refresh { old, cell } => Ok(self.reload(key, hash, cell, old)),
        }
    }

    /// Get the values of all `keys` in order, loading the missing ones. Fails on the first failed load.
    pub fn get_all<I>(&self, keys: I) -> Result<Vec<(Arc<K>, Arc<V>)>>
    where
        I: IntoIterator,
        I::Item: Into<Arc<K>>,
    {
        keys.into_iter()
            .map(|key| {
                let key = key.into();
                self.get(key.clone()).map(|value| (key, value))
            })
            .collect()
    }

    /// Reload `key` now, or load it if it is absent.
    ///
    /// Readers keep seeing the current value until the reload completes. A failed reload keeps the current value.
    pub fn refresh(&self, key: impl Into<Arc<K>>) {
        let key = key.into();
        let hash = self.cache.raw.hash(key.as_ref());
        match self.cache.raw.begin_refresh(&key, hash) {
            Some((cell, old)) => {
                self.reload(key, hash, cell, old);
            }
            None => {
                if let Err(e) = self.get(key) {
                    tracing::warn!(error = %e, "[loading cache]: refresh of an absent key failed");
                }
            }
        }
    }

    /// Run a claimed refresh. Returns the value readers should see now.
    fn reload(&self, key: Arc<K>, hash: u64, cell: Arc<LoadCell<V>>, old: Arc<V>) -> Arc<V> {
        match &self.cache.spawner {
            Some(spawner) => {
                cell.release();
                let pending = PendingRefresh {
                    raw: self.cache.raw.clone(),
                    key,
                    hash,
                    cell,
                    started: false,
                };
                let loader = self.loader.clone();
                let current = old.clone();
                let _ = spawner.spawn_blocking(move || pending.run(|k| loader.reload(k, &old)));
                current
            }
            None => match self.cache.raw.load(&key, hash, &cell, |k| self.loader.reload(k, &old)) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(error = %e, "[loading cache]: refresh failed, keeping the old value");
                    old
                }
            },
        }
    }
}

/// A refresh handed to the spawner. Dropping it before it runs restores the old value.
struct PendingRefresh<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    raw: RawCache<K, V, S>,
    key: Arc<K>,
    hash: u64,
    cell: Arc<LoadCell<V>>,
    started: bool,
}

impl<K, V, S> PendingRefresh<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    fn run<F>(mut self, loader: F)
    where
        F: FnOnce(&K) -> anyhow::Result<Option<V>>,
    {
        self.started = true;
        self.cell.claim();
        if let Err(e) = self.raw.load(&self.key, self.hash, &self.cell, loader) {
            tracing::warn!(error = %e, "[loading cache]: background refresh failed, keeping the old value");
        }
    }
}

impl<K, V, S> Drop for PendingRefresh<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    fn drop(&mut self) {
        if !self.started {
            self.raw.abandon(&self.key, self.hash, &self.cell);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{catch_unwind, AssertUnwindSafe},
        sync::{
            atomic::{AtomicU64, Ordering},
            mpsc, Barrier, OnceLock,
        },
        thread,
    };

    use itertools::Itertools;
    use larder_common::{
        error::ErrorKind,
        event::{RemovalCause, RemovalNotification},
        ticker::FakeTicker,
    };

    use super::*;
    use crate::test_utils::{CountingRemovalListener, IdentityLoader, QueuingRemovalListener};

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<Cache<u64, u64>>();
        is_send_sync_static::<LoadingCache<u64, u64>>();
        is_send_sync_static::<CacheBuilder<u64, u64, DefaultHasher>>();
    }

    fn listened() -> (Cache<u64, u64>, QueuingRemovalListener<u64, u64>) {
        let listener = QueuingRemovalListener::default();
        let cache = Cache::builder()
            .with_removal_listener(listener.clone())
            .unwrap()
            .with_record_stats()
            .build()
            .unwrap();
        (cache, listener)
    }

    fn kv(notification: &RemovalNotification<u64, u64>) -> (u64, Option<u64>, RemovalCause) {
        (
            **notification.key().unwrap(),
            notification.value().map(|v| **v),
            notification.cause(),
        )
    }

    #[test_log::test]
    fn test_single_flight() {
        let cache: Cache<u64, u64> = Cache::builder().with_record_stats().build().unwrap();
        let calls = Arc::new(AtomicU64::new(0));
        let barrier = Arc::new(Barrier::new(16));

        let handles = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache.get(1u64, |k| {
                        calls.fetch_add(1, Ordering::Relaxed);
                        thread::sleep(Duration::from_millis(50));
                        Ok::<_, anyhow::Error>(Some(*k + 1))
                    })
                })
            })
            .collect_vec();
        for handle in handles {
            assert_eq!(*handle.join().unwrap().unwrap(), 2);
        }

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        let stats = cache.stats();
        assert_eq!(stats.load_success_count, 1);
        assert_eq!(stats.request_count(), 16);
        cache.assert_consistent();
    }

    #[test_log::test]
    fn test_get_hits_after_load() {
        let (cache, listener) = listened();
        assert_eq!(*cache.get_with(1u64, |k| k * 10).unwrap(), 10);
        assert_eq!(*cache.get_with(1u64, |_| unreachable!()).unwrap(), 10);
        assert_eq!(cache.get_if_present(&1u64).as_deref(), Some(&10));
        assert_eq!(cache.size(), 1);

        let stats = cache.stats();
        assert_eq!(stats.hit_count, 2);
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.load_count(), 1);

        cache.invalidate(&1u64);
        assert_eq!(cache.size(), 0);
        assert_eq!(listener.notifications().iter().map(kv).collect_vec(), vec![(
            1,
            Some(10),
            RemovalCause::Explicit
        )]);
    }

    #[test_log::test]
    fn test_recursive_load() {
        let cache: Cache<u64, u64> = Cache::builder().build().unwrap();
        let inner = cache.clone();
        let value = cache
            .get(1u64, move |k| {
                let err = inner.get_with(*k, |k| *k).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::RecursiveLoad);
                Ok::<_, anyhow::Error>(Some(*k))
            })
            .unwrap();
        assert_eq!(*value, 1);
    }

    #[test_log::test]
    fn test_failure_fans_out_and_is_not_cached() {
        let cache: Cache<u64, u64> = Cache::builder().with_record_stats().build().unwrap();
        let (started_tx, started_rx) = mpsc::channel();

        let leader = {
            let cache = cache.clone();
            thread::spawn(move || {
                cache.get(1u64, |_| {
                    started_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(50));
                    Err(anyhow::anyhow!("backend unavailable"))
                })
            })
        };
        started_rx.recv().unwrap();
        let waiter = cache.get_with(1u64, |_| unreachable!()).unwrap_err();
        let leading = leader.join().unwrap().unwrap_err();

        assert_eq!(waiter.kind(), ErrorKind::Load);
        assert_eq!(leading.kind(), ErrorKind::Load);
        assert!(leading.is_load_failure());
        assert_eq!(leading.source().unwrap().to_string(), "backend unavailable");
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.stats().load_exception_count, 1);

        assert_eq!(*cache.get_with(1u64, |_| 2).unwrap(), 2);
        cache.assert_consistent();
    }

    #[test_log::test]
    fn test_null_value() {
        let (cache, listener) = listened();
        let err = cache.get(1u64, |_| Ok::<_, anyhow::Error>(None)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NullValue);
        assert_eq!(cache.size(), 0);
        assert!(listener.is_empty());
        assert_eq!(cache.stats().load_exception_count, 1);
    }

    #[test_log::test]
    fn test_loader_panic_cancels_waiters() {
        let cache: Cache<u64, u64> = Cache::builder().build().unwrap();
        let (started_tx, started_rx) = mpsc::channel();

        let leader = {
            let cache = cache.clone();
            thread::spawn(move || {
                cache.get_with(1u64, |_| {
                    started_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(50));
                    panic!("loader exploded");
                })
            })
        };
        started_rx.recv().unwrap();
        let err = cache.get_with(1u64, |_| unreachable!()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskCancelled);
        assert!(leader.join().is_err());

        assert_eq!(cache.get_if_present(&1u64), None);
        assert_eq!(*cache.get_with(1u64, |_| 7).unwrap(), 7);
        cache.assert_consistent();

        let res = catch_unwind(AssertUnwindSafe(|| cache.get_with(2u64, |_| panic!("again"))));
        assert!(res.is_err());
        assert_eq!(*cache.get_with(2u64, |_| 8).unwrap(), 8);
    }

    #[test_log::test]
    fn test_clear_during_load() {
        let (cache, listener) = listened();
        let (started_tx, started_rx) = mpsc::channel();
        let (proceed_tx, proceed_rx) = mpsc::channel::<()>();

        let leader = {
            let cache = cache.clone();
            thread::spawn(move || {
                cache.get_with(1u64, |_| {
                    started_tx.send(()).unwrap();
                    proceed_rx.recv().unwrap();
                    42
                })
            })
        };
        started_rx.recv().unwrap();
        cache.invalidate_all();
        proceed_tx.send(()).unwrap();

        // The loader still gets its value, but the cache does not keep it.
        assert_eq!(*leader.join().unwrap().unwrap(), 42);
        assert_eq!(cache.get_if_present(&1u64), None);
        assert_eq!(cache.size(), 0);
        assert_eq!(listener.notifications().iter().map(kv).collect_vec(), vec![(
            1,
            Some(42),
            RemovalCause::Explicit
        )]);
        cache.assert_consistent();
    }

    #[test_log::test]
    fn test_insert_during_load() {
        let (cache, listener) = listened();
        let (started_tx, started_rx) = mpsc::channel();
        let (proceed_tx, proceed_rx) = mpsc::channel::<()>();

        let leader = {
            let cache = cache.clone();
            thread::spawn(move || {
                cache.get_with(1u64, |_| {
                    started_tx.send(()).unwrap();
                    proceed_rx.recv().unwrap();
                    1
                })
            })
        };
        started_rx.recv().unwrap();
        cache.insert(1u64, 100u64);
        proceed_tx.send(()).unwrap();

        assert_eq!(*leader.join().unwrap().unwrap(), 1);
        assert_eq!(cache.get_if_present(&1u64).as_deref(), Some(&100));
        assert_eq!(listener.notifications().iter().map(kv).collect_vec(), vec![(
            1,
            Some(1),
            RemovalCause::Replaced
        )]);
        cache.assert_consistent();
    }

    #[test_log::test]
    fn test_maximum_size_zero() {
        let listener = QueuingRemovalListener::default();
        let cache: Cache<u64, u64> = Cache::builder()
            .with_maximum_size(0)
            .unwrap()
            .with_removal_listener(listener.clone())
            .unwrap()
            .with_record_stats()
            .build()
            .unwrap();
        assert_eq!(cache.segments(), 1);

        let calls = AtomicU64::new(0);
        for _ in 0..3 {
            let value = cache
                .get_with(1u64, |k| {
                    calls.fetch_add(1, Ordering::Relaxed);
                    *k
                })
                .unwrap();
            assert_eq!(*value, 1);
        }
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(cache.size(), 0);
        assert_eq!(listener.count(RemovalCause::Size), 3);
        assert_eq!(cache.stats().eviction_count, 3);

        cache.insert(2u64, 2u64);
        assert_eq!(cache.get_if_present(&2u64), None);
        assert_eq!(listener.count(RemovalCause::Size), 4);
    }

    #[test_log::test]
    fn test_lru_eviction() {
        let listener = QueuingRemovalListener::default();
        let cache: Cache<u64, u64> = Cache::builder()
            .with_concurrency_level(1)
            .unwrap()
            .with_maximum_size(3)
            .unwrap()
            .with_removal_listener(listener.clone())
            .unwrap()
            .build()
            .unwrap();

        for i in 1..=3u64 {
            cache.insert(i, i);
        }
        assert!(cache.get_if_present(&1u64).is_some());
        cache.insert(4u64, 4u64);

        assert_eq!(cache.size(), 3);
        assert_eq!(cache.get_if_present(&2u64), None);
        assert_eq!(listener.notifications().iter().map(kv).collect_vec(), vec![(
            2,
            Some(2),
            RemovalCause::Size
        )]);
        cache.assert_consistent();
    }

    #[test_log::test]
    fn test_weighted_eviction() {
        let listener = QueuingRemovalListener::default();
        let cache: Cache<u64, u64> = Cache::builder()
            .with_concurrency_level(1)
            .unwrap()
            .with_maximum_weight(10)
            .unwrap()
            .with_weigher(|_: &u64, v: &u64| *v)
            .unwrap()
            .with_removal_listener(listener.clone())
            .unwrap()
            .build()
            .unwrap();

        // An entry heavier than the whole bound is evicted at once.
        cache.insert(1u64, 11u64);
        assert_eq!(cache.get_if_present(&1u64), None);
        assert_eq!(listener.pop().as_ref().map(kv), Some((1, Some(11), RemovalCause::Size)));

        cache.insert(2u64, 5u64);
        cache.insert(3u64, 5u64);
        assert_eq!(cache.weight(), 10);
        cache.insert(4u64, 1u64);
        assert_eq!(cache.get_if_present(&2u64), None);
        assert_eq!(cache.weight(), 6);

        // Zero-weight entries are never evicted for size.
        cache.insert(5u64, 0u64);
        cache.insert(6u64, 10u64);
        assert!(cache.get_if_present(&5u64).is_some());
        assert_eq!(cache.weight(), 10);
        cache.assert_consistent();
    }

    #[test_log::test]
    fn test_expire_after_write() {
        let ticker = Arc::new(FakeTicker::new());
        let listener = QueuingRemovalListener::default();
        let cache: Cache<u64, u64> = Cache::builder()
            .with_ticker(ticker.clone())
            .unwrap()
            .with_expire_after_write(Duration::from_secs(1))
            .unwrap()
            .with_removal_listener(listener.clone())
            .unwrap()
            .build()
            .unwrap();

        cache.insert(1u64, 1u64);
        ticker.advance(Duration::from_millis(999));
        assert!(cache.get_if_present(&1u64).is_some());
        ticker.advance(Duration::from_millis(1));
        assert_eq!(cache.get_if_present(&1u64), None);

        cache.clean_up();
        assert_eq!(cache.size(), 0);
        assert_eq!(listener.notifications().iter().map(kv).collect_vec(), vec![(
            1,
            Some(1),
            RemovalCause::Expired
        )]);

        // An expired entry is reloaded.
        assert_eq!(*cache.get_with(1u64, |_| 2).unwrap(), 2);
    }

    #[test_log::test]
    fn test_expire_after_access() {
        let ticker = Arc::new(FakeTicker::new());
        let cache: Cache<u64, u64> = Cache::builder()
            .with_ticker(ticker.clone())
            .unwrap()
            .with_expire_after_access(Duration::from_secs(1))
            .unwrap()
            .build()
            .unwrap();

        cache.insert(1u64, 1u64);
        for _ in 0..5 {
            ticker.advance(Duration::from_millis(600));
            assert!(cache.get_if_present(&1u64).is_some());
        }
        ticker.advance(Duration::from_secs(1));
        assert_eq!(cache.get_if_present(&1u64), None);
    }

    #[test_log::test]
    fn test_expire_after_one_nanosecond() {
        let ticker = Arc::new(FakeTicker::new());
        let cache: Cache<u64, u64> = Cache::builder()
            .with_ticker(ticker.clone())
            .unwrap()
            .with_expire_after_write(Duration::from_nanos(1))
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(*cache.get_with(1u64, |_| 1).unwrap(), 1);
        assert!(cache.get_if_present(&1u64).is_some());
        ticker.advance_nanos(1);
        assert_eq!(cache.get_if_present(&1u64), None);
    }

    #[test_log::test]
    fn test_zero_expiry_keeps_nothing() {
        let listener = CountingRemovalListener::default();
        let cache: Cache<u64, u64> = Cache::builder()
            .with_expire_after_write(Duration::ZERO)
            .unwrap()
            .with_removal_listener(listener.clone())
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(*cache.get_with(1u64, |_| 1).unwrap(), 1);
        assert_eq!(cache.size(), 0);
        assert_eq!(listener.count(), 1);
    }

    #[test_log::test]
    fn test_refresh_inline() {
        let ticker = Arc::new(FakeTicker::new());
        let listener = QueuingRemovalListener::default();
        let cache: Cache<u64, u64> = Cache::builder()
            .with_ticker(ticker.clone())
            .unwrap()
            .with_refresh_after_write(Duration::from_secs(1))
            .unwrap()
            .with_removal_listener(listener.clone())
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(*cache.get_with(1u64, |_| 1).unwrap(), 1);
        ticker.advance(Duration::from_secs(1));
        // Not yet due: the age must exceed the refresh interval.
        assert_eq!(*cache.get_with(1u64, |_| unreachable!()).unwrap(), 1);

        ticker.advance_nanos(1);
        assert_eq!(*cache.get_with(1u64, |_| 2).unwrap(), 2);
        assert_eq!(listener.notifications().iter().map(kv).collect_vec(), vec![(
            1,
            Some(1),
            RemovalCause::Replaced
        )]);

        // A failed refresh keeps the old value.
        ticker.advance(Duration::from_secs(2));
        let value = cache
            .get(1u64, |_| Err::<Option<u64>, _>(anyhow::anyhow!("refresh failed")))
            .unwrap();
        assert_eq!(*value, 2);
        assert_eq!(cache.get_if_present(&1u64).as_deref(), Some(&2));
        assert_eq!(cache.size(), 1);
        cache.assert_consistent();
    }

    #[test_log::test]
    fn test_soft_values() {
        let listener = QueuingRemovalListener::default();
        let cache: Cache<u64, u64> = Cache::builder()
            .with_soft_values()
            .unwrap()
            .with_removal_listener(listener.clone())
            .unwrap()
            .build()
            .unwrap();

        for i in 0..4u64 {
            cache.insert(i, i);
        }
        assert_eq!(cache.size(), 4);
        cache.release_soft_values();
        assert_eq!(cache.size(), 0);
        assert_eq!(listener.count(RemovalCause::Collected), 4);
        assert!(listener.notifications().iter().all(|n| n.value().is_some()));
        cache.assert_consistent();
    }

    #[test_log::test]
    fn test_weak_values() {
        let listener = QueuingRemovalListener::default();
        let cache: Cache<u64, u64> = Cache::builder()
            .with_weak_values()
            .unwrap()
            .with_removal_listener(listener.clone())
            .unwrap()
            .build()
            .unwrap();

        let value = Arc::new(5u64);
        cache.insert(1u64, value.clone());
        assert_eq!(cache.get_if_present(&1u64).as_deref(), Some(&5));
        drop(value);
        assert_eq!(cache.get_if_present(&1u64), None);

        cache.clean_up();
        assert_eq!(cache.size(), 0);
        assert_eq!(listener.notifications().iter().map(kv).collect_vec(), vec![(
            1,
            None,
            RemovalCause::Collected
        )]);
    }

    #[test_log::test]
    fn test_weak_keys() {
        let listener = QueuingRemovalListener::default();
        let cache: Cache<u64, u64> = Cache::builder()
            .with_weak_keys()
            .unwrap()
            .with_removal_listener(listener.clone())
            .unwrap()
            .build()
            .unwrap();

        let key = Arc::new(1u64);
        cache.insert(key.clone(), 1u64);
        // Weak keys still compare by equality.
        assert!(cache.get_if_present(&1u64).is_some());
        drop(key);
        assert_eq!(cache.get_if_present(&1u64), None);

        cache.clean_up();
        assert_eq!(cache.size(), 0);
        let notification = listener.pop().unwrap();
        assert_eq!(notification.key(), None);
        assert_eq!(notification.cause(), RemovalCause::Collected);
    }

    #[test_log::test]
    fn test_reentrant_listener() {
        let slot: Arc<OnceLock<Cache<u64, u64>>> = Arc::default();
        let cache: Cache<u64, u64> = {
            let slot = slot.clone();
            Cache::builder()
                .with_removal_listener(move |n: RemovalNotification<u64, u64>| {
                    let cache = slot.get().unwrap();
                    let key = **n.key().unwrap();
                    if key < 1000 {
                        cache.insert(key + 1000, key);
                        assert!(cache.get_if_present(&key).is_none());
                    }
                })
                .unwrap()
                .build()
                .unwrap()
        };
        slot.set(cache.clone()).unwrap();

        cache.insert(1u64, 1u64);
        cache.invalidate(&1u64);
        assert_eq!(cache.get_if_present(&1001u64).as_deref(), Some(&1));
        cache.assert_consistent();
    }

    #[test_log::test]
    fn test_panicking_listener() {
        let cache: Cache<u64, u64> = Cache::builder()
            .with_removal_listener(|_: RemovalNotification<u64, u64>| panic!("listener exploded"))
            .unwrap()
            .build()
            .unwrap();
        for i in 0..8u64 {
            cache.insert(i, i);
            cache.insert(i, i + 1);
        }
        cache.invalidate_all_keys(&[0u64, 1, 2]);
        assert_eq!(cache.size(), 5);
        cache.invalidate_all();
        assert_eq!(cache.size(), 0);
        cache.assert_consistent();
    }

    #[test_log::test]
    fn test_builder_rejects_repeated_options() {
        fn kind<T>(res: Result<T>) -> ErrorKind {
            res.map(|_| ()).unwrap_err().kind()
        }
        fn b() -> CacheBuilder<u64, u64, DefaultHasher> {
            Cache::builder()
        }

        let secs = Duration::from_secs(1);
        let cases = [
            kind(b().with_initial_capacity(1).unwrap().with_initial_capacity(1)),
            kind(b().with_concurrency_level(1).unwrap().with_concurrency_level(1)),
            kind(b().with_maximum_size(1).unwrap().with_maximum_size(1)),
            kind(b().with_maximum_weight(1).unwrap().with_maximum_weight(1)),
            kind(b().with_weigher(|_: &u64, _: &u64| 1).unwrap().with_weigher(|_: &u64, _: &u64| 1)),
            kind(b().with_weak_keys().unwrap().with_weak_keys()),
            kind(b().with_weak_values().unwrap().with_soft_values()),
            kind(b().with_soft_values().unwrap().with_weak_values()),
            kind(b().with_expire_after_write(secs).unwrap().with_expire_after_write(secs)),
            kind(b().with_expire_after_access(secs).unwrap().with_expire_after_access(secs)),
            kind(b().with_refresh_after_write(secs).unwrap().with_refresh_after_write(secs)),
            kind(b().with_ticker(Arc::new(FakeTicker::new())).unwrap().with_ticker(Arc::new(FakeTicker::new()))),
            kind(
                b().with_removal_listener(CountingRemovalListener::default())
                    .unwrap()
                    .with_removal_listener(CountingRemovalListener::default()),
            ),
        ];
        assert!(cases.iter().all(|kind| *kind == ErrorKind::IllegalState), "{cases:?}");
    }

    #[test_log::test]
    fn test_builder_rejects_conflicts() {
        fn b() -> CacheBuilder<u64, u64, DefaultHasher> {
            Cache::builder()
        }

        assert_eq!(b().with_concurrency_level(0).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(b().with_refresh_after_write(Duration::ZERO).unwrap_err().kind(), ErrorKind::InvalidArgument);

        let err = b().with_maximum_size(1).unwrap().with_maximum_weight(1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        let err = b().with_maximum_weight(1).unwrap().with_maximum_size(1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        let err = b().with_maximum_size(1).unwrap().with_weigher(|_: &u64, _: &u64| 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        let err = b().with_weigher(|_: &u64, _: &u64| 1).unwrap().with_maximum_size(1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);

        let err = b().with_weigher(|_: &u64, _: &u64| 1).unwrap().build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        let err = b().with_maximum_weight(1).unwrap().build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);

        // Zero capacity and zero expiry are legal.
        b().with_initial_capacity(0)
            .unwrap()
            .with_expire_after_access(Duration::ZERO)
            .unwrap()
            .build()
            .unwrap();
    }

    #[test_log::test]
    fn test_record_stats_is_idempotent() {
        let cache: Cache<u64, u64> = Cache::builder().with_record_stats().with_record_stats().build().unwrap();
        cache.get_with(1u64, |k| *k).unwrap();
        assert_eq!(cache.stats().miss_count, 1);

        let cache: Cache<u64, u64> = Cache::builder().build().unwrap();
        cache.get_with(1u64, |k| *k).unwrap();
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test_log::test]
    fn test_loading_cache() {
        let loader = IdentityLoader::default();
        let cache: LoadingCache<u64, u64> = Cache::builder().build_loading(loader.clone()).unwrap();

        assert_eq!(*cache.get(3u64).unwrap(), 3);
        assert_eq!(*cache.get(3u64).unwrap(), 3);
        assert_eq!(loader.calls(), 1);

        let all = cache.get_all([1u64, 2, 3]).unwrap();
        assert_eq!(all.iter().map(|(k, v)| (**k, **v)).collect_vec(), vec![(1, 1), (2, 2), (3, 3)]);
        assert_eq!(loader.calls(), 3);
        assert_eq!(cache.size(), 3);

        cache.refresh(3u64);
        assert_eq!(loader.calls(), 4);
        cache.refresh(4u64);
        assert_eq!(loader.calls(), 5);
        assert_eq!(cache.get_if_present(&4u64).as_deref(), Some(&4));
    }

    #[test_log::test]
    fn test_loading_cache_get_all_fails_fast() {
        let cache: LoadingCache<u64, u64> = Cache::builder()
            .build_loading(|k: &u64| -> anyhow::Result<Option<u64>> {
                match k {
                    2 => Ok(None),
                    k => Ok(Some(*k)),
                }
            })
            .unwrap();
        let err = cache.get_all([1u64, 2, 3]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NullValue);
        assert!(cache.get_if_present(&1u64).is_some());
        assert!(cache.get_if_present(&3u64).is_none());
    }

    struct Versioned;

    impl CacheLoader<u64, u64> for Versioned {
        fn load(&self, _: &u64) -> anyhow::Result<Option<u64>> {
            Ok(Some(0))
        }

        fn reload(&self, _: &u64, old: &u64) -> anyhow::Result<Option<u64>> {
            Ok(Some(old + 1))
        }
    }

    #[test_log::test]
    fn test_loading_cache_reload() {
        let ticker = Arc::new(FakeTicker::new());
        let cache: LoadingCache<u64, u64> = Cache::builder()
            .with_ticker(ticker.clone())
            .unwrap()
            .with_refresh_after_write(Duration::from_secs(1))
            .unwrap()
            .build_loading(Versioned)
            .unwrap();

        assert_eq!(*cache.get(1u64).unwrap(), 0);
        for version in 1..=3 {
            ticker.advance(Duration::from_secs(2));
            assert_eq!(*cache.get(1u64).unwrap(), version);
        }
        cache.refresh(1u64);
        assert_eq!(cache.get_if_present(&1u64).as_deref(), Some(&4));
    }

    #[test_log::test]
    fn test_invalidate_all_keys() {
        let (cache, listener) = listened();
        for key in 1..=5u64 {
            assert_eq!(*cache.get_with(key, |k| k * 10).unwrap(), key * 10);
        }

        cache.invalidate_all_keys([&1u64, &3u64, &5u64, &9u64]);

        assert_eq!(cache.size(), 2);
        for key in [1u64, 3, 5] {
            assert_eq!(cache.get_if_present(&key), None);
        }
        for key in [2u64, 4] {
            assert_eq!(cache.get_if_present(&key).as_deref(), Some(&(key * 10)));
        }
        let removed = listener
            .notifications()
            .iter()
            .map(kv)
            .sorted_by_key(|(key, _, _)| *key)
            .collect_vec();
        assert_eq!(removed, vec![
            (1, Some(10), RemovalCause::Explicit),
            (3, Some(30), RemovalCause::Explicit),
            (5, Some(50), RemovalCause::Explicit),
        ]);
        cache.assert_consistent();
    }

    #[test_log::test]
    fn test_collected_value_reported_on_write() {
        let listener = QueuingRemovalListener::default();
        let cache: Cache<u64, u64> = Cache::builder()
            .with_concurrency_level(1)
            .unwrap()
            .with_maximum_size(1)
            .unwrap()
            .with_weak_values()
            .unwrap()
            .with_removal_listener(listener.clone())
            .unwrap()
            .with_record_stats()
            .build()
            .unwrap();

        cache.insert(1u64, Arc::new(10u64));
        let keep = Arc::new(20u64);
        cache.insert(2u64, keep.clone());

        assert_eq!(listener.notifications().iter().map(kv).collect_vec(), vec![(
            1,
            None,
            RemovalCause::Collected
        )]);
        assert_eq!(cache.get_if_present(&2u64).as_deref(), Some(&20));
        assert_eq!(cache.stats().eviction_count, 1);
        cache.assert_consistent();
    }

    #[test_log::test]
    fn test_collected_key_reclaimed_by_writes() {
        let listener = QueuingRemovalListener::default();
        let cache: Cache<u64, u64> = Cache::builder()
            .with_concurrency_level(1)
            .unwrap()
            .with_weak_keys()
            .unwrap()
            .with_removal_listener(listener.clone())
            .unwrap()
            .build()
            .unwrap();

        let keys = (0..4u64).map(Arc::new).collect_vec();
        for key in &keys {
            cache.insert(key.clone(), **key);
        }
        drop(keys);
        assert_eq!(cache.size(), 4);

        // Writes alone reclaim the dead entries.
        let live = Arc::new(100u64);
        cache.insert(live.clone(), 100u64);
        assert_eq!(cache.size(), 1);
        assert_eq!(listener.count(RemovalCause::Collected), 4);
        assert_eq!(listener.len(), 4);
        cache.assert_consistent();
    }

    #[test_log::test]
    fn test_dropped_background_refresh_keeps_old_value() {
        let ticker = Arc::new(FakeTicker::new());
        let listener = QueuingRemovalListener::default();
        let cache: LoadingCache<u64, u64> = Cache::builder()
            .with_ticker(ticker.clone())
            .unwrap()
            .with_refresh_after_write(Duration::from_secs(1))
            .unwrap()
            .with_removal_listener(listener.clone())
            .unwrap()
            .build_loading(Versioned)
            .unwrap();
        assert_eq!(*cache.get(1u64).unwrap(), 0);

        let key = Arc::new(1u64);
        let hash = cache.cache.raw.hash(&1u64);
        let (cell, old) = cache.cache.raw.begin_refresh(&key, hash).unwrap();
        assert_eq!(*old, 0);
        cell.release();
        drop(PendingRefresh {
            raw: cache.cache.raw.clone(),
            key,
            hash,
            cell: cell.clone(),
            started: false,
        });

        assert_eq!(cell.wait().unwrap_err().kind(), ErrorKind::TaskCancelled);
        assert_eq!(cache.get_if_present(&1u64).as_deref(), Some(&0));
        assert!(listener.is_empty());

        // The entry is ready again, so the next due read refreshes it.
        ticker.advance(Duration::from_secs(2));
        assert_eq!(*cache.get(1u64).unwrap(), 1);
        cache.assert_consistent();
    }

    #[test_log::test]
    fn test_handed_off_refresh_is_not_recursive() {
        let ticker = Arc::new(FakeTicker::new());
        let cache: LoadingCache<u64, u64> = Cache::builder()
            .with_ticker(ticker.clone())
            .unwrap()
            .with_refresh_after_write(Duration::from_secs(1))
            .unwrap()
            .build_loading(Versioned)
            .unwrap();
        assert_eq!(*cache.get(1u64).unwrap(), 0);

        let key = Arc::new(1u64);
        let hash = cache.cache.raw.hash(&1u64);
        let (cell, _) = cache.cache.raw.begin_refresh(&key, hash).unwrap();
        cell.release();
        let pending = PendingRefresh {
            raw: cache.cache.raw.clone(),
            key,
            hash,
            cell: cell.clone(),
            started: false,
        };
        let refresher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            pending.run(|_| Ok(Some(7)));
        });

        // The calling thread no longer owns the load, so it waits for the refresher.
        assert_eq!(*cache.cache.raw.wait(&cell, hash).unwrap(), 7);
        refresher.join().unwrap();
        assert_eq!(cache.get_if_present(&1u64).as_deref(), Some(&7));
        cache.assert_consistent();
    }
}
