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

use std::sync::Arc;

use equivalent::Equivalent;
use larder_common::{
    code::{Key, Value},
    event::RemovalCause,
    strict_assert, strict_assert_eq,
    ticker::Ticker,
};
use parking_lot::Mutex;

use crate::{
    eviction::EvictionPolicy,
    expiration::ExpirationPolicy,
    inflight::{Enqueue, LoadCell},
    notifier::RemovalNotifier,
    queue::{Order, OrderQueue},
    raw::Weigher,
    record::{Record, ValueState},
    slab::{Slab, Token},
    stats::StatsCounter,
    value::{KeyHandle, Strength, ValueHandle},
};

/// Largest table length of a single segment.
pub const MAX_TABLE_LEN: usize = 1 << 30;

/// Reads buffered for reordering beyond this are dropped.
const RECENCY_BUFFER_LIMIT: usize = 1 << 12;

/// Configuration and collaborators shared by all segments of one cache.
pub struct SegmentContext<K, V> {
    pub ticker: Arc<dyn Ticker>,
    pub expiration: ExpirationPolicy,
    pub key_strength: Strength,
    pub value_strength: Strength,
    pub weigher: Option<Arc<dyn Weigher<K, V>>>,
    pub refresh_after_write: Option<u64>,
    /// Reads update access time and recency when the cache is bounded or expires after access.
    pub tracks_access: bool,
    pub notifier: RemovalNotifier<K, V>,
    pub stats: StatsCounter,
}

/// Result of a read under the shared lock.
pub enum Lookup<V> {
    Hit { value: Arc<V>, refresh: bool },
    Loading(Arc<LoadCell<V>>),
    Miss,
}

/// An independently locked partition of the cache.
///
/// All methods taking `&mut self` run under the segment's write lock and may queue removal notifications, which
/// the caller delivers after releasing the lock.
pub struct Segment<K, V> {
    table: Vec<Option<Token>>,
    slab: Slab<Record<K, V>>,
    /// Live entries, placeholders excluded.
    count: usize,
    weight: u64,
    threshold: usize,
    mod_count: u64,
    access_queue: OrderQueue,
    write_queue: OrderQueue,
    eviction: EvictionPolicy,
    /// Tokens read under the shared lock, reordered on the next cleanup.
    recency: Mutex<Vec<Token>>,
    context: Arc<SegmentContext<K, V>>,
}

impl<K, V> Segment<K, V>
where
    K: Key,
    V: Value,
{
    pub fn new(table_len: usize, eviction: EvictionPolicy, context: Arc<SegmentContext<K, V>>) -> Self {
        strict_assert!(table_len.is_power_of_two());
        Self {
            table: vec![None; table_len],
            slab: Slab::with_capacity(table_len),
            count: 0,
            weight: 0,
            threshold: table_len * 3 / 4,
            mod_count: 0,
            access_queue: OrderQueue::new(Order::Access),
            write_queue: OrderQueue::new(Order::Write),
            eviction,
            recency: Mutex::new(Vec::new()),
            context,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn weight(&self) -> u64 {
        self.weight
    }

    pub fn table_len(&self) -> usize {
        self.table.len()
    }

    pub fn mod_count(&self) -> u64 {
        self.mod_count
    }

    pub fn eviction(&self) -> &EvictionPolicy {
        &self.eviction
    }

    fn bucket(&self, hash: u64) -> usize {
        hash as usize & (self.table.len() - 1)
    }

    fn find<Q>(&self, hash: u64, key: &Q) -> Option<Token>
    where
        Q: Equivalent<K> + ?Sized,
    {
        let mut cursor = self.table[self.bucket(hash)];
        while let Some(token) = cursor {
            let record = &self.slab[token];
            if record.hash == hash && record.key.matches(key) {
                return Some(token);
            }
            cursor = record.next;
        }
        None
    }

    fn weigh(&self, key: &K, value: &V) -> u64 {
        match &self.context.weigher {
            Some(weigher) => (weigher)(key, value),
            None => 1,
        }
    }

    /// Why a counted entry is no longer readable, if it is not.
    fn stale_cause(&self, record: &Record<K, V>, now: u64) -> Option<RemovalCause> {
        if record.is_placeholder() {
            None
        } else if record.is_collected() {
            Some(RemovalCause::Collected)
        } else if self
            .context
            .expiration
            .is_expired(now, record.write_time, record.access_time())
        {
            Some(RemovalCause::Expired)
        } else {
            None
        }
    }

    fn refresh_due(&self, record: &Record<K, V>, now: u64) -> bool {
        matches!(record.state, ValueState::Ready(_))
            && self
                .context
                .refresh_after_write
                .is_some_and(|refresh| now.saturating_sub(record.write_time) > refresh)
    }

    fn notify(&self, key: Option<Arc<K>>, value: Option<Arc<V>>, cause: RemovalCause) {
        self.context
            .notifier
            .enqueue(&self.context.stats, key, value, cause);
    }

    /// Read path, safe under the shared lock.
    pub fn lookup<Q>(&self, hash: u64, key: &Q, now: u64) -> Lookup<V>
    where
        Q: Equivalent<K> + ?Sized,
    {
        let Some(token) = self.find(hash, key) else {
            return Lookup::Miss;
        };
        let record = &self.slab[token];
        if record.is_placeholder() {
            return match record.loading_cell() {
                Some(cell) => Lookup::Loading(cell.clone()),
                None => Lookup::Miss,
            };
        }
        if self.stale_cause(record, now).is_some() {
            return Lookup::Miss;
        }
        let Some(value) = record.value() else {
            return Lookup::Miss;
        };
        self.record_read(token, record, now);
        Lookup::Hit {
            value,
            refresh: self.refresh_due(record, now),
        }
    }

    fn record_read(&self, token: Token, record: &Record<K, V>, now: u64) {
        if !self.context.tracks_access {
            return;
        }
        record.touch(now);
        let mut recency = self.recency.lock();
        if recency.len() < RECENCY_BUFFER_LIMIT {
            recency.push(token);
        }
    }

    fn drain_recency(&mut self) {
        let tokens = std::mem::take(self.recency.get_mut());
        for token in tokens {
            // Stale tokens belong to entries removed since the read.
            if self.slab.get(token).is_some() {
                self.access_queue.move_to_back(&mut self.slab, token);
            }
        }
    }

    /// Link a new record into its bucket. The caller decides whether it is counted and queued.
    fn link(&mut self, key: &Arc<K>, hash: u64, state: ValueState<V>, weight: u64, now: u64) -> Token {
        if self.slab.len() + 1 > self.threshold {
            self.expand();
        }
        let mut record = Record::new(KeyHandle::new(self.context.key_strength, key), hash, state, weight, now);
        let bucket = self.bucket(hash);
        record.next = self.table[bucket];
        let token = self.slab.insert(record);
        self.table[bucket] = Some(token);
        self.mod_count += 1;
        token
    }

    fn admit(&mut self, token: Token) {
        self.write_queue.push_back(&mut self.slab, token);
        self.access_queue.push_back(&mut self.slab, token);
        self.count += 1;
        self.weight += self.slab[token].weight;
    }

    fn unlink_chain(&mut self, token: Token) {
        let bucket = self.bucket(self.slab[token].hash);
        let next = self.slab[token].next;
        if self.table[bucket] == Some(token) {
            self.table[bucket] = next;
            return;
        }
        let mut cursor = self.table[bucket];
        while let Some(current) = cursor {
            let following = self.slab[current].next;
            if following == Some(token) {
                self.slab[current].next = next;
                return;
            }
            cursor = following;
        }
        panic!("entry {token:?} is missing from its hash chain");
    }

    /// A reclaimed key or value is always reported as collected.
    fn cause_for(&self, token: Token, cause: RemovalCause) -> RemovalCause {
        if self.slab[token].is_collected() {
            RemovalCause::Collected
        } else {
            cause
        }
    }

    fn remove_entry(&mut self, token: Token, cause: RemovalCause) {
        let value = self.slab[token].value();
        self.remove_entry_with(token, cause, value);
    }

    /// Unlink and drop an entry, reporting `value` unless the entry was a placeholder.
    ///
    /// An in-flight load of the entry learns the cause and reports its own value on completion.
    fn remove_entry_with(&mut self, token: Token, cause: RemovalCause, value: Option<Arc<V>>) {
        self.unlink_chain(token);
        self.access_queue.unlink(&mut self.slab, token);
        self.write_queue.unlink(&mut self.slab, token);
        let Some(record) = self.slab.remove(token) else {
            panic!("entry {token:?} vanished while being removed");
        };
        self.mod_count += 1;

        if let Some(cell) = record.loading_cell() {
            cell.displace(cause);
        }
        if !record.is_placeholder() {
            strict_assert!(self.count > 0);
            self.count -= 1;
            self.weight -= record.weight;
            self.notify(record.key.get(), value, cause);
        }
    }

    fn expand(&mut self) {
        let old_len = self.table.len();
        if old_len >= MAX_TABLE_LEN {
            return;
        }
        let new_len = old_len * 2;
        let mut table = vec![None; new_len];
        for token in self.slab.tokens() {
            let record = &mut self.slab[token];
            let bucket = record.hash as usize & (new_len - 1);
            record.next = table[bucket];
            table[bucket] = Some(token);
        }
        self.table = table;
        self.threshold = new_len * 3 / 4;
        tracing::trace!(from = old_len, to = new_len, "[segment]: expand table");
    }

    fn expire_entries(&mut self, now: u64) {
        let expiration = self.context.expiration;
        if !expiration.expires() {
            return;
        }
        self.drain_recency();
        for order in [Order::Write, Order::Access] {
            loop {
                let front = match order {
                    Order::Write => self.write_queue.front(),
                    Order::Access => self.access_queue.front(),
                };
                let Some(token) = front else {
                    break;
                };
                let record = &self.slab[token];
                if !expiration.is_expired(now, record.write_time, record.access_time()) {
                    break;
                }
                self.remove_entry(token, self.cause_for(token, RemovalCause::Expired));
            }
        }
    }

    /// Evict until the segment is within its bound. `newest` is evicted first if it alone exceeds the bound.
    fn evict(&mut self, newest: Option<Token>) {
        if !self.eviction.evicts() {
            return;
        }
        self.drain_recency();

        if let Some(token) = newest {
            if self
                .slab
                .get(token)
                .is_some_and(|r| !r.is_placeholder() && self.eviction.is_over(r.weight))
            {
                self.remove_entry(token, self.cause_for(token, RemovalCause::Size));
            }
        }

        while self.eviction.is_over(self.weight) {
            let queue = match self.eviction.victim_order(self.context.tracks_access) {
                Order::Access => &self.access_queue,
                Order::Write => &self.write_queue,
            };
            let victim = queue.iter(&self.slab).find(|token| self.slab[*token].weight > 0);
            let Some(victim) = victim else {
                panic!(
                    "segment weight {} exceeds its bound {:?} with nothing to evict",
                    self.weight,
                    self.eviction.max_weight()
                );
            };
            self.remove_entry(victim, self.cause_for(victim, RemovalCause::Size));
        }
    }

    fn reclaim_collected(&mut self) {
        if self.context.key_strength == Strength::Strong && self.context.value_strength == Strength::Strong {
            return;
        }
        let collected = self
            .slab
            .iter()
            .filter(|(_, record)| record.is_collected())
            .map(|(token, _)| token)
            .collect::<Vec<_>>();
        for token in collected {
            self.remove_entry(token, RemovalCause::Collected);
        }
    }

    /// Housekeeping that runs before every write.
    fn pre_write_cleanup(&mut self, now: u64) {
        self.reclaim_collected();
        self.expire_entries(now);
    }

    /// Full housekeeping: reorder buffered reads, expire, drop reclaimed entries and evict.
    pub fn run_cleanup(&mut self, now: u64) {
        self.drain_recency();
        self.expire_entries(now);
        self.reclaim_collected();
        self.evict(None);
    }

    /// Claim `key` for loading, or find who already has it.
    pub fn begin_load(&mut self, key: &Arc<K>, hash: u64, now: u64) -> Enqueue<V> {
        self.pre_write_cleanup(now);

        if let Some(token) = self.find(hash, key.as_ref()) {
            let record = &self.slab[token];
            match self.stale_cause(record, now) {
                None => {
                    if record.is_placeholder() {
                        if let Some(cell) = record.loading_cell() {
                            return Enqueue::Wait(cell.clone());
                        }
                    }
                    if let Some(value) = record.value() {
                        if self.context.tracks_access {
                            record.touch(now);
                            self.access_queue.move_to_back(&mut self.slab, token);
                        }
                        return Enqueue::Hit(value);
                    }
                    self.remove_entry(token, RemovalCause::Collected);
                }
                // The old value of an entry being refreshed went stale, so wait for the refresh.
                Some(_) if record.loading_cell().is_some() => {
                    if let Some(cell) = record.loading_cell() {
                        return Enqueue::Wait(cell.clone());
                    }
                }
                Some(cause) => self.remove_entry(token, cause),
            }
        }

        let cell = LoadCell::new();
        self.link(
            key,
            hash,
            ValueState::Loading {
                cell: cell.clone(),
                old: None,
            },
            0,
            now,
        );
        Enqueue::Lead(cell)
    }

    /// Turn a ready entry into a refreshing one if a refresh is due, or unconditionally if `force` is set.
    ///
    /// Returns the refresh cell and the value readers keep seeing meanwhile.
    pub fn begin_refresh(
        &mut self,
        key: &Arc<K>,
        hash: u64,
        now: u64,
        force: bool,
    ) -> Option<(Arc<LoadCell<V>>, Arc<V>)> {
        let token = self.find(hash, key.as_ref())?;
        let record = &self.slab[token];
        if !matches!(record.state, ValueState::Ready(_)) || self.stale_cause(record, now).is_some() {
            return None;
        }
        if !force && !self.refresh_due(record, now) {
            return None;
        }
        let old_value = record.value()?;

        let cell = LoadCell::new();
        let record = &mut self.slab[token];
        let placeholder = ValueState::Loading {
            cell: cell.clone(),
            old: None,
        };
        if let ValueState::Ready(handle) = std::mem::replace(&mut record.state, placeholder) {
            record.state = ValueState::Loading {
                cell: cell.clone(),
                old: Some(handle),
            };
        }
        Some((cell, old_value))
    }

    /// Publish the outcome of the load owning `cell`.
    ///
    /// If the loading entry is still present, the value is stored, or on failure the placeholder is dropped and a
    /// refreshing entry falls back to its old value. If the entry was displaced meanwhile, a loaded value is
    /// reported with the displacement cause instead of being stored.
    pub fn complete_load(&mut self, key: &Arc<K>, hash: u64, cell: &Arc<LoadCell<V>>, loaded: Option<&Arc<V>>, now: u64) {
        self.pre_write_cleanup(now);

        let token = self.find(hash, key.as_ref()).filter(|token| {
            self.slab[*token]
                .loading_cell()
                .is_some_and(|c| Arc::ptr_eq(c, cell))
        });

        match (token, loaded) {
            (Some(token), Some(value)) => {
                let weight = self.weigh(key, value);
                let handle = ValueHandle::new(self.context.value_strength, value);
                let record = &mut self.slab[token];
                let old = match std::mem::replace(&mut record.state, ValueState::Ready(handle)) {
                    ValueState::Loading { old, .. } => old,
                    ValueState::Ready(_) => unreachable!("matched a loading entry"),
                };
                let old_weight = std::mem::replace(&mut record.weight, weight);
                record.set_written(now);

                match old {
                    Some(old) => {
                        self.weight = self.weight - old_weight + weight;
                        self.write_queue.move_to_back(&mut self.slab, token);
                        self.access_queue.move_to_back(&mut self.slab, token);
                        self.notify(Some(key.clone()), old.get(), RemovalCause::Replaced);
                    }
                    None => self.admit(token),
                }
                self.mod_count += 1;
                self.evict(Some(token));
            }
            (Some(token), None) => {
                let record = &mut self.slab[token];
                let placeholder = ValueState::Loading {
                    cell: cell.clone(),
                    old: None,
                };
                match std::mem::replace(&mut record.state, placeholder) {
                    ValueState::Loading { old: Some(old), .. } => record.state = ValueState::Ready(old),
                    _ => self.remove_entry(token, RemovalCause::Explicit),
                }
            }
            (None, Some(value)) => {
                let cause = cell.displaced().unwrap_or(RemovalCause::Explicit);
                self.notify(Some(key.clone()), Some(value.clone()), cause);
            }
            (None, None) => {}
        }
    }

    /// Insert or replace. Returns the replaced value.
    ///
    /// With `only_if_absent`, a live value is left in place and returned instead.
    pub fn insert(&mut self, key: &Arc<K>, hash: u64, value: &Arc<V>, only_if_absent: bool, now: u64) -> Option<Arc<V>> {
        self.pre_write_cleanup(now);
        let weight = self.weigh(key, value);
        let handle = ValueHandle::new(self.context.value_strength, value);

        if let Some(token) = self.find(hash, key.as_ref()) {
            let record = &self.slab[token];
            if let Some(cause) = self.stale_cause(record, now) {
                self.remove_entry(token, cause);
            } else if record.is_placeholder() {
                // The pending load reports its value as replaced when it completes.
                if let Some(cell) = record.loading_cell() {
                    cell.displace(RemovalCause::Replaced);
                }
                let record = &mut self.slab[token];
                record.state = ValueState::Ready(handle);
                record.weight = weight;
                record.set_written(now);
                self.admit(token);
                self.mod_count += 1;
                self.evict(Some(token));
                return None;
            } else {
                let old = record.value();
                if only_if_absent {
                    if self.context.tracks_access {
                        record.touch(now);
                        self.access_queue.move_to_back(&mut self.slab, token);
                    }
                    return old;
                }
                if let Some(cell) = record.loading_cell() {
                    cell.displace(RemovalCause::Replaced);
                }
                self.notify(Some(key.clone()), old.clone(), RemovalCause::Replaced);

                let record = &mut self.slab[token];
                let old_weight = std::mem::replace(&mut record.weight, weight);
                record.state = ValueState::Ready(handle);
                record.set_written(now);
                self.weight = self.weight - old_weight + weight;
                self.write_queue.move_to_back(&mut self.slab, token);
                self.access_queue.move_to_back(&mut self.slab, token);
                self.mod_count += 1;
                self.evict(Some(token));
                return old;
            }
        }

        let token = self.link(key, hash, ValueState::Ready(handle), weight, now);
        self.admit(token);
        self.evict(Some(token));
        None
    }

    /// Remove `key`. Returns the removed value if it was live.
    pub fn remove<Q>(&mut self, hash: u64, key: &Q, now: u64) -> Option<Arc<V>>
    where
        Q: Equivalent<K> + ?Sized,
    {
        self.pre_write_cleanup(now);
        let token = self.find(hash, key)?;
        let record = &self.slab[token];
        let value = record.value();
        let cause = if record.is_collected() {
            RemovalCause::Collected
        } else {
            RemovalCause::Explicit
        };
        self.remove_entry_with(token, cause, value.clone());
        match cause {
            RemovalCause::Explicit => value,
            _ => None,
        }
    }

    /// Remove every entry, placeholders included.
    pub fn clear(&mut self) {
        if self.slab.is_empty() {
            return;
        }
        for token in self.slab.tokens() {
            let cause = if self.slab[token].is_collected() {
                RemovalCause::Collected
            } else {
                RemovalCause::Explicit
            };
            self.remove_entry(token, cause);
        }
        self.recency.get_mut().clear();
        strict_assert_eq!(self.count, 0);
        strict_assert_eq!(self.weight, 0);
        strict_assert!(self.access_queue.is_empty() && self.write_queue.is_empty());
    }

    /// Drop the cache's references to soft values and remove their entries.
    pub fn release_soft_values(&mut self) {
        if self.context.value_strength != Strength::Soft {
            return;
        }
        let released = self
            .slab
            .iter()
            .filter(|(_, record)| !record.is_placeholder())
            .filter_map(|(token, record)| record.value_handle()?.release().map(|value| (token, value)))
            .collect::<Vec<_>>();
        for (token, value) in released {
            self.remove_entry_with(token, RemovalCause::Collected, Some(value));
        }
    }

    pub fn contains<Q>(&self, hash: u64, key: &Q, now: u64) -> bool
    where
        Q: Equivalent<K> + ?Sized,
    {
        self.find(hash, key).is_some_and(|token| {
            let record = &self.slab[token];
            !record.is_placeholder() && self.stale_cause(record, now).is_none()
        })
    }

    /// Live, readable entries.
    pub fn entries(&self, now: u64) -> Vec<(Arc<K>, Arc<V>)> {
        self.slab
            .iter()
            .filter(|(_, record)| self.stale_cause(record, now).is_none())
            .filter_map(|(_, record)| Some((record.key.get()?, record.value()?)))
            .collect()
    }

    /// Check the bookkeeping against the entries. Panics on any mismatch.
    #[cfg(any(test, feature = "test_utils"))]
    pub fn assert_consistent(&self) {
        let live = self
            .slab
            .iter()
            .filter(|(_, record)| !record.is_placeholder())
            .collect::<Vec<_>>();
        assert_eq!(live.len(), self.count, "live entry count");
        assert_eq!(live.iter().map(|(_, r)| r.weight).sum::<u64>(), self.weight, "segment weight");
        assert_eq!(self.access_queue.len(), self.count, "access queue length");
        assert_eq!(self.write_queue.len(), self.count, "write queue length");
        let chained = (0..self.table.len())
            .map(|bucket| std::iter::successors(self.table[bucket], |t| self.slab[*t].next).count())
            .sum::<usize>();
        assert_eq!(chained, self.slab.len(), "hash chain length");
    }
}
