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

use std::{hash::Hash, sync::Arc};

use equivalent::Equivalent;
use itertools::Itertools;
use larder_common::code::{HashBuilder, Key, Value};

use crate::raw::RawCache;

/// A map-like view of a [`Cache`](crate::Cache).
///
/// Every operation goes straight to the cache. Nothing is loaded and nobody waits on a pending load: keys whose
/// load has not completed are absent.
pub struct CacheView<'a, K, V, S> {
    raw: &'a RawCache<K, V, S>,
}

impl<'a, K, V, S> CacheView<'a, K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    pub(crate) fn new(raw: &'a RawCache<K, V, S>) -> Self {
        Self { raw }
    }

    /// Approximate number of live entries.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Whether the cache holds no live entry.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Whether `key` has a live value.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.raw.contains_key(key)
    }

    /// Same as [`Cache::get_if_present`](crate::Cache::get_if_present).
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.raw.get(key)
    }

    /// Insert a value and return the live value it replaced.
    pub fn insert(&self, key: impl Into<Arc<K>>, value: impl Into<Arc<V>>) -> Option<Arc<V>> {
        self.raw.insert(key.into(), value.into())
    }

    /// Insert a value unless the key has a live value, which is returned instead.
    pub fn insert_if_absent(&self, key: impl Into<Arc<K>>, value: impl Into<Arc<V>>) -> Option<Arc<V>> {
        self.raw.insert_if_absent(key.into(), value.into())
    }

    /// Remove the entry of `key` and return its live value.
    pub fn remove<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.raw.remove(key)
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.raw.clear();
    }

    /// Snapshot of the live keys.
    pub fn keys(&self) -> Vec<Arc<K>> {
        self.raw.entries().into_iter().map(|(key, _)| key).collect_vec()
    }

    /// Snapshot of the live values. Equal values are listed once per entry.
    pub fn values(&self) -> Vec<Arc<V>> {
        self.raw.entries().into_iter().map(|(_, value)| value).collect_vec()
    }

    /// Snapshot of the live entries.
    pub fn entries(&self) -> Vec<(Arc<K>, Arc<V>)> {
        self.raw.entries()
    }
}
