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

//! Utilities for testing.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use larder_common::{
    code::{Key, Value},
    event::{RemovalCause, RemovalListener, RemovalNotification},
};
use parking_lot::{Mutex, MutexGuard};

/// A removal listener that queues every notification.
#[derive(Debug)]
pub struct QueuingRemovalListener<K, V> {
    notifications: Arc<Mutex<VecDeque<RemovalNotification<K, V>>>>,
}

impl<K, V> Clone for QueuingRemovalListener<K, V> {
    fn clone(&self) -> Self {
        Self {
            notifications: self.notifications.clone(),
        }
    }
}

impl<K, V> Default for QueuingRemovalListener<K, V> {
    fn default() -> Self {
        Self {
            notifications: Default::default(),
        }
    }
}

impl<K, V> RemovalListener<K, V> for QueuingRemovalListener<K, V>
where
    K: Key,
    V: Value,
{
    fn on_removal(&self, notification: RemovalNotification<K, V>) {
        self.notifications.lock().push_back(notification);
    }
}

impl<K, V> QueuingRemovalListener<K, V> {
    /// Get all queued notifications.
    pub fn notifications(&self) -> MutexGuard<'_, VecDeque<RemovalNotification<K, V>>> {
        self.notifications.lock()
    }

    /// Take the oldest queued notification.
    pub fn pop(&self) -> Option<RemovalNotification<K, V>> {
        self.notifications.lock().pop_front()
    }

    /// Number of queued notifications.
    pub fn len(&self) -> usize {
        self.notifications.lock().len()
    }

    /// Whether no notification is queued.
    pub fn is_empty(&self) -> bool {
        self.notifications.lock().is_empty()
    }

    /// Number of queued notifications with `cause`.
    pub fn count(&self, cause: RemovalCause) -> usize {
        self.notifications.lock().iter().filter(|n| n.cause() == cause).count()
    }
}

/// A removal listener that only counts notifications.
#[derive(Debug, Clone, Default)]
pub struct CountingRemovalListener {
    count: Arc<AtomicU64>,
}

impl<K, V> RemovalListener<K, V> for CountingRemovalListener
where
    K: Key,
    V: Value,
{
    fn on_removal(&self, _: RemovalNotification<K, V>) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

impl CountingRemovalListener {
    /// Number of delivered notifications.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// A loader that maps every key to itself and counts its calls.
#[derive(Debug, Clone, Default)]
pub struct IdentityLoader {
    calls: Arc<AtomicU64>,
}

impl IdentityLoader {
    /// Number of loads run.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl<K> crate::cache::CacheLoader<K, K> for IdentityLoader
where
    K: Key + Clone,
{
    fn load(&self, key: &K) -> anyhow::Result<Option<K>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(Some(key.clone()))
    }
}
