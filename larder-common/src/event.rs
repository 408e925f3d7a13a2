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

use std::{fmt::Debug, sync::Arc};

/// The reason an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalCause {
    /// Removed by the user, by invalidation, clearing, or removal through the map view.
    Explicit,
    /// The value was replaced by a put or a refresh.
    Replaced,
    /// The key or the value was reclaimed.
    Collected,
    /// The entry outlived its write or access expiration.
    Expired,
    /// The entry was evicted to keep the cache within its size or weight bound.
    Size,
}

impl RemovalCause {
    /// Returns `true` if the entry was removed automatically rather than by the user.
    pub fn was_evicted(&self) -> bool {
        matches!(self, Self::Collected | Self::Expired | Self::Size)
    }
}

/// A key/value pair that left the cache, and why.
///
/// The key or the value is absent if it had already been reclaimed when the entry was removed.
pub struct RemovalNotification<K, V> {
    key: Option<Arc<K>>,
    value: Option<Arc<V>>,
    cause: RemovalCause,
}

impl<K, V> Debug for RemovalNotification<K, V>
where
    K: Debug,
    V: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemovalNotification")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("cause", &self.cause)
            .finish()
    }
}

impl<K, V> Clone for RemovalNotification<K, V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: self.value.clone(),
            cause: self.cause,
        }
    }
}

impl<K, V> RemovalNotification<K, V> {
    /// Create a new removal notification.
    pub fn new(key: Option<Arc<K>>, value: Option<Arc<V>>, cause: RemovalCause) -> Self {
        Self { key, value, cause }
    }

    /// The removed key, if it is still reachable.
    pub fn key(&self) -> Option<&Arc<K>> {
        self.key.as_ref()
    }

    /// The removed value, if it is still reachable.
    pub fn value(&self) -> Option<&Arc<V>> {
        self.value.as_ref()
    }

    /// The removal cause.
    pub fn cause(&self) -> RemovalCause {
        self.cause
    }

    /// Shorthand for `self.cause().was_evicted()`.
    pub fn was_evicted(&self) -> bool {
        self.cause.was_evicted()
    }

    /// Split the notification into its parts.
    pub fn into_parts(self) -> (Option<Arc<K>>, Option<Arc<V>>, RemovalCause) {
        (self.key, self.value, self.cause)
    }
}

/// Trait for the customized removal listener.
///
/// The listener is never called while the cache holds a segment lock, so it may call back into the cache.
/// Panics raised by the listener are caught and logged.
pub trait RemovalListener<K, V>: Send + Sync + 'static {
    /// Called once for every entry that leaves the cache.
    fn on_removal(&self, notification: RemovalNotification<K, V>);
}

impl<K, V, F> RemovalListener<K, V> for F
where
    F: Fn(RemovalNotification<K, V>) + Send + Sync + 'static,
{
    fn on_removal(&self, notification: RemovalNotification<K, V>) {
        self(notification)
    }
}
