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

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::{
    inflight::LoadCell,
    queue::{Link, Linked, Order},
    slab::Token,
    value::{KeyHandle, ValueHandle},
};

/// What an entry currently holds.
pub enum ValueState<V> {
    /// A loaded or put value.
    Ready(ValueHandle<V>),
    /// A load is in flight.
    ///
    /// Without `old` the entry is a placeholder: it is invisible to size, eviction and expiration, and readers
    /// join the load. With `old` the entry is being refreshed and readers keep seeing the old value.
    Loading {
        cell: Arc<LoadCell<V>>,
        old: Option<ValueHandle<V>>,
    },
}

/// A single slot of a segment, linked into the hash chain and both order queues.
pub struct Record<K, V> {
    pub key: KeyHandle<K>,
    pub hash: u64,
    pub state: ValueState<V>,
    pub weight: u64,
    pub write_time: u64,
    access_time: AtomicU64,
    /// Next entry in the same bucket.
    pub next: Option<Token>,
    access: Link,
    write: Link,
}

impl<K, V> Record<K, V> {
    pub fn new(key: KeyHandle<K>, hash: u64, state: ValueState<V>, weight: u64, now: u64) -> Self {
        Self {
            key,
            hash,
            state,
            weight,
            write_time: now,
            access_time: AtomicU64::new(now),
            next: None,
            access: Link::default(),
            write: Link::default(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.state, ValueState::Loading { old: None, .. })
    }

    /// The value visible to readers: the ready value, or the old value of an entry being refreshed.
    pub fn value_handle(&self) -> Option<&ValueHandle<V>> {
        match &self.state {
            ValueState::Ready(handle) => Some(handle),
            ValueState::Loading { old, .. } => old.as_ref(),
        }
    }

    pub fn value(&self) -> Option<Arc<V>> {
        self.value_handle().and_then(ValueHandle::get)
    }

    pub fn loading_cell(&self) -> Option<&Arc<LoadCell<V>>> {
        match &self.state {
            ValueState::Loading { cell, .. } => Some(cell),
            ValueState::Ready(_) => None,
        }
    }

    /// A counted entry whose key or value has been reclaimed.
    pub fn is_collected(&self) -> bool {
        !self.is_placeholder()
            && (self.key.is_reclaimed() || self.value_handle().is_some_and(ValueHandle::is_reclaimed))
    }

    pub fn access_time(&self) -> u64 {
        self.access_time.load(Ordering::Relaxed)
    }

    /// Safe to call under the shared segment lock.
    pub fn touch(&self, now: u64) {
        self.access_time.store(now, Ordering::Relaxed);
    }

    pub fn set_written(&mut self, now: u64) {
        self.write_time = now;
        *self.access_time.get_mut() = now;
    }
}

impl<K, V> Linked for Record<K, V> {
    fn link(&self, order: Order) -> &Link {
        match order {
            Order::Access => &self.access,
            Order::Write => &self.write,
        }
    }

    fn link_mut(&mut self, order: Order) -> &mut Link {
        match order {
            Order::Access => &mut self.access,
            Order::Write => &mut self.write,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Strength;

    #[test]
    fn test_placeholder_and_refresh_states() {
        let key = Arc::new(1u64);
        let cell = LoadCell::new();
        let mut record = Record::new(
            KeyHandle::new(Strength::Strong, &key),
            1,
            ValueState::Loading {
                cell: cell.clone(),
                old: None,
            },
            0,
            5,
        );
        assert!(record.is_placeholder());
        assert!(record.value().is_none());
        assert!(!record.is_collected());

        record.state = ValueState::Loading {
            cell,
            old: Some(ValueHandle::new(Strength::Strong, &Arc::new(10u64))),
        };
        assert!(!record.is_placeholder());
        assert_eq!(record.value().as_deref(), Some(&10));
        assert!(record.loading_cell().is_some());
    }

    #[test]
    fn test_collected_weak_value() {
        let key = Arc::new(1u64);
        let value = Arc::new(2u64);
        let record = Record::new(
            KeyHandle::new(Strength::Strong, &key),
            1,
            ValueState::Ready(ValueHandle::new(Strength::Weak, &value)),
            1,
            0,
        );
        assert!(!record.is_collected());
        drop(value);
        assert!(record.is_collected());
    }

    #[test]
    fn test_timestamps() {
        let key = Arc::new(1u64);
        let mut record: Record<u64, u64> = Record::new(
            KeyHandle::new(Strength::Strong, &key),
            1,
            ValueState::Ready(ValueHandle::new(Strength::Strong, &Arc::new(1))),
            1,
            3,
        );
        record.touch(7);
        assert_eq!((record.write_time, record.access_time()), (3, 7));
        record.set_written(9);
        assert_eq!((record.write_time, record.access_time()), (9, 9));
    }
}
