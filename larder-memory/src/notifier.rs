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
    any::Any,
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use larder_common::{
    code::{Key, Value},
    event::{RemovalCause, RemovalListener, RemovalNotification},
};
use parking_lot::Mutex;

use crate::stats::StatsCounter;

/// Queues removals while segment locks are held and delivers them to the listener once the locks are released.
///
/// A single drainer delivers at a time, so notifications reach the listener in the order they were queued.
pub struct RemovalNotifier<K, V> {
    listener: Option<Arc<dyn RemovalListener<K, V>>>,
    queue: Mutex<VecDeque<RemovalNotification<K, V>>>,
    draining: Mutex<()>,
}

impl<K, V> RemovalNotifier<K, V>
where
    K: Key,
    V: Value,
{
    pub fn new(listener: Option<Arc<dyn RemovalListener<K, V>>>) -> Self {
        Self {
            listener,
            queue: Mutex::new(VecDeque::new()),
            draining: Mutex::new(()),
        }
    }

    /// Record a removal. Called with the segment lock held, so it never calls the listener.
    pub fn enqueue(&self, stats: &StatsCounter, key: Option<Arc<K>>, value: Option<Arc<V>>, cause: RemovalCause) {
        if cause.was_evicted() {
            stats.record_eviction();
        }
        if self.listener.is_some() {
            self.queue
                .lock()
                .push_back(RemovalNotification::new(key, value, cause));
        }
    }

    /// Deliver every queued notification. Must not be called with a segment lock held.
    ///
    /// Returns immediately if another thread is draining. That thread picks up whatever is queued meanwhile.
    pub fn drain(&self) {
        let Some(listener) = &self.listener else {
            return;
        };

        loop {
            let Some(guard) = self.draining.try_lock() else {
                return;
            };
            loop {
                let next = self.queue.lock().pop_front();
                let Some(notification) = next else {
                    break;
                };
                let cause = notification.cause();
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener.on_removal(notification))) {
                    tracing::warn!(
                        ?cause,
                        panic = panic_message(payload.as_ref()),
                        "[notifier]: removal listener panicked"
                    );
                }
            }
            drop(guard);

            // Another thread may have queued after the last pop but failed to take the drain lock.
            if self.queue.lock().is_empty() {
                return;
            }
        }
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
