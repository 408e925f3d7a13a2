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
    sync::Arc,
    thread::{self, ThreadId},
};

use larder_common::{error::Result, event::RemovalCause};
use parking_lot::{Condvar, Mutex};

/// Outcome of claiming a key for loading under the segment lock.
pub enum Enqueue<V> {
    /// The caller installed the placeholder and must run the loader.
    Lead(Arc<LoadCell<V>>),
    /// Another caller is already loading the key.
    Wait(Arc<LoadCell<V>>),
    /// A live value appeared before the lock was acquired.
    Hit(Arc<V>),
}

struct LoadState<V> {
    /// The thread running the loader, or `None` while a handed-off load waits to be picked up.
    owner: Option<ThreadId>,
    outcome: Option<Result<Arc<V>>>,
    displaced: Option<RemovalCause>,
}

/// The shared result slot of one in-flight load.
///
/// The loading placeholder in the segment and every waiter hold the same cell. The loading thread completes it
/// exactly once, and every waiter observes that same outcome.
pub struct LoadCell<V> {
    state: Mutex<LoadState<V>>,
    done: Condvar,
}

impl<V> LoadCell<V> {
    /// Create a cell owned by the current thread.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LoadState {
                owner: Some(thread::current().id()),
                outcome: None,
                displaced: None,
            }),
            done: Condvar::new(),
        })
    }

    /// Returns `true` when called from the thread that runs the loader.
    pub fn is_loading_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    /// Detach the load from its thread before handing it to another one.
    pub fn release(&self) {
        self.state.lock().owner = None;
    }

    /// Hand the load over to the current thread.
    pub fn claim(&self) {
        self.state.lock().owner = Some(thread::current().id());
    }

    /// Record that the placeholder left the segment before the load finished. The first cause wins.
    ///
    /// Must be called with the segment lock held.
    pub fn displace(&self, cause: RemovalCause) {
        self.state.lock().displaced.get_or_insert(cause);
    }

    pub fn displaced(&self) -> Option<RemovalCause> {
        self.state.lock().displaced
    }

    /// Publish the outcome and wake all waiters. Later completions are ignored.
    pub fn complete(&self, outcome: Result<Arc<V>>) -> bool {
        let mut state = self.state.lock();
        if state.outcome.is_some() {
            return false;
        }
        state.outcome = Some(outcome);
        drop(state);
        self.done.notify_all();
        true
    }

    /// Block until the load completes.
    pub fn wait(&self) -> Result<Arc<V>> {
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            self.done.wait(&mut state);
        }
    }
}
