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

//! Monotonic nanosecond clocks used for expiration, refresh and load timing.

use std::{
    fmt::Debug,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

/// A monotonic source of nanoseconds.
///
/// Only differences between two readings of the same ticker are meaningful.
pub trait Ticker: Send + Sync + Debug + 'static {
    /// Read the current time in nanoseconds.
    fn read(&self) -> u64;
}

/// Ticker backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemTicker {
    origin: Instant,
}

impl Default for SystemTicker {
    fn default() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Ticker for SystemTicker {
    fn read(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// A manually advanced ticker for tests.
///
/// Every read may optionally advance the clock by a fixed step.
#[derive(Debug, Default)]
pub struct FakeTicker {
    nanos: AtomicU64,
    auto_increment: AtomicU64,
}

impl FakeTicker {
    /// Create a ticker that starts at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward.
    pub fn advance(&self, duration: Duration) -> &Self {
        self.advance_nanos(duration_to_nanos(duration))
    }

    /// Move the clock forward by raw nanoseconds.
    pub fn advance_nanos(&self, nanos: u64) -> &Self {
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
        self
    }

    /// Advance the clock by `step` after every read.
    pub fn set_auto_increment(&self, step: Duration) -> &Self {
        self.auto_increment.store(duration_to_nanos(step), Ordering::SeqCst);
        self
    }
}

impl Ticker for FakeTicker {
    fn read(&self) -> u64 {
        self.nanos
            .fetch_add(self.auto_increment.load(Ordering::SeqCst), Ordering::SeqCst)
    }
}

/// Convert a duration to nanoseconds, saturating at `u64::MAX`.
pub fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
