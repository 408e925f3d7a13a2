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

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Lock-free counters updated by every cache operation.
///
/// A disabled counter ignores every record call.
#[derive(Debug, Default)]
pub struct StatsCounter {
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    load_successes: AtomicU64,
    load_exceptions: AtomicU64,
    total_load_time: AtomicU64,
    evictions: AtomicU64,
}

impl StatsCounter {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    fn add(&self, counter: &AtomicU64, n: u64) {
        if self.enabled {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn record_hits(&self, n: u64) {
        self.add(&self.hits, n);
    }

    pub fn record_misses(&self, n: u64) {
        self.add(&self.misses, n);
    }

    pub fn record_load_success(&self, nanos: u64) {
        self.add(&self.load_successes, 1);
        self.add(&self.total_load_time, nanos);
    }

    /// Covers both loaders that failed and loaders that returned no value.
    pub fn record_load_exception(&self, nanos: u64) {
        self.add(&self.load_exceptions, 1);
        self.add(&self.total_load_time, nanos);
    }

    pub fn record_eviction(&self) {
        self.add(&self.evictions, 1);
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            load_success_count: self.load_successes.load(Ordering::Relaxed),
            load_exception_count: self.load_exceptions.load(Ordering::Relaxed),
            total_load_time: self.total_load_time.load(Ordering::Relaxed),
            eviction_count: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of cache statistics.
///
/// All counters are monotonic. Use [`CacheStats::minus`] to measure an interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups that found a value.
    pub hit_count: u64,
    /// Lookups that found no value, including those that went on to load one.
    pub miss_count: u64,
    /// Loads that produced a value.
    pub load_success_count: u64,
    /// Loads that failed or produced no value.
    pub load_exception_count: u64,
    /// Nanoseconds spent loading, successful or not.
    pub total_load_time: u64,
    /// Entries removed automatically: expired, collected or evicted by size.
    pub eviction_count: u64,
}

impl CacheStats {
    /// `hit_count + miss_count`.
    pub fn request_count(&self) -> u64 {
        self.hit_count.saturating_add(self.miss_count)
    }

    /// Ratio of hits to requests, `1.0` when there were no requests.
    pub fn hit_rate(&self) -> f64 {
        match self.request_count() {
            0 => 1.0,
            requests => self.hit_count as f64 / requests as f64,
        }
    }

    /// Ratio of misses to requests, `0.0` when there were no requests.
    pub fn miss_rate(&self) -> f64 {
        match self.request_count() {
            0 => 0.0,
            requests => self.miss_count as f64 / requests as f64,
        }
    }

    /// `load_success_count + load_exception_count`.
    pub fn load_count(&self) -> u64 {
        self.load_success_count.saturating_add(self.load_exception_count)
    }

    /// Ratio of failed loads to loads, `0.0` when nothing was loaded.
    pub fn load_exception_rate(&self) -> f64 {
        match self.load_count() {
            0 => 0.0,
            loads => self.load_exception_count as f64 / loads as f64,
        }
    }

    /// Average nanoseconds spent per load.
    pub fn average_load_penalty(&self) -> f64 {
        match self.load_count() {
            0 => 0.0,
            loads => self.total_load_time as f64 / loads as f64,
        }
    }

    /// Counter-wise difference, floored at zero.
    pub fn minus(&self, other: &Self) -> Self {
        Self {
            hit_count: self.hit_count.saturating_sub(other.hit_count),
            miss_count: self.miss_count.saturating_sub(other.miss_count),
            load_success_count: self.load_success_count.saturating_sub(other.load_success_count),
            load_exception_count: self.load_exception_count.saturating_sub(other.load_exception_count),
            total_load_time: self.total_load_time.saturating_sub(other.total_load_time),
            eviction_count: self.eviction_count.saturating_sub(other.eviction_count),
        }
    }

    /// Counter-wise sum.
    pub fn plus(&self, other: &Self) -> Self {
        Self {
            hit_count: self.hit_count.saturating_add(other.hit_count),
            miss_count: self.miss_count.saturating_add(other.miss_count),
            load_success_count: self.load_success_count.saturating_add(other.load_success_count),
            load_exception_count: self.load_exception_count.saturating_add(other.load_exception_count),
            total_load_time: self.total_load_time.saturating_add(other.total_load_time),
            eviction_count: self.eviction_count.saturating_add(other.eviction_count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_counter_records_nothing() {
        let counter = StatsCounter::new(false);
        counter.record_hits(3);
        counter.record_load_success(10);
        counter.record_eviction();
        assert_eq!(counter.snapshot(), CacheStats::default());
    }

    #[test]
    fn test_derived_rates() {
        let counter = StatsCounter::new(true);
        counter.record_hits(3);
        counter.record_misses(1);
        counter.record_load_success(30);
        counter.record_load_exception(10);

        let stats = counter.snapshot();
        assert_eq!(stats.request_count(), 4);
        assert_eq!(stats.hit_rate(), 0.75);
        assert_eq!(stats.miss_rate(), 0.25);
        assert_eq!(stats.load_count(), 2);
        assert_eq!(stats.load_exception_rate(), 0.5);
        assert_eq!(stats.average_load_penalty(), 20.0);
    }

    #[test]
    fn test_empty_rates() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 1.0);
        assert_eq!(stats.miss_rate(), 0.0);
        assert_eq!(stats.average_load_penalty(), 0.0);
    }

    #[test]
    fn test_minus_plus() {
        let a = CacheStats {
            hit_count: 5,
            eviction_count: 2,
            ..Default::default()
        };
        let b = CacheStats {
            hit_count: 7,
            miss_count: 1,
            ..Default::default()
        };
        assert_eq!(a.minus(&b).hit_count, 0);
        assert_eq!(b.minus(&a).hit_count, 2);
        let sum = a.plus(&b);
        assert_eq!((sum.hit_count, sum.miss_count, sum.eviction_count), (12, 1, 2));
    }

    #[test]
    fn test_serialize_snapshot() {
        let stats = CacheStats {
            hit_count: 1,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        let back: CacheStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats);
    }
}
