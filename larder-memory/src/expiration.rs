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

use std::time::Duration;

use larder_common::ticker::duration_to_nanos;

/// Decides whether an entry has outlived its write or access expiration.
///
/// Both limits are optional and independent, and either one is sufficient to expire an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpirationPolicy {
    after_write: Option<u64>,
    after_access: Option<u64>,
}

impl ExpirationPolicy {
    /// Zero durations are treated as unset. A zero duration bounds the cache to zero weight instead.
    pub fn new(after_write: Option<Duration>, after_access: Option<Duration>) -> Self {
        let nanos = |d: Option<Duration>| d.map(duration_to_nanos).filter(|n| *n > 0);
        Self {
            after_write: nanos(after_write),
            after_access: nanos(after_access),
        }
    }

    pub fn expires(&self) -> bool {
        self.after_write.is_some() || self.after_access.is_some()
    }

    pub fn expires_after_access(&self) -> bool {
        self.after_access.is_some()
    }

    pub fn is_expired(&self, now: u64, write_time: u64, access_time: u64) -> bool {
        self.after_write
            .is_some_and(|ttl| now.saturating_sub(write_time) >= ttl)
            || self
                .after_access
                .is_some_and(|tti| now.saturating_sub(access_time) >= tti)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_never_expires() {
        let policy = ExpirationPolicy::default();
        assert!(!policy.expires());
        assert!(!policy.is_expired(u64::MAX, 0, 0));
    }

    #[test]
    fn test_one_nanosecond() {
        let policy = ExpirationPolicy::new(Some(Duration::from_nanos(1)), None);
        assert!(!policy.is_expired(10, 10, 10));
        assert!(policy.is_expired(11, 10, 10));
    }

    #[test]
    fn test_write_and_access_are_independent() {
        let policy = ExpirationPolicy::new(Some(Duration::from_nanos(100)), Some(Duration::from_nanos(10)));
        assert!(policy.expires() && policy.expires_after_access());
        // Recently accessed but written long ago.
        assert!(policy.is_expired(200, 50, 195));
        // Recently written but idle.
        assert!(policy.is_expired(200, 150, 180));
        assert!(!policy.is_expired(200, 150, 195));
    }

    #[test]
    fn test_zero_is_unset() {
        let policy = ExpirationPolicy::new(Some(Duration::ZERO), Some(Duration::ZERO));
        assert!(!policy.expires());
    }

    #[test]
    fn test_clock_going_backwards_does_not_expire() {
        let policy = ExpirationPolicy::new(Some(Duration::from_nanos(1)), None);
        assert!(!policy.is_expired(5, 10, 10));
    }
}
