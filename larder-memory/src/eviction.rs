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

use crate::queue::Order;

/// Segment-local share of the global size or weight bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionPolicy {
    max_weight: Option<u64>,
}

impl EvictionPolicy {
    /// Split `total` across `segments` so the shares sum to exactly `total`.
    ///
    /// The first `total % segments` segments get one extra unit.
    pub fn for_segment(total: Option<u64>, segments: usize, index: usize) -> Self {
        let max_weight = total.map(|total| {
            let segments = segments as u64;
            let base = total / segments;
            let remainder = total % segments;
            base + u64::from((index as u64) < remainder)
        });
        Self { max_weight }
    }

    pub fn evicts(&self) -> bool {
        self.max_weight.is_some()
    }

    pub fn max_weight(&self) -> Option<u64> {
        self.max_weight
    }

    pub fn is_over(&self, weight: u64) -> bool {
        self.max_weight.is_some_and(|max| weight > max)
    }

    /// Which recency ordering supplies victims.
    pub fn victim_order(&self, tracks_access: bool) -> Order {
        if tracks_access {
            Order::Access
        } else {
            Order::Write
        }
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    #[test]
    fn test_distribution_without_loss() {
        let shares = (0..4)
            .map(|i| EvictionPolicy::for_segment(Some(10), 4, i).max_weight().unwrap())
            .collect_vec();
        assert_eq!(shares, vec![3, 3, 2, 2]);
        assert_eq!(shares.iter().sum::<u64>(), 10);
    }

    #[test]
    fn test_more_segments_than_bound() {
        let shares = (0..4)
            .map(|i| EvictionPolicy::for_segment(Some(2), 4, i).max_weight().unwrap())
            .collect_vec();
        assert_eq!(shares, vec![1, 1, 0, 0]);
    }

    #[test]
    fn test_unbounded() {
        let policy = EvictionPolicy::for_segment(None, 4, 0);
        assert!(!policy.evicts());
        assert!(!policy.is_over(u64::MAX));
    }

    #[test]
    fn test_zero_bound_rejects_everything() {
        let policy = EvictionPolicy::for_segment(Some(0), 1, 0);
        assert!(policy.evicts());
        assert!(!policy.is_over(0));
        assert!(policy.is_over(1));
    }

    #[test]
    fn test_victim_order() {
        let policy = EvictionPolicy::for_segment(Some(1), 1, 0);
        assert_eq!(policy.victim_order(true), Order::Access);
        assert_eq!(policy.victim_order(false), Order::Write);
    }
}
