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

//! A bounded, concurrent and self-expiring in-memory loading cache.
//!
//! Entries live in independently locked segments. Missing keys are loaded once no matter how many callers ask for
//! them concurrently. Entries may be bounded by count or weight, expire after write or access, refresh after
//! write, and be held weakly or softly. Every removal is reported to an optional listener.

mod cache;
mod eviction;
mod expiration;
mod inflight;
mod notifier;
mod prelude;
mod queue;
mod raw;
mod record;
mod segment;
mod slab;
mod stats;
mod value;
mod view;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use prelude::*;
