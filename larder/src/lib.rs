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

//! A bounded, concurrent, self-expiring loading cache.
//!
//! ```
//! use larder::Cache;
//!
//! let cache: Cache<u64, String> = Cache::builder()
//!     .with_maximum_size(1024)
//!     .unwrap()
//!     .build()
//!     .unwrap();
//!
//! let value = cache.get_with(42u64, |k| k.to_string()).unwrap();
//! assert_eq!(value.as_str(), "42");
//! assert!(cache.get_if_present(&42u64).is_some());
//! ```

pub use larder_common as common;
pub use larder_memory as memory;

mod prelude;
pub use prelude::*;
