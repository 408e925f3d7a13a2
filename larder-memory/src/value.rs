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

use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use equivalent::Equivalent;

/// How strongly the cache holds keys or values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strength {
    /// The cache owns a reference and keeps the object alive.
    #[default]
    Strong,
    /// The cache keeps a non-owning reference. The entry is collected once every caller-side [`Arc`] is dropped.
    Weak,
    /// The cache owns a reference that can be released on demand with `release_soft_values`.
    Soft,
}

/// A key as held by an entry.
#[derive(Debug)]
pub enum KeyHandle<K> {
    Strong(Arc<K>),
    Weak(Weak<K>),
}

impl<K> KeyHandle<K> {
    /// Soft keys are not supported and are held strongly.
    pub fn new(strength: Strength, key: &Arc<K>) -> Self {
        match strength {
            Strength::Weak => Self::Weak(Arc::downgrade(key)),
            Strength::Strong | Strength::Soft => Self::Strong(key.clone()),
        }
    }

    pub fn get(&self) -> Option<Arc<K>> {
        match self {
            Self::Strong(key) => Some(key.clone()),
            Self::Weak(key) => key.upgrade(),
        }
    }

    pub fn is_reclaimed(&self) -> bool {
        match self {
            Self::Strong(_) => false,
            Self::Weak(key) => key.strong_count() == 0,
        }
    }

    /// Compare by equality. A reclaimed key matches nothing.
    pub fn matches<Q>(&self, key: &Q) -> bool
    where
        Q: Equivalent<K> + ?Sized,
    {
        match self {
            Self::Strong(k) => key.equivalent(k.as_ref()),
            Self::Weak(k) => k.upgrade().is_some_and(|k| key.equivalent(k.as_ref())),
        }
    }
}

/// A value as held by an entry.
#[derive(Debug)]
pub enum ValueHandle<V> {
    Strong(Arc<V>),
    Weak(Weak<V>),
    Soft(ArcSwapOption<V>),
}

impl<V> ValueHandle<V> {
    pub fn new(strength: Strength, value: &Arc<V>) -> Self {
        match strength {
            Strength::Strong => Self::Strong(value.clone()),
            Strength::Weak => Self::Weak(Arc::downgrade(value)),
            Strength::Soft => Self::Soft(ArcSwapOption::from(Some(value.clone()))),
        }
    }

    /// The value, or `None` once it has been reclaimed.
    pub fn get(&self) -> Option<Arc<V>> {
        match self {
            Self::Strong(value) => Some(value.clone()),
            Self::Weak(value) => value.upgrade(),
            Self::Soft(value) => value.load_full(),
        }
    }

    pub fn is_reclaimed(&self) -> bool {
        match self {
            Self::Strong(_) => false,
            Self::Weak(value) => value.strong_count() == 0,
            Self::Soft(value) => value.load().is_none(),
        }
    }

    /// Drop the cache's own reference to a soft value.
    ///
    /// Returns the released value so it can be reported. Strong and weak handles are left alone.
    pub fn release(&self) -> Option<Arc<V>> {
        match self {
            Self::Soft(value) => value.swap(None),
            Self::Strong(_) | Self::Weak(_) => None,
        }
    }
}
