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
    fmt::Debug,
    ops::{Index, IndexMut},
};

/// A token that addresses an entry in a [`Slab`].
///
/// Tokens carry the generation of the slot they were issued for. A token outlives its entry once the entry is
/// removed, and a stale token never resolves to the entry that later reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    index: u32,
    generation: u32,
}

impl Token {
    fn slot(&self) -> usize {
        self.index as usize
    }
}

enum Slot<T> {
    Vacant { next: Option<u32>, generation: u32 },
    Occupied { value: T, generation: u32 },
}

/// A generational slab that keeps segment entries addressable by stable [`Token`]s.
///
/// Vacant slots form a free list and are reused before the slab grows.
pub struct Slab<T> {
    slots: Vec<Slot<T>>,
    free: Option<u32>,
    len: usize,
}

impl<T> Debug for Slab<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slab")
            .field("capacity", &self.slots.len())
            .field("len", &self.len)
            .finish()
    }
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl<T> Slab<T> {
    /// Create a slab that can hold `capacity` entries before reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: None,
            len: 0,
        }
    }

    /// Count of occupied slots.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a new entry into the slab.
    pub fn insert(&mut self, value: T) -> Token {
        self.len += 1;
        match self.free {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                let Slot::Vacant { next, generation } = *slot else {
                    unreachable!("free list points at an occupied slot");
                };
                self.free = next;
                *slot = Slot::Occupied { value, generation };
                Token { index, generation }
            }
            None => {
                let Ok(index) = u32::try_from(self.slots.len()) else {
                    panic!("slab index overflow: {}", self.slots.len());
                };
                self.slots.push(Slot::Occupied { value, generation: 0 });
                Token { index, generation: 0 }
            }
        }
    }

    /// Remove the entry addressed by `token`.
    ///
    /// Returns `None` if the token is stale.
    pub fn remove(&mut self, token: Token) -> Option<T> {
        let slot = self.slots.get_mut(token.slot())?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == token.generation => {}
            _ => return None,
        }
        let vacant = Slot::Vacant {
            next: self.free,
            generation: token.generation.wrapping_add(1),
        };
        let Slot::Occupied { value, .. } = std::mem::replace(slot, vacant) else {
            unreachable!()
        };
        self.free = Some(token.index);
        self.len -= 1;
        Some(value)
    }

    /// Get the entry addressed by `token`, or `None` if the token is stale.
    pub fn get(&self, token: Token) -> Option<&T> {
        match self.slots.get(token.slot())? {
            Slot::Occupied { value, generation } if *generation == token.generation => Some(value),
            _ => None,
        }
    }

    /// Get the entry addressed by `token` mutably, or `None` if the token is stale.
    pub fn get_mut(&mut self, token: Token) -> Option<&mut T> {
        match self.slots.get_mut(token.slot())? {
            Slot::Occupied { value, generation } if *generation == token.generation => Some(value),
            _ => None,
        }
    }

    /// Iterate over all occupied slots.
    pub fn iter(&self) -> impl Iterator<Item = (Token, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| match slot {
            Slot::Occupied { value, generation } => Some((
                Token {
                    index: index as u32,
                    generation: *generation,
                },
                value,
            )),
            Slot::Vacant { .. } => None,
        })
    }

    /// Tokens of all occupied slots.
    pub fn tokens(&self) -> Vec<Token> {
        self.iter().map(|(token, _)| token).collect()
    }
}

/// Indexing with a stale token means the links of the owning segment are corrupted.
impl<T> Index<Token> for Slab<T> {
    type Output = T;

    fn index(&self, token: Token) -> &Self::Output {
        match self.get(token) {
            Some(value) => value,
            None => panic!("stale slab token: {token:?}"),
        }
    }
}

impl<T> IndexMut<Token> for Slab<T> {
    fn index_mut(&mut self, token: Token) -> &mut Self::Output {
        match self.get_mut(token) {
            Some(value) => value,
            None => panic!("stale slab token: {token:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    #[test]
    fn test_slab_reuse_and_generation() {
        let mut slab = Slab::default();
        let a = slab.insert("a");
        let b = slab.insert("b");
        assert_eq!(slab.len(), 2);

        assert_eq!(slab.remove(a), Some("a"));
        assert_eq!(slab.remove(a), None);
        assert!(slab.get(a).is_none());

        let c = slab.insert("c");
        assert_eq!(c.index, a.index);
        assert_ne!(c, a);
        assert!(slab.get(a).is_none());
        assert_eq!(slab[c], "c");
        assert_eq!(slab[b], "b");

        let values = slab.iter().map(|(_, v)| *v).sorted().collect_vec();
        assert_eq!(values, vec!["b", "c"]);
    }

    #[test]
    #[should_panic(expected = "stale slab token")]
    fn test_stale_index_panics() {
        let mut slab = Slab::default();
        let a = slab.insert(1u64);
        slab.remove(a);
        let _ = slab[a];
    }
}
