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

use larder_common::strict_assert;

use crate::slab::{Slab, Token};

/// The recency orderings a segment keeps over its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Least recently accessed first.
    Access,
    /// Least recently written first.
    Write,
}

/// Prev/next tokens of an entry inside one [`OrderQueue`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Link {
    prev: Option<Token>,
    next: Option<Token>,
    linked: bool,
}

impl Link {
    /// Returns `true` if the owner is currently in the queue.
    pub fn is_linked(&self) -> bool {
        self.linked
    }
}

/// Entries that can be threaded through order queues.
pub trait Linked {
    /// The link for the given order.
    fn link(&self, order: Order) -> &Link;
    /// The mutable link for the given order.
    fn link_mut(&mut self, order: Order) -> &mut Link;
}

/// A doubly linked list threaded through the entries of a [`Slab`] by token.
#[derive(Debug)]
pub struct OrderQueue {
    order: Order,
    head: Option<Token>,
    tail: Option<Token>,
    len: usize,
}

impl OrderQueue {
    pub fn new(order: Order) -> Self {
        Self {
            order,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The oldest entry.
    pub fn front(&self) -> Option<Token> {
        self.head
    }

    pub fn push_back<T: Linked>(&mut self, slab: &mut Slab<T>, token: Token) {
        let order = self.order;
        strict_assert!(!slab[token].link(order).is_linked());

        *slab[token].link_mut(order) = Link {
            prev: self.tail,
            next: None,
            linked: true,
        };
        match self.tail {
            Some(tail) => slab[tail].link_mut(order).next = Some(token),
            None => self.head = Some(token),
        }
        self.tail = Some(token);
        self.len += 1;
    }

    /// Unlink the entry. Returns `false` if it was not in the queue.
    pub fn unlink<T: Linked>(&mut self, slab: &mut Slab<T>, token: Token) -> bool {
        let order = self.order;
        let link = *slab[token].link(order);
        if !link.is_linked() {
            return false;
        }

        match link.prev {
            Some(prev) => slab[prev].link_mut(order).next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => slab[next].link_mut(order).prev = link.prev,
            None => self.tail = link.prev,
        }
        *slab[token].link_mut(order) = Link::default();
        self.len -= 1;
        true
    }

    /// Move a linked entry to the back. Entries that are not in the queue are left alone.
    pub fn move_to_back<T: Linked>(&mut self, slab: &mut Slab<T>, token: Token) {
        if self.tail == Some(token) {
            return;
        }
        if self.unlink(slab, token) {
            self.push_back(slab, token);
        }
    }

    /// Iterate from the oldest entry to the newest.
    pub fn iter<'a, T: Linked>(&self, slab: &'a Slab<T>) -> impl Iterator<Item = Token> + 'a {
        let order = self.order;
        std::iter::successors(self.head, move |token| slab[*token].link(order).next)
    }
}
