// Tessera - Replicated key-value store over a token ring, with tunable consistency and a minimal binary peer protocol
// Copyright (C) 2024  tessera authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use uuid::Uuid;

use crate::node::Node;
use crate::partitioner::Token;

/// An immutable snapshot of the token ring.
///
/// Entries are totally ordered by `(token, node_id)` so that token
/// collisions resolve identically on every node. Mutation builds a new
/// snapshot and swaps it in; readers always hold a consistent view.
#[derive(Clone)]
pub struct Ring {
    entries: Vec<RingEntry>,
    replication_factor: usize,
}

#[derive(Clone)]
struct RingEntry {
    token: Token,
    node: Node,
}

impl Ring {
    pub fn new(nodes: Vec<Node>, replication_factor: usize) -> Ring {
        let mut entries: Vec<RingEntry> = nodes
            .into_iter()
            .map(|node| RingEntry {
                token: node.token(),
                node,
            })
            .collect();

        entries.sort_by_key(|e| (e.token, e.node.node_id()));

        Ring {
            entries,
            replication_factor,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.entries.iter().map(|e| &e.node)
    }

    /// Node ids in ring order.
    pub fn node_ids(&self) -> Vec<Uuid> {
        self.entries.iter().map(|e| e.node.node_id()).collect()
    }

    pub fn index_of(&self, node_id: Uuid) -> Option<usize> {
        self.entries.iter().position(|e| e.node.node_id() == node_id)
    }

    /// Index of the entry owning the token: the last entry whose token is
    /// `<=` the target, wrapping to the ring's end for tokens below every
    /// entry.
    fn position(&self, token: Token) -> usize {
        let after = self.entries.partition_point(|e| e.token <= token);

        (after + self.entries.len() - 1) % self.entries.len()
    }

    /// The owner and replicas for a token: `min(replication factor, ring
    /// size)` consecutive nodes clockwise from the owner.
    pub fn owners_of(&self, token: Token) -> Vec<Node> {
        if self.entries.is_empty() {
            return Vec::new();
        }

        let start = self.position(token);
        let count = self.replication_factor.min(self.entries.len());

        (0..count)
            .map(|i| self.entries[(start + i) % self.entries.len()].node.clone())
            .collect()
    }

    /// The inclusive-exclusive token range the node owns or replicates.
    ///
    /// With no more nodes than the replication factor, every node covers
    /// the full token space.
    pub fn owned_range(&self, node_id: Uuid, max_token: Token) -> Option<(Token, Token)> {
        let idx = self.index_of(node_id)?;
        let n = self.entries.len();

        if n <= self.replication_factor {
            return Some((0, max_token));
        }

        let back = (self.replication_factor.max(1) - 1) % n;
        let from = self.entries[(idx + n - back) % n].token;
        let to = self.entries[(idx + 1) % n].token.wrapping_sub(1);

        Some((from, to))
    }

    /// Left and right neighbours of the node in ring order.
    pub fn neighbors(&self, node_id: Uuid) -> Option<(Node, Node)> {
        let idx = self.index_of(node_id)?;
        let n = self.entries.len();

        Some((
            self.entries[(idx + n - 1) % n].node.clone(),
            self.entries[(idx + 1) % n].node.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::LocalNode;
    use crate::store::{MemoryStore, SharedStore};

    use std::sync::Arc;

    fn node(token: Token) -> Node {
        let store: SharedStore = Arc::new(MemoryStore::new());

        Node::Local(Arc::new(LocalNode::new(
            store,
            "127.0.0.1:4379".parse().unwrap(),
            None,
            None,
            token,
        )))
    }

    fn node_with_id(token: Token, node_id: Uuid) -> Node {
        let store: SharedStore = Arc::new(MemoryStore::new());

        Node::Local(Arc::new(LocalNode::new(
            store,
            "127.0.0.1:4379".parse().unwrap(),
            Some(node_id),
            None,
            token,
        )))
    }

    fn ten_node_ring(replication_factor: usize) -> Ring {
        Ring::new((0..10).map(|i| node(i * 1000)).collect(), replication_factor)
    }

    #[test]
    fn owner_is_the_last_node_at_or_below_the_token() {
        let ring = ten_node_ring(1);

        assert_eq!(ring.owners_of(0)[0].token(), 0);
        assert_eq!(ring.owners_of(999)[0].token(), 0);
        assert_eq!(ring.owners_of(1000)[0].token(), 1000);
        assert_eq!(ring.owners_of(5500)[0].token(), 5000);
        assert_eq!(ring.owners_of(9999)[0].token(), 9000);
    }

    #[test]
    fn replicas_continue_clockwise_and_wrap() {
        let ring = ten_node_ring(3);

        let owners: Vec<Token> = ring.owners_of(8500).iter().map(|n| n.token()).collect();
        assert_eq!(owners, vec![8000, 9000, 0]);
    }

    #[test]
    fn owner_count_is_bounded_by_ring_size() {
        for rf in 0..6 {
            for size in 1..5 {
                let ring = Ring::new((0..size).map(|i| node(i as u128 * 100)).collect(), rf);

                assert_eq!(ring.owners_of(150).len(), rf.min(size));
            }
        }
    }

    #[test]
    fn token_collisions_order_by_node_id() {
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(2);

        // insertion order must not matter
        let a = Ring::new(vec![node_with_id(500, high), node_with_id(500, low)], 1);
        let b = Ring::new(vec![node_with_id(500, low), node_with_id(500, high)], 1);

        assert_eq!(a.node_ids(), vec![low, high]);
        assert_eq!(a.node_ids(), b.node_ids());

        assert_eq!(a.owners_of(600)[0].node_id(), high);
        assert_eq!(b.owners_of(600)[0].node_id(), high);
    }

    #[test]
    fn owned_range_spans_replicated_predecessors() {
        let ring = ten_node_ring(3);

        // the node at 5000 replicates 3000-3999 and 4000-4999, and owns
        // 5000-5999
        let node_id = ring.owners_of(5000)[0].node_id();
        assert_eq!(ring.owned_range(node_id, 9999), Some((3000, 5999)));

        // wrap-around at the ring start
        let node_id = ring.owners_of(0)[0].node_id();
        assert_eq!(ring.owned_range(node_id, 9999), Some((8000, 999)));
    }

    #[test]
    fn small_rings_cover_the_full_token_space() {
        let ring = Ring::new(vec![node(0), node(5000)], 3);
        let node_id = ring.owners_of(0)[0].node_id();

        assert_eq!(ring.owned_range(node_id, 9999), Some((0, 9999)));
    }

    #[test]
    fn neighbors_wrap_around_the_ring() {
        let ring = ten_node_ring(3);
        let first = ring.owners_of(0)[0].node_id();

        let (left, right) = ring.neighbors(first).unwrap();
        assert_eq!(left.token(), 9000);
        assert_eq!(right.token(), 1000);
    }
}
