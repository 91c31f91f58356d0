//! Search-node storage shared by every graph query.
//!
//! The pool is a fixed-capacity arena indexed by a small hash table so a
//! query can fetch-or-insert the node for a polygon in O(1) without
//! allocating per search. The open list is a plain array binary heap over
//! node indices keyed by total cost; decrease-key re-bubbles the entry in
//! place.

use bevy::prelude::Vec3;

use crate::refs::PolyRef;

pub type NodeIndex = u16;

const NULL_IDX: NodeIndex = NodeIndex::MAX;

/// Node is on the open list.
pub const NODE_OPEN: u8 = 0x01;
/// Node has been expanded.
pub const NODE_CLOSED: u8 = 0x02;
/// Parent of the node is not adjacent; found using raycast.
pub const NODE_PARENT_DETACHED: u8 = 0x04;

/// A polygon can hold one node per state value.
pub const MAX_STATES_PER_NODE: u8 = 4;

#[derive(Debug, Clone)]
pub struct Node {
    pub pos: Vec3,
    /// Cost from the search origin to this node.
    pub cost: f32,
    /// Cost plus heuristic; the heap key.
    pub total: f32,
    pub parent: Option<NodeIndex>,
    pub state: u8,
    pub flags: u8,
    pub id: PolyRef,
}

#[inline]
fn hash_ref(r: PolyRef) -> u32 {
    let mut a = r.0;
    a = a.wrapping_add(!(a << 15));
    a ^= a >> 10;
    a = a.wrapping_add(a << 3);
    a ^= a >> 6;
    a = a.wrapping_add(!(a << 11));
    a ^= a >> 16;
    a
}

pub struct NodePool {
    nodes: Vec<Node>,
    first: Vec<NodeIndex>,
    next: Vec<NodeIndex>,
    max_nodes: usize,
    hash_mask: u32,
}

impl NodePool {
    /// `hash_size` must be a power of two; `max_nodes` at most `u16::MAX - 1`
    /// so indices fit the chain links.
    pub fn new(max_nodes: usize, hash_size: usize) -> NodePool {
        debug_assert!(hash_size.is_power_of_two());
        debug_assert!(max_nodes > 0 && max_nodes < NULL_IDX as usize);

        NodePool {
            nodes: Vec::with_capacity(max_nodes),
            first: vec![NULL_IDX; hash_size],
            next: vec![NULL_IDX; max_nodes],
            max_nodes,
            hash_mask: (hash_size - 1) as u32,
        }
    }

    /// Forgets every node without releasing storage.
    pub fn clear(&mut self) {
        self.first.fill(NULL_IDX);
        self.nodes.clear();
    }

    #[inline]
    pub fn node(&self, idx: NodeIndex) -> &Node {
        &self.nodes[idx as usize]
    }

    #[inline]
    pub fn node_mut(&mut self, idx: NodeIndex) -> &mut Node {
        &mut self.nodes[idx as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    pub fn find_node(&self, id: PolyRef, state: u8) -> Option<NodeIndex> {
        let bucket = (hash_ref(id) & self.hash_mask) as usize;
        let mut i = self.first[bucket];
        while i != NULL_IDX {
            let node = &self.nodes[i as usize];
            if node.id == id && node.state == state {
                return Some(i);
            }
            i = self.next[i as usize];
        }
        None
    }

    /// Collects the nodes of every state for `id`.
    pub fn find_nodes(&self, id: PolyRef, out: &mut [NodeIndex]) -> usize {
        let bucket = (hash_ref(id) & self.hash_mask) as usize;
        let mut n = 0;
        let mut i = self.first[bucket];
        while i != NULL_IDX {
            if self.nodes[i as usize].id == id {
                if n >= out.len() {
                    return n;
                }
                out[n] = i;
                n += 1;
            }
            i = self.next[i as usize];
        }
        n
    }

    /// Returns the node for `(id, state)`, appending a fresh one on a miss.
    /// `None` when the pool is full; callers skip that neighbour.
    pub fn get_node(&mut self, id: PolyRef, state: u8) -> Option<NodeIndex> {
        let bucket = (hash_ref(id) & self.hash_mask) as usize;
        let mut i = self.first[bucket];
        while i != NULL_IDX {
            let node = &self.nodes[i as usize];
            if node.id == id && node.state == state {
                return Some(i);
            }
            i = self.next[i as usize];
        }

        if self.nodes.len() >= self.max_nodes {
            return None;
        }

        let i = self.nodes.len() as NodeIndex;
        self.nodes.push(Node {
            pos: Vec3::ZERO,
            cost: 0.0,
            total: 0.0,
            parent: None,
            state,
            flags: 0,
            id,
        });
        self.next[i as usize] = self.first[bucket];
        self.first[bucket] = i;
        Some(i)
    }
}

/// Binary min-heap of pool indices keyed by the node's total cost.
pub struct NodeQueue {
    heap: Vec<(f32, NodeIndex)>,
}

impl NodeQueue {
    pub fn new(capacity: usize) -> NodeQueue {
        NodeQueue {
            heap: Vec::with_capacity(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn push(&mut self, total: f32, idx: NodeIndex) {
        self.heap.push((total, idx));
        self.bubble_up(self.heap.len() - 1);
    }

    pub fn pop(&mut self) -> Option<NodeIndex> {
        if self.heap.is_empty() {
            return None;
        }
        let top = self.heap[0].1;
        let last = self.heap.pop().unwrap();
        if !self.heap.is_empty() {
            self.heap[0] = last;
            self.trickle_down(0);
        }
        Some(top)
    }

    /// Decrease-key: locates `idx` and floats it up under its new total.
    pub fn modify(&mut self, idx: NodeIndex, total: f32) {
        for i in 0..self.heap.len() {
            if self.heap[i].1 == idx {
                self.heap[i].0 = total;
                self.bubble_up(i);
                return;
            }
        }
    }

    fn bubble_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].0 <= self.heap[i].0 {
                break;
            }
            self.heap.swap(i, parent);
            i = parent;
        }
    }

    fn trickle_down(&mut self, mut i: usize) {
        loop {
            let mut child = i * 2 + 1;
            if child >= self.heap.len() {
                break;
            }
            if child + 1 < self.heap.len() && self.heap[child + 1].0 < self.heap[child].0 {
                child += 1;
            }
            if self.heap[i].0 <= self.heap[child].0 {
                break;
            }
            self.heap.swap(i, child);
            i = child;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_deduplicates_by_id_and_state() {
        let mut pool = NodePool::new(32, 16);
        let a = pool.get_node(PolyRef(5), 0).unwrap();
        let b = pool.get_node(PolyRef(5), 0).unwrap();
        let c = pool.get_node(PolyRef(5), 1).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.len(), 2);

        let mut out = [0 as NodeIndex; MAX_STATES_PER_NODE as usize];
        assert_eq!(pool.find_nodes(PolyRef(5), &mut out), 2);
        assert_eq!(pool.find_nodes(PolyRef(6), &mut out), 0);
    }

    #[test]
    fn pool_capacity_and_clear() {
        let mut pool = NodePool::new(2, 16);
        assert!(pool.get_node(PolyRef(1), 0).is_some());
        assert!(pool.get_node(PolyRef(2), 0).is_some());
        assert!(pool.get_node(PolyRef(3), 0).is_none());

        pool.clear();
        assert!(pool.is_empty());
        assert!(pool.find_node(PolyRef(1), 0).is_none());
        assert!(pool.get_node(PolyRef(3), 0).is_some());
    }

    #[test]
    fn queue_pops_in_total_order() {
        let mut pool = NodePool::new(16, 16);
        let mut queue = NodeQueue::new(16);
        for (i, total) in [4.0, 1.5, 3.0, 0.5, 2.0].into_iter().enumerate() {
            let idx = pool.get_node(PolyRef(i as u32 + 1), 0).unwrap();
            pool.node_mut(idx).total = total;
            queue.push(total, idx);
        }

        let mut prev = f32::NEG_INFINITY;
        while let Some(idx) = queue.pop() {
            let total = pool.node(idx).total;
            assert!(total >= prev);
            prev = total;
        }
    }

    #[test]
    fn queue_modify_reorders() {
        let mut queue = NodeQueue::new(8);
        queue.push(10.0, 0);
        queue.push(20.0, 1);
        queue.push(30.0, 2);
        queue.modify(2, 5.0);
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(0));
        assert_eq!(queue.pop(), Some(1));
        assert!(queue.is_empty());
    }
}
