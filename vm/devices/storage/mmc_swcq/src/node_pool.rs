// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bounded pools of list nodes and the task queues built on them.
//!
//! The sequencer consumes task ids from two queues: tasks whose address
//! phase still has to be sent, and tasks the device reported ready for the
//! data phase. Each queue draws its nodes from a fixed pool so the number of
//! queued entries can never exceed the hardware queue depth.

use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Debug, Default, Copy, Clone)]
struct Node {
    payload: u8,
    used: bool,
}

#[derive(Debug)]
struct PoolCore {
    nodes: Vec<Node>,
    free: Vec<usize>,
}

/// A fixed-capacity pool of queue nodes.
#[derive(Debug)]
pub(crate) struct NodePool {
    core: Mutex<PoolCore>,
}

/// Refers to an acquired node. Must be returned with [`NodePool::release`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct NodeHandle(usize);

impl NodePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            core: Mutex::new(PoolCore {
                nodes: vec![Node::default(); capacity],
                free: (0..capacity).rev().collect(),
            }),
        }
    }

    /// Takes an unused node and stores `payload` in it.
    ///
    /// Panics if the pool is exhausted. Callers bound their usage by the
    /// pool capacity, so running out indicates corrupted bookkeeping.
    pub fn acquire(&self, payload: u8) -> NodeHandle {
        let mut core = self.core.lock();
        let index = core.free.pop().expect("node pool exhausted");
        let node = &mut core.nodes[index];
        assert!(!node.used);
        *node = Node {
            payload,
            used: true,
        };
        NodeHandle(index)
    }

    /// Returns a node to the pool, yielding its payload.
    pub fn release(&self, handle: NodeHandle) -> u8 {
        let mut core = self.core.lock();
        let node = &mut core.nodes[handle.0];
        assert!(node.used, "node released twice");
        node.used = false;
        let payload = node.payload;
        core.free.push(handle.0);
        payload
    }

    pub fn in_use(&self) -> usize {
        let core = self.core.lock();
        core.nodes.len() - core.free.len()
    }
}

/// A FIFO of task ids backed by a [`NodePool`].
#[derive(Debug)]
pub(crate) struct NodeQueue {
    pool: NodePool,
    list: Mutex<VecDeque<NodeHandle>>,
}

impl NodeQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            pool: NodePool::new(capacity),
            list: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, task: u8) {
        let node = self.pool.acquire(task);
        self.list.lock().push_back(node);
    }

    pub fn pop(&self) -> Option<u8> {
        let node = self.list.lock().pop_front()?;
        Some(self.pool.release(node))
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    /// Drops every queued entry, returning the nodes to the pool.
    pub fn clear(&self) {
        let nodes = std::mem::take(&mut *self.list.lock());
        for node in nodes {
            self.pool.release(node);
        }
    }

    /// The number of pool nodes currently held by the queue.
    pub fn nodes_in_use(&self) -> usize {
        self.pool.in_use()
    }
}
