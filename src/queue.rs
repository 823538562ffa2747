//! Bounded lock-free single-producer/single-consumer handoff queue.
//!
//! The acceptor is the sole producer for a given worker's queue; that worker is the sole
//! consumer. This module is a thin, spec-shaped wrapper over [`crossbeam_queue::ArrayQueue`],
//! which is a bounded lock-free MPMC ring — a safe superset of the SPSC discipline this design
//! relies on, in the same spirit as leaning on `mio`/`slab` instead of re-deriving them.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::client::Client;

/// Reference capacity for a worker's handoff queue, per spec.
pub const DEFAULT_CAPACITY: usize = 100;

/// Bounded queue used to hand a newly accepted [`Client`] off from the acceptor thread to its
/// chosen worker thread.
#[derive(Debug)]
pub struct HandoffQueue {
    ring: ArrayQueue<Arc<Client>>,
}

impl HandoffQueue {
    /// Creates a queue with the given fixed capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Attempts to enqueue `client`. Never blocks; returns the client back on failure so the
    /// caller can close its raw socket and back out any speculative bookkeeping.
    pub fn try_enqueue(&self, client: Arc<Client>) -> Result<(), Arc<Client>> {
        self.ring.push(client)
    }

    /// Attempts to dequeue the next pending client in FIFO order. Returns `None` if empty.
    pub fn try_dequeue(&self) -> Option<Arc<Client>> {
        self.ring.pop()
    }

    /// The queue's fixed capacity.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}
