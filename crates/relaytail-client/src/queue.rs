//! Hand-off buffer between inbound dispatch and the consumer.
//!
//! The receive loop enqueues paired results as they are produced; the
//! consumer drains everything accumulated since its last poll. The lock is
//! held only for a push or a swap, never across I/O.

use crate::cache::CorrelatedResult;
use parking_lot::Mutex;

/// Thread-safe FIFO of correlated results.
#[derive(Debug, Default)]
pub struct ResultQueue {
    items: Mutex<Vec<CorrelatedResult>>,
}

impl ResultQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a result.
    pub fn enqueue(&self, result: CorrelatedResult) {
        self.items.lock().push(result);
    }

    /// Take every queued result, oldest first, leaving the queue empty.
    pub fn drain_all(&self) -> Vec<CorrelatedResult> {
        std::mem::take(&mut *self.items.lock())
    }

    /// Number of results waiting to be drained.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
