//! `queue` crate: ordered in-memory event queue with a head-insert escape hatch.
//!
//! Producers append at the tail from any thread. The single consumer pops from
//! the head and may push an item back to the head when it must be retried
//! before anything that was enqueued after it.

use std::collections::VecDeque;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

/// Errors returned when pushing into a queue.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue was closed; its owner no longer accepts items.
    #[error("queue is closed")]
    Closed,
}

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// FIFO queue guarded by a mutex.
#[derive(Debug)]
pub struct EventQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Append an item at the tail.
    pub fn push_tail(&self, item: T) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        inner.items.push_back(item);
        Ok(())
    }

    /// Insert an item at the head so it is popped next.
    pub fn push_head(&self, item: T) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        inner.items.push_front(item);
        Ok(())
    }

    /// Remove and return the item at the head, if any.
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Reject further pushes and drop whatever is still queued.
    ///
    /// Returns the number of items discarded.
    pub fn close(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let dropped = inner.items.len();
        inner.items.clear();
        if dropped > 0 {
            debug!(dropped, "queue closed with pending items");
        }
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
