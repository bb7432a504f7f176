//! Bounded outbound queue
//!
//! Messages submitted before their stream is open wait here and are
//! flushed, oldest first, the moment it opens. Used by the control channel
//! and by the peerbook connection.

use std::collections::VecDeque;

/// FIFO with a fixed capacity
#[derive(Debug)]
pub struct OutboundQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> OutboundQueue<T> {
    /// Create an empty queue holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append an item, handing it back if the queue is full
    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.items.len() >= self.capacity {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Remove every item in submission order
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.items.drain(..)
    }

    /// Remove the oldest item
    pub fn pop_front(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Put an item back at the head after a failed flush
    pub fn requeue_front(&mut self, item: T) {
        self.items.push_front(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
