//! Bounded hand-off queue between the capture thread and the consumer.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// What happens when pushing onto a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Evict the oldest item to make room (display frames: freshest wins).
    DropOldest,
    /// Discard the incoming item (events: never reorder what is queued).
    DropNewest,
}

/// Fixed-capacity FIFO shared between one producer and one consumer.
///
/// Neither side ever blocks beyond the short critical section of a push or pop.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    overflow: Overflow,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize, overflow: Overflow) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            overflow,
        }
    }

    /// Push an item. Returns `false` when an item (old or new) was dropped.
    pub fn push(&self, item: T) -> bool {
        let mut items = self.items.lock();
        if items.len() < self.capacity {
            items.push_back(item);
            return true;
        }
        match self.overflow {
            Overflow::DropOldest => {
                items.pop_front();
                items.push_back(item);
            }
            Overflow::DropNewest => {}
        }
        false
    }

    /// Non-blocking pop of the oldest item.
    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }
}
