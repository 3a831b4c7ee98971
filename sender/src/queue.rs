//! Fixed-capacity send queue with drop-new backpressure.

use parking_lot::Mutex;
use std::collections::VecDeque;

pub const DEFAULT_CAPACITY: usize = 102_400;

/// FIFO queue that rejects new items once `capacity` items are waiting.
///
/// Safe for many concurrent producers. Meant to be drained by a single consumer.
/// A rejected push leaves the queue untouched; the caller accounts for the drop.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends `item`, or returns `false` without blocking if the queue is full.
    pub fn try_push(&self, item: T) -> bool {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return false;
        }
        items.push_back(item);
        true
    }

    /// Removes up to `max` items from the front. Empty when nothing is waiting.
    pub fn pop_batch(&self, max: usize) -> Vec<T> {
        let mut items = self.items.lock();
        let n = max.min(items.len());
        items.drain(..n).collect()
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
}

impl<T> Default for BoundedQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fifo_batches() {
        let queue = BoundedQueue::new(10);
        for i in 0..5 {
            assert!(queue.try_push(i));
        }
        assert_eq!(queue.pop_batch(3), vec![0, 1, 2]);
        assert_eq!(queue.pop_batch(3), vec![3, 4]);
        assert!(queue.pop_batch(3).is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue_rejects_newest() {
        let queue = BoundedQueue::new(3);
        assert!(queue.try_push("a"));
        assert!(queue.try_push("b"));
        assert!(queue.try_push("c"));
        assert!(!queue.try_push("d"));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop_batch(10), vec!["a", "b", "c"]);

        // Space frees up after draining
        assert!(queue.try_push("e"));
    }

    #[test]
    fn test_concurrent_push_at_capacity() {
        const CAPACITY: usize = 1000;
        let queue = Arc::new(BoundedQueue::new(CAPACITY));
        let accepted = Arc::new(AtomicUsize::new(0));
        let rejected = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let queue = queue.clone();
                let accepted = accepted.clone();
                let rejected = rejected.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        if queue.try_push(t * 1000 + i) {
                            accepted.fetch_add(1, Ordering::Relaxed);
                        } else {
                            rejected.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(accepted.load(Ordering::Relaxed), CAPACITY);
        assert_eq!(rejected.load(Ordering::Relaxed), 8 * 250 - CAPACITY);
        assert!(!queue.try_push(usize::MAX));

        let mut drained = queue.pop_batch(usize::MAX);
        assert_eq!(drained.len(), CAPACITY);
        drained.sort();
        drained.dedup();
        assert_eq!(drained.len(), CAPACITY);
    }

    #[test]
    fn test_default_capacity() {
        let queue: BoundedQueue<u8> = BoundedQueue::default();
        assert_eq!(queue.capacity(), DEFAULT_CAPACITY);
    }
}
