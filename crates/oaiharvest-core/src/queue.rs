//! Bounded multi-producer queue with timed offer/poll.
//!
//! Built on `Mutex` and `Condvar`.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// FIFO with a fixed capacity. Producers block up to a timeout when full,
/// the consumer blocks up to a timeout when empty.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    /// If `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `item`, waiting up to `timeout` for room.
    ///
    /// Hands the item back if the queue stayed full.
    pub fn offer(&self, item: T, timeout: Duration) -> Result<(), T> {
        let guard = self.lock();
        let (mut items, _) = self
            .not_full
            .wait_timeout_while(guard, timeout, |items| items.len() >= self.capacity)
            .unwrap_or_else(PoisonError::into_inner);
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        drop(items);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue the oldest item, waiting up to `timeout` for one to arrive.
    pub fn poll(&self, timeout: Duration) -> Option<T> {
        let guard = self.lock();
        let (mut items, _) = self
            .not_empty
            .wait_timeout_while(guard, timeout, |items| items.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        let item = items.pop_front();
        drop(items);
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Take everything currently queued without waiting.
    pub fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = self.lock().drain(..).collect();
        if !drained.is_empty() {
            self.not_full.notify_all();
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn fifo_order() {
        let queue = BoundedQueue::new(4);
        for i in 0..3 {
            queue.offer(i, SHORT).unwrap();
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.poll(SHORT), Some(0));
        assert_eq!(queue.poll(SHORT), Some(1));
        assert_eq!(queue.poll(SHORT), Some(2));
        assert_eq!(queue.poll(SHORT), None);
    }

    #[test]
    fn offer_times_out_when_full() {
        let queue = BoundedQueue::new(1);
        queue.offer("a", SHORT).unwrap();
        let start = Instant::now();
        assert_eq!(queue.offer("b", SHORT), Err("b"));
        assert!(start.elapsed() >= SHORT);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn poll_unblocks_waiting_producer() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.offer(1, SHORT).unwrap();

        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.offer(2, Duration::from_secs(5)))
        };

        // Give thread time to block
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.poll(SHORT), Some(1));

        assert_eq!(producer.join().unwrap(), Ok(()));
        assert_eq!(queue.poll(SHORT), Some(2));
    }

    #[test]
    fn drain_empties_queue() {
        let queue = BoundedQueue::new(8);
        for i in 0..5 {
            queue.offer(i, SHORT).unwrap();
        }
        assert_eq!(queue.drain(), vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), 8);
    }

    #[test]
    #[should_panic(expected = "queue capacity must be positive")]
    fn zero_capacity_rejected() {
        let _ = BoundedQueue::<u8>::new(0);
    }
}
