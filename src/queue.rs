//! Bounded, blocking multi-producer/multi-consumer queue.
//!
//! Backed by a power-of-two ring so the index mask is a single `&`, the same trick
//! `disruptor::RingBuffer` uses for its sequence arithmetic. Unlike the disruptor ring,
//! this queue blocks producers and consumers on condition variables rather than spinning,
//! since dispatch workers are expected to sleep when idle rather than burn a core.

use crate::error::{ FluxError, Result };
use parking_lot::{ Condvar, Mutex };
use std::time::Duration;

struct Ring<T> {
    buffer: Box<[Option<T>]>,
    mask: usize,
    head: usize,
    tail: usize,
    len: usize,
}

/// A bounded FIFO queue of `T`, safe to share across threads via `Arc`.
pub struct BoundedQueue<T> {
    ring: Mutex<Ring<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// `capacity` must be a power of two.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || (capacity & (capacity - 1)) != 0 {
            return Err(FluxError::config(format!("queue capacity must be a power of two, got {capacity}")));
        }
        let buffer = (0..capacity).map(|_| None).collect::<Vec<_>>().into_boxed_slice();
        Ok(Self {
            ring: Mutex::new(Ring { buffer, mask: capacity - 1, head: 0, tail: 0, len: 0 }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue `item`, blocking up to `timeout` (`None` = forever, `Some(ZERO)` = try
    /// once) while the queue is full. Returns the item back on timeout.
    pub fn enqueue(&self, item: T, timeout: Option<Duration>) -> std::result::Result<(), T> {
        let deadline = timeout.map(|d| std::time::Instant::now() + d);
        let mut ring = self.ring.lock();
        loop {
            if ring.len < self.capacity {
                let tail = ring.tail;
                let mask = ring.mask;
                ring.buffer[tail & mask] = Some(item);
                ring.tail = tail.wrapping_add(1);
                ring.len += 1;
                drop(ring);
                self.not_empty.notify_one();
                return Ok(());
            }
            match timeout {
                Some(d) if d == Duration::ZERO => return Err(item),
                None => self.not_full.wait(&mut ring),
                Some(_) => {
                    let d = deadline.unwrap();
                    let now = std::time::Instant::now();
                    if now >= d {
                        return Err(item);
                    }
                    if self.not_full.wait_for(&mut ring, d - now).timed_out() {
                        return Err(item);
                    }
                }
            }
        }
    }

    /// Dequeue an item, blocking up to `timeout` (`None` = forever, `Some(ZERO)` = try
    /// once) while the queue is empty.
    pub fn dequeue(&self, timeout: Option<Duration>) -> Option<T> {
        let mut ring = self.ring.lock();
        loop {
            if ring.len > 0 {
                let head = ring.head;
                let mask = ring.mask;
                let item = ring.buffer[head & mask].take();
                ring.head = head.wrapping_add(1);
                ring.len -= 1;
                drop(ring);
                self.not_full.notify_one();
                return item;
            }
            match timeout {
                Some(d) if d == Duration::ZERO => return None,
                None => self.not_empty.wait(&mut ring),
                Some(d) => {
                    if self.not_empty.wait_for(&mut ring, d).timed_out() {
                        return None;
                    }
                }
            }
        }
    }

    pub fn try_enqueue(&self, item: T) -> std::result::Result<(), T> {
        self.enqueue(item, Some(Duration::ZERO))
    }

    pub fn try_dequeue(&self) -> Option<T> {
        self.dequeue(Some(Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn rejects_non_power_of_two_capacity() {
        assert!(BoundedQueue::<u32>::new(3).is_err());
    }

    #[test]
    fn fifo_order_is_preserved() {
        let q = BoundedQueue::new(4).unwrap();
        for i in 0..4 {
            q.enqueue(i, None).unwrap();
        }
        for i in 0..4 {
            assert_eq!(q.dequeue(Some(Duration::ZERO)), Some(i));
        }
    }

    #[test]
    fn try_enqueue_fails_when_full() {
        let q = BoundedQueue::new(2).unwrap();
        q.try_enqueue(1).unwrap();
        q.try_enqueue(2).unwrap();
        assert_eq!(q.try_enqueue(3), Err(3));
    }

    #[test]
    fn try_dequeue_fails_when_empty() {
        let q: BoundedQueue<u32> = BoundedQueue::new(2).unwrap();
        assert_eq!(q.try_dequeue(), None);
    }

    #[test]
    fn blocking_enqueue_wakes_on_dequeue() {
        let q = Arc::new(BoundedQueue::new(1).unwrap());
        q.try_enqueue(1).unwrap();

        let q2 = q.clone();
        let handle = std::thread::spawn(move || {
            q2.enqueue(2, Some(Duration::from_secs(1))).unwrap();
        });

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(q.dequeue(None), Some(1));
        handle.join().unwrap();
        assert_eq!(q.dequeue(None), Some(2));
    }
}
