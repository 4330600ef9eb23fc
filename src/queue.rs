//! Bounded circular packet queue.
//!
//! The queue is the only state shared between the capture half of the pipeline
//! (producer) and the downlink half (consumer). [PacketQueue] is a plain owned value;
//! [SharedQueue] wraps it in a mutex so `push`/`pop` are mutually exclusive when the
//! two halves run on different threads.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::packet::Packet;
use crate::{Error, Result};

/// Default number of packet slots.
pub const QUEUE_CAPACITY: usize = 2048;

/// Fixed-capacity FIFO of [Packet]s.
///
/// Invariant: `0 <= len() <= capacity()`. Failed operations leave the queue unchanged.
#[derive(Debug)]
pub struct PacketQueue {
    slots: Vec<Option<Packet>>,
    head: usize,
    tail: usize,
    count: usize,
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new(QUEUE_CAPACITY)
    }
}

impl PacketQueue {
    /// Create a queue with `capacity` slots.
    ///
    /// # Panics
    /// If `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        PacketQueue {
            slots,
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    /// Append a packet at the tail.
    ///
    /// # Errors
    /// [Error::QueueFull] if the queue already holds `capacity` packets.
    pub fn push(&mut self, packet: Packet) -> Result<()> {
        if self.count == self.capacity() {
            return Err(Error::QueueFull {
                capacity: self.capacity(),
            });
        }
        self.slots[self.tail] = Some(packet);
        self.tail = (self.tail + 1) % self.capacity();
        self.count += 1;
        trace!(tail = self.tail, count = self.count, "pushed");
        Ok(())
    }

    /// Remove the packet at the head.
    ///
    /// # Errors
    /// [Error::QueueEmpty] if there are no packets.
    pub fn pop(&mut self) -> Result<Packet> {
        if self.count == 0 {
            return Err(Error::QueueEmpty);
        }
        let Some(packet) = self.slots[self.head].take() else {
            // occupied slots are always Some between head and tail
            return Err(Error::QueueEmpty);
        };
        self.head = (self.head + 1) % self.capacity();
        self.count -= 1;
        trace!(head = self.head, count = self.count, "popped");
        Ok(packet)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Cloneable handle to a [PacketQueue] guarded by a mutex.
#[derive(Debug, Clone, Default)]
pub struct SharedQueue(Arc<Mutex<PacketQueue>>);

impl SharedQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        SharedQueue(Arc::new(Mutex::new(PacketQueue::new(capacity))))
    }

    // A panic while holding the lock cannot leave the queue half-updated; every
    // mutation happens after its check.
    fn lock(&self) -> MutexGuard<'_, PacketQueue> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// See [PacketQueue::push].
    ///
    /// # Errors
    /// [Error::QueueFull]
    pub fn push(&self, packet: Packet) -> Result<()> {
        self.lock().push(packet)
    }

    /// See [PacketQueue::pop].
    ///
    /// # Errors
    /// [Error::QueueEmpty]
    pub fn pop(&self) -> Result<Packet> {
        self.lock().pop()
    }

    /// Pop a packet if one is available.
    #[must_use]
    pub fn try_pop(&self) -> Option<Packet> {
        let mut queue = self.lock();
        if queue.is_empty() {
            return None;
        }
        queue.pop().ok()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;
    use crate::packet::{assemble, TYPE_COEFFICIENTS};

    fn packet(n: u8) -> Packet {
        assemble(&[n], TYPE_COEFFICIENTS).unwrap()
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = PacketQueue::new(4);
        for i in 0..3 {
            queue.push(packet(i)).unwrap();
        }
        assert_eq!(queue.len(), 3);
        for i in 0..3 {
            assert_eq!(queue.pop().unwrap().payload(), &[i]);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_full_leaves_state_unchanged() {
        let mut queue = PacketQueue::new(2);
        queue.push(packet(0)).unwrap();
        queue.push(packet(1)).unwrap();
        assert!(queue.is_full());

        let zult = queue.push(packet(2));
        assert!(
            matches!(zult, Err(Error::QueueFull { capacity: 2 })),
            "got {zult:?}"
        );
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().payload(), &[0]);
        assert_eq!(queue.pop().unwrap().payload(), &[1]);
    }

    #[test]
    fn test_pop_empty_leaves_state_unchanged() {
        let mut queue = PacketQueue::new(2);
        assert!(matches!(queue.pop(), Err(Error::QueueEmpty)));
        assert_eq!(queue.len(), 0);

        queue.push(packet(7)).unwrap();
        assert_eq!(queue.pop().unwrap().payload(), &[7]);
    }

    #[test]
    fn test_default_capacity_boundary() {
        let mut queue = PacketQueue::default();
        for i in 0..QUEUE_CAPACITY {
            queue.push(packet((i % 256) as u8)).unwrap();
        }
        assert_eq!(queue.len(), QUEUE_CAPACITY);
        assert!(matches!(queue.push(packet(0)), Err(Error::QueueFull { .. })));
        assert_eq!(queue.len(), QUEUE_CAPACITY);
    }

    #[test]
    fn test_wraparound() {
        let mut queue = PacketQueue::new(3);
        for round in 0..10u8 {
            queue.push(packet(round)).unwrap();
            queue.push(packet(round.wrapping_add(100))).unwrap();
            assert_eq!(queue.pop().unwrap().payload(), &[round]);
            assert_eq!(queue.pop().unwrap().payload(), &[round.wrapping_add(100)]);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_random_ops_hold_count_invariant() {
        let mut rng = rand::thread_rng();
        let capacity = 16;
        let mut queue = PacketQueue::new(capacity);
        let mut model: std::collections::VecDeque<u8> = std::collections::VecDeque::new();

        for _ in 0..5000 {
            if rng.gen_bool(0.5) {
                let n: u8 = rng.gen();
                let zult = queue.push(packet(n));
                if model.len() == capacity {
                    assert!(zult.is_err());
                } else {
                    assert!(zult.is_ok());
                    model.push_back(n);
                }
            } else {
                match model.pop_front() {
                    Some(n) => assert_eq!(queue.pop().unwrap().payload(), &[n]),
                    None => assert!(queue.pop().is_err()),
                }
            }
            assert!(queue.len() <= queue.capacity());
            assert_eq!(queue.len(), model.len());
        }
    }

    #[test]
    fn test_shared_queue_across_threads() {
        let queue = SharedQueue::new(64);
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..64u8 {
                    queue.push(packet(i)).unwrap();
                }
            })
        };
        producer.join().unwrap();

        let mut got = Vec::new();
        while let Some(p) = queue.try_pop() {
            got.push(p.payload()[0]);
        }
        assert_eq!(got, (0..64u8).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }
}
