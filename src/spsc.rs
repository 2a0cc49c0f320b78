//! Wait-free single-producer/single-consumer ring carrying file descriptors
//! from the acceptor to a worker.

use std::cell::UnsafeCell;
use std::fmt::{self, Debug};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

struct Ring {
    buf: Box<[UnsafeCell<RawFd>]>,
    mask: usize,
    // Monotonic counters; index = counter & mask.
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

// Safety: a slot is written only by the producer before the Release store to
// `tail`, and read only by the consumer after the matching Acquire load, so
// no slot is ever accessed concurrently.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

/// Create a ring holding at least `capacity` descriptors (rounded up to a
/// power of two), split into its two ends.
pub fn channel(capacity: usize) -> (Producer, Consumer) {
    let capacity = capacity.max(1).next_power_of_two();
    let buf = (0..capacity)
        .map(|_| UnsafeCell::new(-1))
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let ring = Arc::new(Ring {
        buf,
        mask: capacity - 1,
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
    });

    (
        Producer {
            ring: Arc::clone(&ring),
        },
        Consumer { ring },
    )
}

/// The acceptor's end of the ring.
pub struct Producer {
    ring: Arc<Ring>,
}

impl Producer {
    /// Push a descriptor. Returns it back if the ring is full.
    pub fn push(&mut self, fd: RawFd) -> Result<(), RawFd> {
        let ring = &*self.ring;
        let tail = ring.tail.load(Ordering::Relaxed);
        let head = ring.head.load(Ordering::Acquire);

        if tail.wrapping_sub(head) == ring.buf.len() {
            return Err(fd);
        }

        // Safety: tail < head + capacity, so this slot has been consumed;
        // only the single producer writes it.
        unsafe { *ring.buf[tail & ring.mask].get() = fd };
        ring.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Number of descriptors the ring can hold.
    pub fn capacity(&self) -> usize {
        self.ring.buf.len()
    }
}

impl Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("spsc::Producer")
            .field("capacity", &self.ring.buf.len())
            .finish()
    }
}

/// The worker's end of the ring.
pub struct Consumer {
    ring: Arc<Ring>,
}

impl Consumer {
    /// Pop the oldest descriptor, if any.
    pub fn pop(&mut self) -> Option<RawFd> {
        let ring = &*self.ring;
        let head = ring.head.load(Ordering::Relaxed);
        let tail = ring.tail.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        // Safety: head < tail, so the producer published this slot; only the
        // single consumer reads it.
        let fd = unsafe { *ring.buf[head & ring.mask].get() };
        ring.head.store(head.wrapping_add(1), Ordering::Release);
        Some(fd)
    }

    /// Whether any descriptors are pending.
    pub fn is_empty(&self) -> bool {
        self.ring.head.load(Ordering::Relaxed) == self.ring.tail.load(Ordering::Acquire)
    }
}

impl Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("spsc::Consumer")
            .field("capacity", &self.ring.buf.len())
            .finish()
    }
}
