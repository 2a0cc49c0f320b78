//! Time-ordered intrusive list used for coarse keep-alive timeouts.
//!
//! The queue threads `prev`/`next` indices through the connection table, so
//! linking a connection never allocates and the links stay within one
//! allocation. A sentinel index of -1 stands for the queue head. Entries are
//! inserted at the tail and the tick is monotonic between resets, so
//! deadlines are non-decreasing from head to tail and expiry only ever
//! inspects the head.

use std::time::Duration;

use crate::conn::{ConnTable, Flags};

/// Sentinel index for the queue head.
const HEAD: i32 = -1;

/// Per-worker death queue. All index arguments must refer to slots owned by
/// the calling worker.
#[derive(Debug)]
pub struct DeathQueue {
    head_next: i32,
    head_prev: i32,
    time: u32,
    keep_alive_timeout: u32,
}

impl DeathQueue {
    /// An empty queue at tick zero.
    pub fn new(keep_alive_timeout: u32) -> Self {
        DeathQueue {
            head_next: HEAD,
            head_prev: HEAD,
            time: 0,
            keep_alive_timeout,
        }
    }

    /// Whether no connection is linked.
    pub fn is_empty(&self) -> bool {
        self.head_next == HEAD
    }

    /// The current tick.
    pub fn time(&self) -> u32 {
        self.time
    }

    /// The deadline assigned to a freshly spawned connection.
    pub fn deadline(&self) -> u32 {
        self.time.wrapping_add(self.keep_alive_timeout)
    }

    /// How long the reactor may block: forever while the queue is empty,
    /// otherwise one timeout slice.
    pub fn poll_timeout(&self) -> Option<Duration> {
        if self.is_empty() {
            None
        } else {
            Some(Duration::from_millis(1000))
        }
    }

    /// Link `idx` at the tail.
    pub fn insert(&mut self, conns: &ConnTable, idx: i32) {
        let tail = self.head_prev;

        // Safety: the worker owns every slot it links.
        let conn = unsafe { conns.slot(idx as usize) };
        conn.next = HEAD;
        conn.prev = tail;

        if tail == HEAD {
            self.head_next = idx;
        } else {
            unsafe { conns.slot(tail as usize) }.next = idx;
        }
        self.head_prev = idx;
    }

    /// Unlink `idx`, defensively resetting its own links.
    pub fn remove(&mut self, conns: &ConnTable, idx: i32) {
        // Safety: as in `insert`.
        let (prev, next) = {
            let conn = unsafe { conns.slot(idx as usize) };
            (conn.prev, conn.next)
        };

        if next == HEAD {
            self.head_prev = prev;
        } else {
            unsafe { conns.slot(next as usize) }.prev = prev;
        }
        if prev == HEAD {
            self.head_next = next;
        } else {
            unsafe { conns.slot(prev as usize) }.next = next;
        }

        // FIXME: shouldn't be needed, but stale links have been observed
        // under multi-million-request loads; keep until the root cause is
        // found.
        let conn = unsafe { conns.slot(idx as usize) };
        conn.prev = HEAD;
        conn.next = HEAD;
    }

    /// Refresh the deadline of `idx` and re-seat it at the tail. A
    /// connection that is keep-alive or suspended mid-coroutine gets a full
    /// keep-alive timeout; anything else is marked to be reaped on the next
    /// tick.
    pub fn move_to_tail(&mut self, conns: &ConnTable, idx: i32) {
        {
            // Safety: as in `insert`.
            let conn = unsafe { conns.slot(idx as usize) };
            let busy = conn.flags.intersects(
                Flags::KEEP_ALIVE
                    | Flags::SHOULD_RESUME
                    | Flags::MUST_READ
                    | Flags::WRITE_EVENTS_ARMED,
            );
            conn.time_to_die = if busy { self.deadline() } else { self.time };
        }

        self.remove(conns, idx);
        self.insert(conns, idx);
    }

    /// Advance the tick by one timeout slice.
    pub fn tick(&mut self) {
        self.time = self.time.wrapping_add(1);
    }

    /// The head of the queue if its deadline has passed.
    pub fn expired_head(&self, conns: &ConnTable) -> Option<i32> {
        if self.head_next == HEAD {
            return None;
        }
        // Safety: linked slots are owned by this worker.
        let conn = unsafe { conns.slot(self.head_next as usize) };
        (conn.time_to_die <= self.time).then_some(self.head_next)
    }

    /// The head of the queue, if any.
    pub fn head(&self) -> Option<i32> {
        (self.head_next != HEAD).then_some(self.head_next)
    }

    /// Reset the tick epoch once the queue has drained, keeping deadline
    /// comparisons meaningful across arbitrarily long uptimes.
    pub fn reset_if_empty(&mut self) {
        if self.is_empty() {
            self.time = 0;
        }
    }
}
