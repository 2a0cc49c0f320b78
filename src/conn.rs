//! Per-connection state and the process-wide connection table.

use std::cell::UnsafeCell;
use std::fmt::{self, Debug};

use bitflags::bitflags;

use crate::coro::Coro;

bitflags! {
    /// Per-connection state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u8 {
        /// The fd is open and registered with the owning worker's poller.
        const ALIVE = 1 << 0;
        /// The peer asked for the connection to persist across requests.
        const KEEP_ALIVE = 1 << 1;
        /// The coroutine wants to run again on the next readiness event.
        const SHOULD_RESUME = 1 << 2;
        /// The pipeline needs more input bytes before it can progress.
        const MUST_READ = 1 << 3;
        /// The poller entry is currently armed for write readiness.
        const WRITE_EVENTS_ARMED = 1 << 4;
        /// The peer address came from a PROXY protocol preamble.
        const PROXIED = 1 << 5;
        /// Cross-origin requests are allowed on this connection.
        const CORS_ALLOWED = 1 << 6;
    }
}

/// The flags that survive from one request to the next on a connection.
pub const CROSS_REQUEST_FLAGS: Flags = Flags::PROXIED.union(Flags::CORS_ALLOWED);

/// One slot in the connection table. The slot index doubles as the fd, so a
/// connection never allocates on accept.
pub struct Conn {
    /// Index of the worker that owns this slot, set on handoff.
    pub worker: u16,
    /// State bits; see [`Flags`].
    pub flags: Flags,
    /// Absolute death-queue tick at which this connection expires.
    pub time_to_die: u32,
    /// Death-queue link: table index of the previous node, -1 for the head.
    pub prev: i32,
    /// Death-queue link: table index of the next node, -1 for the head.
    pub next: i32,
    /// The coroutine driving this connection. Present iff `ALIVE` is set.
    pub coro: Option<Coro>,
}

impl Conn {
    fn unused() -> Self {
        Conn {
            worker: 0,
            flags: Flags::empty(),
            time_to_die: 0,
            prev: -1,
            next: -1,
            coro: None,
        }
    }
}

impl Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("worker", &self.worker)
            .field("flags", &self.flags)
            .field("time_to_die", &self.time_to_die)
            .field("prev", &self.prev)
            .field("next", &self.next)
            .field("has_coro", &self.coro.is_some())
            .finish()
    }
}

/// Preallocated, fd-indexed table of connection slots, sized to the
/// process's open-file limit and never resized.
///
/// The table is shared in address between the acceptor and every worker, but
/// partitioned by fd ownership: the acceptor owns a slot from [`install`]
/// until the matching SPSC push, the worker owns it from the pop until the
/// connection is destroyed. The queue's Release/Acquire pair orders the
/// acceptor's slot write before the worker's first read.
///
/// [`install`]: ConnTable::install
pub struct ConnTable {
    slots: Box<[UnsafeCell<Conn>]>,
}

// Safety: slots are only ever accessed by their current owner per the
// handoff protocol above; the SPSC queue provides the cross-thread fence.
// `Conn::coro` is created, resumed and dropped exclusively on the owning
// worker's thread.
unsafe impl Send for ConnTable {}
unsafe impl Sync for ConnTable {}

impl ConnTable {
    /// Allocate `capacity` unused slots.
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(Conn::unused()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        ConnTable { slots }
    }

    /// Number of slots, equal to the highest representable fd plus one.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Get mutable access to a slot.
    ///
    /// # Safety
    ///
    /// The caller must currently own slot `idx` per the handoff protocol and
    /// must not hold another reference to it.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slot(&self, idx: usize) -> &mut Conn {
        &mut *self.slots[idx].get()
    }

    /// Reset slot `fd` for handoff to `worker`: all fields zeroed, worker
    /// back-reference set. The coroutine field is left alone; the previous
    /// owner cleared it before closing the fd, and only that worker's later
    /// reads of it are ordered.
    ///
    /// # Safety
    ///
    /// The caller must own the slot per the handoff protocol, and `fd` must
    /// always be routed to the same worker for the life of the process so a
    /// recycled descriptor lands back on the thread that cleaned its slot.
    pub unsafe fn install(&self, fd: usize, worker: u16) {
        let conn = self.slot(fd);
        conn.worker = worker;
        conn.flags = Flags::empty();
        conn.time_to_die = 0;
        conn.prev = -1;
        conn.next = -1;
    }
}

impl Debug for ConnTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnTable")
            .field("capacity", &self.slots.len())
            .finish()
    }
}
