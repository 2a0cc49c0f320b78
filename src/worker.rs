//! Worker threads: one edge-triggered poller plus a cooperative coroutine
//! scheduler each. The acceptor hands descriptors over through a wait-free
//! SPSC ring and a wakeup channel; everything after that stays on the
//! worker's thread.

use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};

use log::{debug, error};
use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::conn::{ConnTable, Flags};
use crate::coro::{Coro, Disposition};
use crate::date::DateCache;
use crate::death_queue::DeathQueue;
use crate::pipeline::{drive, Pipeline};
use crate::spsc;
use crate::Config;

/// Token reserved for the wakeup channel; connection tokens are fd values
/// and can never collide with it.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Upper bound on events fetched per poll.
const MAX_EVENTS: usize = 1024;

/// Acceptor-facing handle to one worker. The handoff contract is
/// push-then-nudge: [`add_client`](WorkerHandle::add_client) any number of
/// descriptors, then [`nudge`](WorkerHandle::nudge) once.
#[derive(Debug)]
pub struct WorkerHandle {
    id: u16,
    pending: spsc::Producer,
    waker: Arc<Waker>,
    conns: Arc<ConnTable>,
}

impl WorkerHandle {
    /// Install a fresh connection slot for `fd` and queue it for this
    /// worker. The descriptor is closed if it cannot be queued.
    pub fn add_client(&mut self, fd: RawFd) {
        if fd < 0 || fd as usize >= self.conns.capacity() {
            error!("fd {} outside the connection table; dropping", fd);
            // Safety: we own the freshly accepted descriptor.
            unsafe { libc::close(fd) };
            return;
        }

        // Safety: the slot is unowned until the push below publishes it.
        unsafe { self.conns.install(fd as usize, self.id) };

        if self.pending.push(fd).is_err() {
            error!("worker #{}: handoff queue full; dropping fd {}", self.id, fd);
            // Safety: as above; the worker never saw this descriptor.
            unsafe { libc::close(fd) };
        }
    }

    /// Wake the worker so it drains the handoff queue.
    pub fn nudge(&self) {
        if let Err(err) = self.waker.wake() {
            error!("worker #{}: nudge: {}", self.id, err);
        }
    }
}

/// Coordinator-facing side of a worker: stop flag, wakeup channel, join
/// handle.
#[derive(Debug)]
pub(crate) struct WorkerControl {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    join: Option<JoinHandle<()>>,
}

impl WorkerControl {
    /// Ask the worker to leave its I/O loop. It proceeds to the shutdown
    /// rendezvous and then drains its connections.
    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Err(err) = self.waker.wake() {
            error!("stop nudge: {}", err);
        }
    }

    pub(crate) fn join(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Create one worker thread with its poller, wakeup channel and handoff
/// ring. Failing to acquire any of these is fatal to server startup.
pub(crate) fn spawn(
    id: u16,
    config: &Config,
    conns: Arc<ConnTable>,
    pipeline: Arc<dyn Pipeline>,
    barrier: Arc<Barrier>,
) -> io::Result<(WorkerHandle, WorkerControl)> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
    let (producer, consumer) = spsc::channel(conns.capacity());
    let stop = Arc::new(AtomicBool::new(false));

    let keep_alive_timeout = config.keep_alive_timeout;
    let expires = config.expires;
    let initial_flags = if config.allow_cors {
        Flags::CORS_ALLOWED
    } else {
        Flags::empty()
    };

    let table = Arc::clone(&conns);
    let stop_flag = Arc::clone(&stop);

    let join = thread::Builder::new()
        .name(format!("lyn-worker-{}", id))
        .spawn({
            let barrier = Arc::clone(&barrier);
            move || {
                Worker {
                    id,
                    poll,
                    conns: table,
                    pending: consumer,
                    dq: DeathQueue::new(keep_alive_timeout),
                    dates: Rc::new(RefCell::new(DateCache::new(expires))),
                    pipeline,
                    initial_flags,
                    stop: stop_flag,
                    barrier,
                }
                .io_loop()
            }
        })?;

    Ok((
        WorkerHandle {
            id,
            pending: producer,
            waker: Arc::clone(&waker),
            conns,
        },
        WorkerControl {
            stop,
            waker,
            join: Some(join),
        },
    ))
}

/// Thread-local state of one worker. Everything here is owned exclusively
/// by the worker's thread; no locks are taken inside the loop.
struct Worker {
    id: u16,
    poll: Poll,
    conns: Arc<ConnTable>,
    pending: spsc::Consumer,
    dq: DeathQueue,
    dates: Rc<RefCell<DateCache>>,
    pipeline: Arc<dyn Pipeline>,
    initial_flags: Flags,
    stop: Arc<AtomicBool>,
    barrier: Arc<Barrier>,
}

impl Worker {
    fn io_loop(mut self) {
        let mut events = Events::with_capacity(self.conns.capacity().min(MAX_EVENTS));

        debug!("starting I/O loop on worker #{}", self.id);
        self.barrier.wait();

        loop {
            match self.poll.poll(&mut events, self.dq.poll_timeout()) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("worker #{}: poll: {}", self.id, err);
                    break;
                }
                Ok(()) => {}
            }

            if self.stop.load(Ordering::Acquire) {
                break;
            }

            if events.is_empty() {
                // One timeout slice elapsed with no activity.
                self.reap_expired();
                continue;
            }

            self.dates.borrow_mut().update();

            for event in events.iter() {
                match event.token() {
                    WAKE_TOKEN => self.drain_handoff(),
                    Token(idx) => self.conn_event(idx as i32, event),
                }
            }
        }

        self.barrier.wait();
        self.kill_all();
        debug!("worker #{} drained", self.id);
    }

    /// Pop every pending descriptor, register it read-armed and spin up its
    /// coroutine. A descriptor that cannot be registered or given a
    /// coroutine is abandoned; the acceptor is expected to throttle.
    fn drain_handoff(&mut self) {
        while let Some(fd) = self.pending.pop() {
            if let Err(err) =
                self.poll
                    .registry()
                    .register(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)
            {
                error!("worker #{}: register fd {}: {}", self.id, fd, err);
                continue;
            }
            self.spawn_conn(fd);
        }
    }

    fn spawn_conn(&mut self, fd: RawFd) {
        let conns = Arc::clone(&self.conns);
        // Safety: ownership of the slot transferred to us with the SPSC pop.
        let conn = unsafe { conns.slot(fd as usize) };
        debug_assert!(conn.coro.is_none());
        debug_assert!(!conn.flags.contains(Flags::ALIVE));
        debug_assert_eq!(self.id, conn.worker);

        let pipeline = Arc::clone(&self.pipeline);
        let dates = Rc::clone(&self.dates);
        let initial_flags = self.initial_flags;

        let coro = match Coro::spawn(move |ctx| drive(ctx, fd, pipeline, dates, initial_flags)) {
            Ok(coro) => coro,
            Err(err) => {
                error!("worker #{}: could not create coroutine: {}", self.id, err);
                let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                return;
            }
        };

        conn.coro = Some(coro);
        conn.flags = Flags::ALIVE | Flags::SHOULD_RESUME;
        conn.time_to_die = self.dq.deadline();
        self.dq.insert(&self.conns, fd as i32);

        self.resume_conn(fd as i32);
    }

    fn conn_event(&mut self, idx: i32, event: &Event) {
        {
            // Safety: tokens only refer to slots this worker registered.
            let conn = unsafe { self.conns.slot(idx as usize) };
            // A stale event for a slot already torn down this cycle.
            if !conn.flags.contains(Flags::ALIVE) || conn.coro.is_none() {
                return;
            }
        }

        if event.is_read_closed() {
            self.destroy(idx);
            return;
        }

        self.resume_conn(idx);

        // Safety: as above.
        let alive = unsafe { self.conns.slot(idx as usize) }
            .flags
            .contains(Flags::ALIVE);
        if alive {
            self.dq.move_to_tail(&self.conns, idx);
        }
    }

    /// Resume the coroutine, record its needs in the slot flags and
    /// reprogram readiness interest when the wanted direction changed.
    fn resume_conn(&mut self, idx: i32) {
        let conns = Arc::clone(&self.conns);
        // Safety: this worker owns the slot.
        let conn = unsafe { conns.slot(idx as usize) };
        let Some(coro) = conn.coro.as_mut() else {
            return;
        };

        match coro.resume() {
            Disposition::Abort => {
                self.destroy(idx);
                return;
            }
            Disposition::MayResume => {
                // One request served; the peer asked us to stick around.
                conn.flags.insert(Flags::SHOULD_RESUME | Flags::KEEP_ALIVE);
                conn.flags.remove(Flags::MUST_READ);
            }
            Disposition::NeedRead => {
                conn.flags.insert(Flags::SHOULD_RESUME | Flags::MUST_READ);
            }
            Disposition::NeedWrite => {
                conn.flags.remove(Flags::SHOULD_RESUME | Flags::MUST_READ);
            }
        }

        let want_write = !conn
            .flags
            .intersects(Flags::MUST_READ | Flags::SHOULD_RESUME);
        let armed_write = conn.flags.contains(Flags::WRITE_EVENTS_ARMED);
        if want_write == armed_write {
            return;
        }

        let interest = if want_write {
            Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let fd = idx as RawFd;
        if let Err(err) =
            self.poll
                .registry()
                .reregister(&mut SourceFd(&fd), Token(idx as usize), interest)
        {
            // Transient; the connection keeps its previous arm.
            error!("worker #{}: reregister fd {}: {}", self.id, fd, err);
            return;
        }
        conn.flags.toggle(Flags::WRITE_EVENTS_ARMED);
    }

    /// Tear a connection down: unlink, clear the slot, deregister, then let
    /// the coroutine unwind. The fd closes when the coroutine's stream is
    /// dropped, which happens only after the slot is clean for kernel fd
    /// reuse.
    fn destroy(&mut self, idx: i32) {
        let conns = Arc::clone(&self.conns);
        // Safety: this worker owns the slot.
        let conn = unsafe { conns.slot(idx as usize) };
        if !conn.flags.contains(Flags::ALIVE) {
            return;
        }

        self.dq.remove(&self.conns, idx);
        let coro = conn.coro.take();
        conn.flags = Flags::empty();

        let fd = idx as RawFd;
        if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            debug!("worker #{}: deregister fd {}: {}", self.id, fd, err);
        }

        if let Some(coro) = coro {
            coro.free();
        }
    }

    /// Advance the tick and evict every expired head-of-queue connection,
    /// resetting the epoch once the queue drains.
    fn reap_expired(&mut self) {
        self.dq.tick();
        while let Some(idx) = self.dq.expired_head(&self.conns) {
            self.destroy(idx);
        }
        self.dq.reset_if_empty();
    }

    fn kill_all(&mut self) {
        while let Some(idx) = self.dq.head() {
            self.destroy(idx);
        }
    }
}
