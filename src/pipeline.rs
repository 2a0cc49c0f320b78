//! The coroutine body that drives one connection through the request
//! pipeline, plus the suspendable socket I/O it hands to the pipeline.

use std::cell::{Ref, RefCell};
use std::fmt::{self, Debug};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{FromRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;

use crate::conn::{Flags, CROSS_REQUEST_FLAGS};
use crate::coro::{CoroRef, Disposition};
use crate::date::DateCache;

/// Size of the per-connection read buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Handles one request on a connection: consume bytes from `buf` starting at
/// `next` (or 0), write the response through `io`, and report where a
/// pipelined follow-up request begins in the buffer, if any.
///
/// Implementations set [`Flags::KEEP_ALIVE`] in `request.flags` iff the peer
/// asked for the connection to persist. Any `Err` aborts the connection.
pub trait Pipeline: Send + Sync + 'static {
    /// Serve a single request.
    fn serve(
        &self,
        io: &mut ConnIo<'_>,
        request: &mut Request<'_>,
        buf: &mut ReadBuffer,
        next: Option<usize>,
    ) -> io::Result<Option<usize>>;
}

/// The shell of one HTTP exchange, handed to the pipeline.
#[derive(Debug)]
pub struct Request<'a> {
    /// Connection flags as of this request. `KEEP_ALIVE` is set by the
    /// pipeline; `PROXIED` and `CORS_ALLOWED` survive across requests.
    pub flags: Flags,
    /// Backing store for response bytes, reset between requests. Its storage
    /// outlives every request on the connection.
    pub response: &'a mut Response,
    pub(crate) dates: Rc<RefCell<DateCache>>,
}

impl Request<'_> {
    /// The owning worker's date cache. The snapshot is consistent for the
    /// whole wake cycle; do not hold the borrow across a yield.
    pub fn date(&self) -> Ref<'_, DateCache> {
        self.dates.borrow()
    }
}

/// Growable response buffer, reused across the requests of a connection.
#[derive(Debug, Default)]
pub struct Response {
    buf: Vec<u8>,
}

impl Response {
    /// An empty buffer.
    pub fn new() -> Self {
        Response::default()
    }

    /// The accumulated response bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Discard the accumulated bytes, keeping the allocation.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl Write for Response {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Fixed-size buffer of raw request bytes read from the socket.
pub struct ReadBuffer {
    buf: Box<[u8]>,
    len: usize,
}

impl ReadBuffer {
    /// A zeroed buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        ReadBuffer {
            buf: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// The bytes received so far.
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Whether no further bytes fit.
    pub fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    /// Read more bytes from the socket, suspending until some arrive.
    /// Returns the number read; 0 means the peer closed its write side.
    pub fn fill(&mut self, io: &mut ConnIo<'_>) -> io::Result<usize> {
        debug_assert!(!self.is_full());
        let read = io.read_some(&mut self.buf[self.len..])?;
        self.len += read;
        Ok(read)
    }

    /// Drop everything before `offset`, moving the remainder to the front.
    pub fn shift(&mut self, offset: usize) {
        self.buf.copy_within(offset..self.len, 0);
        self.len -= offset;
    }

    /// Discard all buffered bytes.
    pub fn reset(&mut self) {
        self.len = 0;
    }
}

impl Debug for ReadBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadBuffer")
            .field("len", &self.len)
            .field("capacity", &self.buf.len())
            .finish()
    }
}

/// A connection's socket, wrapped so that would-block turns into a coroutine
/// suspension instead of an error. Dropping it closes the descriptor.
#[derive(Debug)]
pub struct ConnIo<'a, S: Read + Write = TcpStream> {
    stream: S,
    coro: &'a CoroRef<'a>,
}

impl<'a, S: Read + Write> ConnIo<'a, S> {
    pub(crate) fn new(stream: S, coro: &'a CoroRef<'a>) -> Self {
        ConnIo { stream, coro }
    }

    /// Read at least one byte into `buf`, yielding `NeedRead` until the
    /// socket has data. Returns 0 on peer shutdown.
    pub fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stream.read(buf) {
                Ok(read) => return Ok(read),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.coro.yield_with(Disposition::NeedRead);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Write all of `bytes`, yielding `NeedWrite` whenever the socket's send
    /// buffer is full.
    pub fn write_all(&mut self, mut bytes: &[u8]) -> io::Result<()> {
        while !bytes.is_empty() {
            match self.stream.write(bytes) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => bytes = &bytes[written..],
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.coro.yield_with(Disposition::NeedWrite);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// The connection coroutine body: serve requests forever, yielding between
/// them. Terminal paths yield `Abort` rather than returning, so the socket
/// is closed by stack unwinding only once the worker has torn the slot down.
pub(crate) fn drive(
    ctx: &CoroRef<'_>,
    fd: RawFd,
    pipeline: Arc<dyn Pipeline>,
    dates: Rc<RefCell<DateCache>>,
    initial_flags: Flags,
) -> Disposition {
    // Safety: the worker transfers sole ownership of the fd to this
    // coroutine; nothing else reads, writes or closes it.
    let stream = unsafe { TcpStream::from_raw_fd(fd) };
    let mut io = ConnIo::new(stream, ctx);
    let mut response = Response::new();
    let mut buf = ReadBuffer::new(DEFAULT_BUFFER_SIZE);
    let mut next = None;
    let mut flags = initial_flags;

    loop {
        let mut request = Request {
            flags,
            response: &mut response,
            dates: Rc::clone(&dates),
        };

        let generation = ctx.deferred_generation();
        let served = pipeline.serve(&mut io, &mut request, &mut buf, next);
        ctx.run_deferred(generation);

        let keep_alive = request.flags.contains(Flags::KEEP_ALIVE);
        let carried = request.flags & CROSS_REQUEST_FLAGS;

        next = match served {
            Ok(next) => next,
            Err(_) => {
                ctx.yield_with(Disposition::Abort);
                unreachable!();
            }
        };

        if !keep_alive {
            ctx.yield_with(Disposition::Abort);
            unreachable!();
        }

        // A pipelined follow-up request is served back to back, without an
        // intervening trip through the reactor.
        if next.is_none() {
            ctx.yield_with(Disposition::MayResume);
        }

        response.clear();
        flags = carried;
    }
}
