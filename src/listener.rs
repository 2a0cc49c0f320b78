//! The accepting side: binds a socket, accepts connections and hands them
//! to the worker pool.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::IntoRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::error;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::Server;

const LISTEN_TOKEN: Token = Token(usize::MAX);
const STOP_TOKEN: Token = Token(usize::MAX - 1);

/// Socket listener for the server. Runs on its own thread and only ever
/// accepts and hands off; all per-connection work happens on the workers.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    poll: Poll,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl Listener {
    /// Bind `addr` and register it with a fresh poller.
    pub fn bind(addr: SocketAddr) -> io::Result<Listener> {
        let mut inner = TcpListener::bind(addr)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut inner, LISTEN_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), STOP_TOKEN)?);

        Ok(Listener {
            inner,
            poll,
            stop: Arc::new(AtomicBool::new(false)),
            waker,
        })
    }

    /// The bound address; useful when binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// A handle that makes [`run`](Listener::run) return.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Accept connections until stopped, handing each to `server`. Returns
    /// the server so the caller can shut the pool down.
    pub fn run(mut self, mut server: Server) -> Server {
        let mut events = Events::with_capacity(256);

        loop {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("listener: poll: {}", err);
                return server;
            }

            for event in events.iter() {
                if event.token() == LISTEN_TOKEN {
                    self.accept(&mut server);
                }
            }

            if self.stop.load(Ordering::Acquire) {
                return server;
            }
        }
    }

    fn accept(&mut self, server: &mut Server) {
        loop {
            match self.inner.accept() {
                Ok((stream, _)) => {
                    let _ = stream.set_nodelay(true);
                    server.add_client(stream.into_raw_fd());
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    error!("listener: accept: {}", err);
                    return;
                }
            }
        }
    }
}

/// Stops a running [`Listener`] from another thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    /// Make the listener's `run` loop return after the current wake cycle.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Err(err) = self.waker.wake() {
            error!("listener: stop nudge: {}", err);
        }
    }
}
