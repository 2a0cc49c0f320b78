#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! lyn is a low-level HTTP server core that multiplexes thousands of client
//! connections onto a small fixed pool of worker threads. Each worker owns
//! one edge-triggered poller and drives every one of its connections with a
//! stackful coroutine; keep-alive timeouts ride on an O(1) intrusive death
//! queue, and the acceptor hands freshly accepted sockets to workers over a
//! wait-free SPSC ring.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use lyn::h1::{H1Pipeline, Reply};
//! use lyn::listener::Listener;
//! use lyn::{Config, Server};
//!
//! fn main() -> std::io::Result<()> {
//!     let pipeline = H1Pipeline::new(|_req: &lyn::h1::RequestHead<'_>| {
//!         Reply::text("Hello, World!")
//!     });
//!     let server = Server::start(&Config::default(), Arc::new(pipeline))?;
//!     let listener = Listener::bind("127.0.0.1:8080".parse().unwrap())?;
//!     listener.run(server).shutdown();
//!     Ok(())
//! }
//! ```

pub mod conn;
pub mod coro;
pub mod date;
pub mod death_queue;
pub mod h1;
pub mod listener;
pub mod pipeline;
pub mod spsc;
pub mod worker;

use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Barrier};
use std::thread;

use log::debug;

use crate::conn::ConnTable;
use crate::pipeline::Pipeline;
use crate::worker::{WorkerControl, WorkerHandle};

/// Tunables for the worker pool.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker threads; 0 means one per available core.
    pub workers: usize,
    /// Keep-alive timeout in death-queue ticks (one tick per second).
    pub keep_alive_timeout: u32,
    /// Seconds added to the current time for the `Expires` header.
    pub expires: u64,
    /// Allow cross-origin requests on every connection.
    pub allow_cors: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workers: 0,
            keep_alive_timeout: 15,
            expires: 86_400,
            allow_cors: false,
        }
    }
}

/// The worker pool plus the shared connection table. Dropping the server
/// shuts the pool down.
#[derive(Debug)]
pub struct Server {
    handles: Vec<WorkerHandle>,
    controls: Vec<WorkerControl>,
    conns: Arc<ConnTable>,
    barrier: Arc<Barrier>,
    stopped: bool,
}

impl Server {
    /// Start the worker pool. Returns once every worker has entered its I/O
    /// loop (startup rendezvous). Failure to acquire any foundational
    /// resource here is fatal to the server.
    pub fn start(config: &Config, pipeline: Arc<dyn Pipeline>) -> io::Result<Server> {
        let conns = Arc::new(ConnTable::new(open_file_limit()));

        let workers = match config.workers {
            0 => thread::available_parallelism().map_or(1, |cores| cores.get()),
            n => n,
        };
        let barrier = Arc::new(Barrier::new(workers + 1));

        debug!("initializing {} workers", workers);
        let mut handles = Vec::with_capacity(workers);
        let mut controls = Vec::with_capacity(workers);
        for id in 0..workers {
            let (handle, control) = worker::spawn(
                id as u16,
                config,
                Arc::clone(&conns),
                Arc::clone(&pipeline),
                Arc::clone(&barrier),
            )?;
            handles.push(handle);
            controls.push(control);
        }

        barrier.wait();
        debug!("I/O workers created and ready to serve");

        Ok(Server {
            handles,
            controls,
            conns,
            barrier,
            stopped: false,
        })
    }

    /// Hand a freshly accepted socket to its worker and wake it. Ownership
    /// of the descriptor passes to the pool. Routing is by `fd % workers`,
    /// which keeps any given fd value pinned to one worker.
    pub fn add_client(&mut self, fd: RawFd) {
        let worker = fd as usize % self.handles.len();
        self.handles[worker].add_client(fd);
        self.handles[worker].nudge();
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Size of the connection table (the open-file limit at startup).
    pub fn max_clients(&self) -> usize {
        self.conns.capacity()
    }

    /// Stop every worker: each is flagged and nudged, the shutdown
    /// rendezvous completes, then all remaining connections are drained and
    /// the threads joined. Idempotent.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        debug!("shutting down workers");
        for control in &self.controls {
            control.request_stop();
        }
        self.barrier.wait();
        for control in &mut self.controls {
            control.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The soft `RLIMIT_NOFILE` limit, clamped to keep the preallocated
/// connection table bounded under unlimited rlimits.
fn open_file_limit() -> usize {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // Safety: plain out-parameter syscall.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return 1024;
    }
    if limit.rlim_cur == libc::RLIM_INFINITY {
        1 << 20
    } else {
        (limit.rlim_cur as usize).min(1 << 20)
    }
}
