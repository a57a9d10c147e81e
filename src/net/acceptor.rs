//! Accept loop.
//!
//! A single thread owns the listening socket and deals accepted descriptors
//! onto the worker pool round-robin. Hand-off is queue-push plus one wake
//! byte; everything after that happens on the owning worker.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, trace, warn};

use crate::net::worker::{HandOff, WorkerHandle};

const LISTENER_TOKEN: Token = Token(0);

/// Listen backlog.
const BACKLOG: i32 = 1024;

/// Poll timeout; bounds how long shutdown takes to be noticed.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Pause after EMFILE-class accept failures, so the workers get a chance to
/// release descriptors instead of the loop spinning on the error.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Queue-push attempts before an overloaded worker costs the client its
/// connection.
const DISPATCH_RETRIES: usize = 64;

/// The accept thread: listening socket, worker handles, dispatch counter.
pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    counter: usize,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    max_connections: usize,
}

impl Acceptor {
    /// Bind the listening socket. Fails fast on unusable addresses so the
    /// process can exit non-zero before any worker sees traffic.
    pub fn bind(
        addr: SocketAddr,
        shutdown: Arc<AtomicBool>,
        active: Arc<AtomicUsize>,
        max_connections: usize,
    ) -> io::Result<Self> {
        let listener = create_listener(addr)?;
        let local_addr = listener.local_addr()?;
        let listener = TcpListener::from_std(listener);
        info!(addr = %local_addr, "listening");
        Ok(Self {
            listener,
            local_addr,
            counter: 0,
            shutdown,
            active,
            max_connections,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept until told to stop. Runs on the caller's thread.
    pub fn run(mut self, workers: &[WorkerHandle]) -> io::Result<()> {
        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(8);
        poll.registry()
            .register(&mut self.listener, LISTENER_TOKEN, Interest::READABLE)?;

        while !self.shutdown.load(Ordering::Acquire) {
            match poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    self.accept_ready(workers);
                }
            }
        }

        info!("acceptor stopped");
        Ok(())
    }

    /// Accept as many connections as the socket will give before EAGAIN.
    fn accept_ready(&mut self, workers: &[WorkerHandle]) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.active.load(Ordering::Acquire) >= self.max_connections {
                        warn!(peer = %peer, "connection limit reached, rejecting");
                        drop(stream);
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "set_nodelay failed");
                    }
                    trace!(peer = %peer, "accepted");
                    let fd = stream.into_raw_fd();
                    self.active.fetch_add(1, Ordering::AcqRel);
                    self.dispatch(fd, workers);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EMFILE/ENFILE land here. Not fatal; pause briefly.
                    warn!(error = %e, "accept failed");
                    std::thread::sleep(ACCEPT_ERROR_BACKOFF);
                    break;
                }
            }
        }
    }

    /// Hand `fd` to the next worker in round-robin order and wake it.
    ///
    /// A full queue is retried a bounded number of times, waking the worker
    /// between attempts; if it stays full the connection is shed so the
    /// listener never blocks behind one saturated worker.
    fn dispatch(&mut self, fd: RawFd, workers: &[WorkerHandle]) {
        let worker = &workers[self.counter % workers.len()];
        self.counter = self.counter.wrapping_add(1);

        let mut handoff = HandOff {
            fd,
            interest: Interest::READABLE,
        };
        for _ in 0..DISPATCH_RETRIES {
            match worker.queue.push(handoff) {
                Ok(()) => {
                    worker.wake.notify();
                    trace!(fd, worker = worker.id, "dispatched");
                    return;
                }
                Err(back) => {
                    handoff = back;
                    worker.wake.notify();
                    std::thread::yield_now();
                }
            }
        }

        warn!(fd, worker = worker.id, "hand-off queue full, rejecting connection");
        unsafe {
            libc::close(fd);
        }
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Build the listening socket: right address family, `SO_REUSEADDR`,
/// non-blocking, fixed backlog.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}
