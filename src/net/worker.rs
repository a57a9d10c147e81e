//! I/O worker threads.
//!
//! Each worker owns a reactor and serves every connection handed to it for
//! the connection's whole life. Hand-offs arrive over a bounded lock-free
//! queue paired with a wake pipe whose read end is registered with the
//! reactor; one pipe byte may cover any number of queue entries.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_queue::ArrayQueue;
use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{error, info, trace, warn};

use crate::net::connection::{ConnRef, ConnectionRegistry};
use crate::net::machine::{self, Transition};
use crate::protocols::ProtocolKind;

/// Reactor token reserved for the wake pipe's read end. Connection tokens
/// are descriptor numbers and can never collide with it.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Events processed per poll iteration.
const EVENT_CAPACITY: usize = 256;

/// A connection hand-off record: the accepted descriptor and the reactor
/// mask it starts with.
#[derive(Debug, Clone, Copy)]
pub struct HandOff {
    pub fd: RawFd,
    pub interest: Interest,
}

/// Anonymous pipe used to interrupt a worker's poll.
///
/// Both ends are non-blocking. Producers write a byte per hand-off; the
/// worker drains the pipe in one gulp, so wake bytes coalesce.
pub struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakePipe {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let pipe = Self {
            read_fd: fds[0],
            write_fd: fds[1],
        };
        set_nonblocking_cloexec(pipe.read_fd)?;
        set_nonblocking_cloexec(pipe.write_fd)?;
        Ok(pipe)
    }

    /// Clonable write end.
    pub fn notifier(&self) -> WakeHandle {
        WakeHandle { fd: self.write_fd }
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Read the pipe dry. Returns the number of wake bytes consumed.
    pub fn drain(&self) -> usize {
        let mut total = 0;
        let mut scratch = [0u8; 256];
        loop {
            let n = unsafe { libc::read(self.read_fd, scratch.as_mut_ptr().cast(), scratch.len()) };
            if n > 0 {
                total += n as usize;
                continue;
            }
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
            }
            // EAGAIN, EOF, or a hard error all mean there is nothing left
            // to take right now.
            return total;
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// Write end of a worker's wake pipe, shared with producers.
#[derive(Debug, Clone, Copy)]
pub struct WakeHandle {
    fd: RawFd,
}

impl WakeHandle {
    /// Write one wake byte. A full pipe already guarantees a pending
    /// readable event, so EAGAIN counts as delivered.
    pub fn notify(&self) {
        let byte = [1u8];
        loop {
            let n = unsafe { libc::write(self.fd, byte.as_ptr().cast(), 1) };
            if n >= 0 {
                return;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return,
                _ => {
                    warn!(error = %err, "wake pipe write failed");
                    return;
                }
            }
        }
    }
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(io::Error::last_os_error());
        }
        let fd_flags = libc::fcntl(fd, libc::F_GETFD, 0);
        if fd_flags == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Handle kept by the acceptor and the server once the worker thread runs.
pub struct WorkerHandle {
    pub id: usize,
    pub queue: Arc<ArrayQueue<HandOff>>,
    pub wake: WakeHandle,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn join(self) {
        let _ = self.thread.join();
    }
}

/// An I/O worker: one reactor, one thread, a share of the connections.
pub struct Worker {
    id: usize,
    poll: Poll,
    wake: WakePipe,
    queue: Arc<ArrayQueue<HandOff>>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    protocol: ProtocolKind,
    /// Token → slot table for connections currently owned by this worker.
    connections: HashMap<usize, ConnRef>,
}

impl Worker {
    /// Create the reactor and wake pipe, then launch the worker thread.
    pub fn spawn(
        id: usize,
        queue_size: usize,
        registry: Arc<ConnectionRegistry>,
        shutdown: Arc<AtomicBool>,
        active: Arc<AtomicUsize>,
        protocol: ProtocolKind,
    ) -> io::Result<WorkerHandle> {
        let poll = Poll::new()?;
        let wake = WakePipe::new()?;
        poll.registry()
            .register(&mut SourceFd(&wake.read_fd()), WAKE_TOKEN, Interest::READABLE)?;
        let notifier = wake.notifier();
        let queue = Arc::new(ArrayQueue::new(queue_size));

        let worker = Worker {
            id,
            poll,
            wake,
            queue: Arc::clone(&queue),
            registry,
            shutdown,
            active,
            protocol,
            connections: HashMap::new(),
        };

        let thread = thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || {
                if let Err(e) = worker.run() {
                    error!(worker = id, error = %e, "worker failed");
                }
            })?;

        Ok(WorkerHandle {
            id,
            queue,
            wake: notifier,
            thread,
        })
    }

    /// Reactor loop: wake events hand connections in, connection events run
    /// the state machine. Exits once the stop flag is observed.
    fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        info!(worker = self.id, "worker started");

        loop {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    WAKE_TOKEN => self.on_wake(),
                    Token(token) => self.on_connection_event(token),
                }
            }

            if self.shutdown.load(Ordering::Acquire) {
                self.drain_queue_on_shutdown();
                self.close_all();
                break;
            }
        }

        info!(worker = self.id, "worker stopped");
        Ok(())
    }

    /// Clear the pipe first, then the queue; that order cannot lose a
    /// wake-up for an entry pushed concurrently.
    fn on_wake(&mut self) {
        self.wake.drain();
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        while let Some(handoff) = self.queue.pop() {
            self.adopt(handoff);
        }
    }

    /// Take ownership of an accepted descriptor: wrap it, create or recycle
    /// its registry slot, and register it with this worker's reactor.
    fn adopt(&mut self, handoff: HandOff) {
        // SAFETY: the acceptor transferred sole ownership of this open
        // descriptor through the hand-off queue.
        let stream = unsafe { TcpStream::from_raw_fd(handoff.fd) };
        match self.registry.create_or_reset(
            handoff.fd,
            stream,
            handoff.interest,
            self.id,
            self.poll.registry(),
            self.protocol,
        ) {
            Ok(slot) => {
                trace!(worker = self.id, fd = handoff.fd, "connection adopted");
                self.connections.insert(handoff.fd as usize, slot);
            }
            Err(e) => {
                // The stream was dropped inside reset, so the fd is already
                // released.
                warn!(worker = self.id, fd = handoff.fd, error = %e, "failed to adopt connection");
                self.active.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    fn on_connection_event(&mut self, token: usize) {
        let slot = match self.connections.get(&token) {
            Some(slot) => *slot,
            None => return, // stale event for a closed connection
        };
        // SAFETY: this worker received the slot through the hand-off queue
        // and is the only thread touching it until close.
        let conn = unsafe { slot.get() };
        match machine::drive(conn) {
            Transition::Open => {}
            Transition::Closed => {
                self.connections.remove(&token);
                self.active.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Release descriptors that were accepted but never served.
    fn drain_queue_on_shutdown(&mut self) {
        while let Some(handoff) = self.queue.pop() {
            unsafe {
                libc::close(handoff.fd);
            }
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn close_all(&mut self) {
        let count = self.connections.len();
        for (_, slot) in self.connections.drain() {
            // SAFETY: same single-owner argument as `on_connection_event`.
            let conn = unsafe { slot.get() };
            conn.close_socket();
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
        if count > 0 {
            info!(worker = self.id, closed = count, "connections closed on shutdown");
        }
    }
}
