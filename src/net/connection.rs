//! Per-client connections and the process-wide connection registry.
//!
//! A `Connection` couples a non-blocking socket with its read/write buffers,
//! the reactor registration for the worker that owns it, and the protocol
//! handler for the current session. The registry maps OS descriptor numbers
//! to connection slots that are recycled, never freed.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::debug;

use crate::net::buffer::Buffer;
use crate::net::protocol::{HandlerStatus, PacketHandler, LENGTH_FIELD_LEN, PACKET_HEADER_LEN};
use crate::protocols::{self, ProtocolKind};

/// A single client connection.
pub struct Connection {
    /// Descriptor number this connection's registry slot is keyed by.
    fd: RawFd,
    /// The socket; `None` once the session has been closed.
    stream: Option<TcpStream>,
    /// Latches true once per session; cleared only by `reset`.
    disconnected: bool,
    /// Reactor mask currently registered for the socket.
    interest: Option<Interest>,
    /// Reactor handle of the owning worker; lives as long as the
    /// registration.
    registry: Option<Registry>,
    /// Worker currently driving this connection.
    worker_id: usize,
    kind: ProtocolKind,
    rbuf: Buffer,
    wbuf: Buffer,
    /// Session protocol handler, created lazily on first use.
    handler: Option<Box<dyn PacketHandler>>,
}

impl Connection {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            stream: None,
            disconnected: true,
            interest: None,
            registry: None,
            worker_id: 0,
            kind: ProtocolKind::Echo,
            rbuf: Buffer::new(),
            wbuf: Buffer::new(),
            handler: None,
        }
    }

    /// Reinitialize for a fresh session on a (possibly recycled) descriptor:
    /// clear the buffers, drop the handler, clear the disconnect latch, and
    /// register the socket with the new owner's reactor.
    pub fn reset(
        &mut self,
        stream: TcpStream,
        interest: Interest,
        worker_id: usize,
        registry: Registry,
        kind: ProtocolKind,
    ) -> io::Result<()> {
        self.close_socket();
        self.rbuf.reset();
        self.wbuf.reset();
        self.handler = None;
        self.worker_id = worker_id;
        self.kind = kind;

        let mut stream = stream;
        registry.register(&mut stream, Token(self.fd as usize), interest)?;
        self.stream = Some(stream);
        self.registry = Some(registry);
        self.interest = Some(interest);
        self.disconnected = false;
        Ok(())
    }

    #[allow(dead_code)]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Reactor mask currently registered, if the socket is registered.
    #[allow(dead_code)]
    pub fn interest(&self) -> Option<Interest> {
        self.interest
    }

    /// Bytes buffered and ready for the handler.
    pub fn available(&self) -> usize {
        self.rbuf.remaining()
    }

    /// The buffered input without consuming it.
    pub fn peek_input(&self) -> &[u8] {
        self.rbuf.peek()
    }

    /// Discard `n` bytes of buffered input.
    pub fn consume_input(&mut self, n: usize) {
        self.rbuf.consume(n);
    }

    /// True while flushed output is still queued in the write buffer.
    pub fn has_pending_write(&self) -> bool {
        !self.wbuf.is_empty()
    }

    /// Issue one non-blocking read into the read buffer.
    ///
    /// Returns true when at least one new byte arrived. Returns false on
    /// EAGAIN without touching the disconnect latch, and false on EOF or any
    /// hard error after setting it.
    pub fn refill_read_buffer(&mut self) -> bool {
        if self.rbuf.unfilled() == 0 {
            self.rbuf.compact();
        }
        if self.rbuf.unfilled() == 0 {
            // Buffer full and nothing consumed; the handler must take some
            // bytes before more can arrive.
            return false;
        }
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => {
                self.disconnected = true;
                return false;
            }
        };
        loop {
            match stream.read(self.rbuf.unfilled_mut()) {
                Ok(0) => {
                    self.disconnected = true;
                    return false;
                }
                Ok(n) => {
                    self.rbuf.advance(n);
                    return true;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "read failed");
                    self.disconnected = true;
                    return false;
                }
            }
        }
    }

    /// Ensure `out.len()` bytes are buffered, refilling as needed, then copy
    /// them out and advance the cursor.
    ///
    /// Fails with `WouldBlock` when input dries up before enough bytes
    /// arrive and with `ConnectionReset` when a refill fails hard. Requests
    /// must not exceed the buffer capacity; larger packets are consumed in
    /// pieces.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> io::Result<()> {
        debug_assert!(
            out.len() <= self.rbuf.capacity(),
            "read request exceeds buffer capacity"
        );
        while self.rbuf.remaining() < out.len() {
            if !self.refill_read_buffer() {
                return Err(if self.disconnected {
                    io::ErrorKind::ConnectionReset.into()
                } else {
                    io::ErrorKind::WouldBlock.into()
                });
            }
        }
        out.copy_from_slice(&self.rbuf.peek()[..out.len()]);
        self.rbuf.consume(out.len());
        Ok(())
    }

    /// Frame `payload` into the write buffer as `[type][len][bytes]`, where
    /// the big-endian length word counts itself plus the payload.
    ///
    /// Flushes first when a packet does not fit; payloads larger than the
    /// buffer are split into maximal chunks, each under its own header.
    /// Returns how many payload bytes were accepted; anything short of
    /// `payload.len()` means the socket pushed back mid-packet and the
    /// caller should retry the remainder once the connection is writable.
    /// An empty payload emits a bare header or fails with `WouldBlock`.
    pub fn buffer_write_bytes(&mut self, payload: &[u8], msg_type: u8) -> io::Result<usize> {
        let max_payload = self.wbuf.capacity() - PACKET_HEADER_LEN;
        let mut accepted = 0;
        loop {
            let rest = &payload[accepted..];
            let chunk = rest.len().min(max_payload);
            let frame_len = PACKET_HEADER_LEN + chunk;

            if self.wbuf.unfilled() < frame_len {
                self.wbuf.compact();
            }
            if self.wbuf.unfilled() < frame_len && !self.flush_write_buffer()? {
                if payload.is_empty() {
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                return Ok(accepted);
            }

            let mut header = [0u8; PACKET_HEADER_LEN];
            header[0] = msg_type;
            header[1..].copy_from_slice(&((LENGTH_FIELD_LEN + chunk) as u32).to_be_bytes());
            self.wbuf.append(&header);
            self.wbuf.append(&rest[..chunk]);
            accepted += chunk;

            if accepted >= payload.len() {
                return Ok(accepted);
            }
        }
    }

    /// Write everything buffered to the socket, looping over partial writes.
    ///
    /// `Ok(true)` means the buffer drained; `Ok(false)` means the socket
    /// pushed back and the remainder stays queued for a writable event. Hard
    /// errors set the disconnect latch.
    pub fn flush_write_buffer(&mut self) -> io::Result<bool> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(io::ErrorKind::NotConnected.into()),
        };
        while !self.wbuf.is_empty() {
            match stream.write(self.wbuf.peek()) {
                Ok(0) => {
                    self.disconnected = true;
                    return Err(io::ErrorKind::WriteZero.into());
                }
                Ok(n) => self.wbuf.consume(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "write failed");
                    self.disconnected = true;
                    return Err(e);
                }
            }
        }
        Ok(true)
    }

    /// Change the registered reactor mask. No-op when the mask already
    /// matches or the socket is gone.
    pub fn rearm(&mut self, interest: Interest) -> io::Result<()> {
        if self.interest == Some(interest) {
            return Ok(());
        }
        let (stream, registry) = match (self.stream.as_mut(), self.registry.as_ref()) {
            (Some(stream), Some(registry)) => (stream, registry),
            _ => return Ok(()),
        };
        registry.reregister(stream, Token(self.fd as usize), interest)?;
        self.interest = Some(interest);
        Ok(())
    }

    /// Tear down the session: deregister, close the descriptor, latch the
    /// disconnect flag. Idempotent; the registry slot stays behind for
    /// reuse.
    pub fn close_socket(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Some(registry) = self.registry.as_ref() {
                let _ = registry.deregister(&mut stream);
            }
            debug!(fd = self.fd, worker = self.worker_id, "connection closed");
        }
        self.registry = None;
        self.interest = None;
        self.disconnected = true;
    }

    /// Invoke the protocol handler, creating it on first use.
    pub fn process(&mut self) -> HandlerStatus {
        let mut handler = self
            .handler
            .take()
            .unwrap_or_else(|| protocols::make_handler(self.kind));
        let status = handler.process(self);
        self.handler = Some(handler);
        status
    }
}

/// Number of interior shards guarding the fd → slot map.
const REGISTRY_SHARDS: usize = 16;

/// One registry slot.
///
/// The shard lock guards only the map; the connection inside the cell is
/// dereferenced without a guard by whichever worker most recently received
/// the slot through the hand-off queue.
pub struct ConnSlot(UnsafeCell<Connection>);

// SAFETY: slots cross threads only through `create_or_reset`, and the
// hand-off protocol guarantees at most one thread dereferences the cell at
// any time (see `ConnSlot::get`).
unsafe impl Sync for ConnSlot {}

/// Non-owning reference to a registry slot. Slots are never freed, so the
/// reference is `'static`.
pub type ConnRef = &'static ConnSlot;

impl ConnSlot {
    /// # Safety
    /// The caller must be the worker that most recently received this slot
    /// from `create_or_reset`, and must not hold any other reference into
    /// it.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get(&self) -> &mut Connection {
        &mut *self.0.get()
    }
}

/// Process-wide table of connections, indexed by descriptor number.
///
/// Slots are created on the first accept of an fd number, recycled when the
/// OS hands the same number out again, and never deleted for the life of
/// the process.
pub struct ConnectionRegistry {
    shards: Vec<Mutex<HashMap<RawFd, ConnRef>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            shards: (0..REGISTRY_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, fd: RawFd) -> &Mutex<HashMap<RawFd, ConnRef>> {
        &self.shards[fd as usize % REGISTRY_SHARDS]
    }

    /// The slot for `fd`, if one was ever created.
    #[allow(dead_code)]
    pub fn get(&self, fd: RawFd) -> Option<ConnRef> {
        self.shard(fd).lock().unwrap().get(&fd).copied()
    }

    /// Insert a fresh slot for `fd` or recycle the existing one, resetting
    /// it for a new session owned by `worker_id`.
    pub fn create_or_reset(
        &self,
        fd: RawFd,
        stream: TcpStream,
        interest: Interest,
        worker_id: usize,
        reactor: &Registry,
        kind: ProtocolKind,
    ) -> io::Result<ConnRef> {
        let slot = {
            let mut shard = self.shard(fd).lock().unwrap();
            *shard
                .entry(fd)
                .or_insert_with(|| Box::leak(Box::new(ConnSlot(UnsafeCell::new(Connection::new(fd))))))
        };
        // SAFETY: the acceptor dispatches an fd only after any previous
        // session on it was closed by its former worker, so no other
        // reference into this slot is live.
        let conn = unsafe { slot.get() };
        conn.reset(stream, interest, worker_id, reactor.try_clone()?, kind)?;
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Poll;
    use std::io::Read as _;
    use std::net::{TcpListener as StdListener, TcpStream as StdStream};
    use std::os::unix::io::AsRawFd;
    use std::time::{Duration, Instant};

    fn pair() -> (StdStream, TcpStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let peer = StdStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        (peer, TcpStream::from_std(accepted))
    }

    fn connection(poll: &Poll) -> (StdStream, Connection) {
        let (peer, stream) = pair();
        let fd = stream.as_raw_fd();
        let mut conn = Connection::new(fd);
        conn.reset(
            stream,
            Interest::READABLE,
            0,
            poll.registry().try_clone().unwrap(),
            ProtocolKind::Echo,
        )
        .unwrap();
        (peer, conn)
    }

    fn read_bytes_eventually(conn: &mut Connection, out: &mut [u8]) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match conn.read_bytes(out) {
                Ok(()) => return,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    assert!(Instant::now() < deadline, "timed out waiting for input");
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("read failed: {e}"),
            }
        }
    }

    /// Split `[type][len][payload]` frames out of a raw byte stream.
    fn parse_frames(mut wire: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut frames = Vec::new();
        while !wire.is_empty() {
            assert!(wire.len() >= PACKET_HEADER_LEN, "truncated header");
            let msg_type = wire[0];
            let len = u32::from_be_bytes(wire[1..5].try_into().unwrap()) as usize;
            assert!(len >= LENGTH_FIELD_LEN);
            let payload_len = len - LENGTH_FIELD_LEN;
            assert!(wire.len() >= PACKET_HEADER_LEN + payload_len, "truncated payload");
            frames.push((msg_type, wire[5..5 + payload_len].to_vec()));
            wire = &wire[PACKET_HEADER_LEN + payload_len..];
        }
        frames
    }

    #[test]
    fn test_frame_round_trip() {
        let poll = Poll::new().unwrap();
        let (mut peer, mut conn) = connection(&poll);

        assert_eq!(conn.buffer_write_bytes(b"hello", 0x41).unwrap(), 5);
        assert!(conn.flush_write_buffer().unwrap());

        let mut wire = [0u8; 10];
        peer.read_exact(&mut wire).unwrap();
        assert_eq!(&wire, &[0x41, 0x00, 0x00, 0x00, 0x09, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_write_order_preserved() {
        let poll = Poll::new().unwrap();
        let (mut peer, mut conn) = connection(&poll);

        conn.buffer_write_bytes(b"first", 0x01).unwrap();
        conn.buffer_write_bytes(b"second", 0x02).unwrap();
        assert!(conn.flush_write_buffer().unwrap());
        drop(conn);

        let mut wire = Vec::new();
        peer.read_to_end(&mut wire).unwrap();
        let frames = parse_frames(&wire);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], (0x01, b"first".to_vec()));
        assert_eq!(frames[1], (0x02, b"second".to_vec()));
    }

    #[test]
    fn test_oversized_payload_chunks() {
        let poll = Poll::new().unwrap();
        let (mut peer, mut conn) = connection(&poll);

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(conn.buffer_write_bytes(&payload, 0x41).unwrap(), payload.len());
        while !conn.flush_write_buffer().unwrap() {}
        drop(conn);

        let mut wire = Vec::new();
        peer.read_to_end(&mut wire).unwrap();
        let frames = parse_frames(&wire);
        assert!(frames.len() >= 2, "oversized payload should split");
        let mut reassembled = Vec::new();
        for (msg_type, chunk) in &frames {
            assert_eq!(*msg_type, 0x41);
            assert!(chunk.len() + PACKET_HEADER_LEN <= crate::net::buffer::SOCKET_BUFFER_SIZE);
            reassembled.extend_from_slice(chunk);
        }
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn test_read_bytes_across_fragmentation() {
        let poll = Poll::new().unwrap();
        let (mut peer, mut conn) = connection(&poll);

        use std::io::Write as _;
        peer.write_all(b"abc").unwrap();
        let mut first = [0u8; 2];
        read_bytes_eventually(&mut conn, &mut first);
        assert_eq!(&first, b"ab");

        peer.write_all(b"def").unwrap();
        let mut rest = [0u8; 4];
        read_bytes_eventually(&mut conn, &mut rest);
        assert_eq!(&rest, b"cdef");
    }

    #[test]
    fn test_eof_sets_disconnected() {
        let poll = Poll::new().unwrap();
        let (peer, mut conn) = connection(&poll);
        drop(peer);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !conn.is_disconnected() {
            assert!(Instant::now() < deadline, "EOF never observed");
            conn.refill_read_buffer();
            std::thread::sleep(Duration::from_millis(5));
        }
        // The latch holds and close stays idempotent.
        conn.close_socket();
        conn.close_socket();
        assert!(conn.is_disconnected());
    }

    #[test]
    fn test_registry_recycles_slot() {
        let poll = Poll::new().unwrap();
        let registry = ConnectionRegistry::new();
        let key: RawFd = 4242;

        let (_peer1, stream1) = pair();
        let slot1 = registry
            .create_or_reset(key, stream1, Interest::READABLE, 0, poll.registry(), ProtocolKind::Echo)
            .unwrap();
        assert!(registry.get(key).is_some());

        // End the first session the way a worker would.
        unsafe { slot1.get() }.close_socket();

        let (_peer2, stream2) = pair();
        let slot2 = registry
            .create_or_reset(key, stream2, Interest::READABLE, 1, poll.registry(), ProtocolKind::Echo)
            .unwrap();

        assert!(std::ptr::eq(slot1, slot2), "fd reuse must recycle the slot");
        let conn = unsafe { slot2.get() };
        assert!(!conn.is_disconnected());
        assert_eq!(conn.worker_id(), 1);
        assert_eq!(conn.available(), 0);
    }
}
