//! Byte-echo session handler.
//!
//! Inbound bytes are unframed; everything that arrives is echoed back in
//! standard response packets. Deliberately simple: it exists to exercise
//! the framing, chunking, and flush paths at wire level.

use bytes::{Buf, BytesMut};

use crate::net::connection::Connection;
use crate::net::protocol::{HandlerStatus, PacketHandler};

/// Packet type tag on echoed responses.
pub const ECHO_RESPONSE: u8 = 0x41;

pub struct EchoHandler {
    /// Bytes taken from the read buffer but not yet accepted by the write
    /// side; survives write backpressure across invocations.
    pending: BytesMut,
}

impl EchoHandler {
    pub fn new() -> Self {
        Self {
            pending: BytesMut::new(),
        }
    }
}

impl PacketHandler for EchoHandler {
    fn process(&mut self, conn: &mut Connection) -> HandlerStatus {
        if self.pending.is_empty() {
            if conn.available() == 0 && !conn.refill_read_buffer() {
                return if conn.is_disconnected() {
                    HandlerStatus::Error
                } else {
                    HandlerStatus::NeedRead
                };
            }
            self.pending.extend_from_slice(conn.peek_input());
            let taken = self.pending.len();
            conn.consume_input(taken);
        }

        match conn.buffer_write_bytes(&self.pending, ECHO_RESPONSE) {
            Ok(accepted) => {
                self.pending.advance(accepted);
                HandlerStatus::NeedWrite
            }
            Err(_) => HandlerStatus::Error,
        }
    }
}
