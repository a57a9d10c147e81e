//! Contract between the connection state machine and protocol handlers.

use crate::net::connection::Connection;

/// Size of a wire packet header: one type byte plus the length word.
pub const PACKET_HEADER_LEN: usize = 5;

/// Size of the big-endian length word. The value it carries covers the word
/// itself plus the payload.
pub const LENGTH_FIELD_LEN: usize = 4;

/// Outcome of one handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    /// More input is required before progress can be made.
    NeedRead,
    /// Output is queued and should reach the socket before the next call.
    NeedWrite,
    /// Progress was made; invoke the handler again immediately.
    Continue,
    /// The session is finished; flush and close.
    Done,
    /// The session is broken; close immediately.
    Error,
}

/// Per-connection protocol handler.
///
/// A handler is created lazily when the first event arrives for a session
/// and dropped on connection reset. It consumes whole packets from the
/// connection's read buffer and appends framed responses to the write
/// buffer; parse state that spans invocations (say, a header whose payload
/// has not arrived yet) lives in the handler itself.
pub trait PacketHandler: Send {
    fn process(&mut self, conn: &mut Connection) -> HandlerStatus;
}
