//! Ping session handler over framed packets.
//!
//! Requests use the standard `[type][len][payload]` framing. A `0x50` ping
//! is answered with a `0x51` pong carrying the request payload (`PONG` when
//! the request is empty); `0x58` ends the session. Anything else, and any
//! length the frame rules cannot satisfy, is connection-fatal.

use std::io;

use bytes::{Buf, BytesMut};

use crate::net::connection::Connection;
use crate::net::protocol::{
    HandlerStatus, PacketHandler, LENGTH_FIELD_LEN, PACKET_HEADER_LEN,
};

pub const PING_REQUEST: u8 = 0x50;
pub const PONG_RESPONSE: u8 = 0x51;
pub const QUIT_REQUEST: u8 = 0x58;

/// Requests larger than this are treated as framing errors.
const MAX_PING_PAYLOAD: usize = 4096;

/// Where parsing stopped when input ran dry.
#[derive(Clone, Copy)]
enum ParseState {
    Header,
    Payload { msg_type: u8, remaining: usize },
}

pub struct PingHandler {
    state: ParseState,
    /// Response bytes not yet accepted by the write side.
    response: BytesMut,
}

impl PingHandler {
    pub fn new() -> Self {
        Self {
            state: ParseState::Header,
            response: BytesMut::new(),
        }
    }

    fn queue_response(&mut self, conn: &mut Connection) -> HandlerStatus {
        match conn.buffer_write_bytes(&self.response, PONG_RESPONSE) {
            Ok(accepted) => {
                self.response.advance(accepted);
                HandlerStatus::NeedWrite
            }
            Err(_) => HandlerStatus::Error,
        }
    }
}

impl PacketHandler for PingHandler {
    fn process(&mut self, conn: &mut Connection) -> HandlerStatus {
        // Finish a response the socket pushed back on first.
        if !self.response.is_empty() {
            return self.queue_response(conn);
        }

        loop {
            match self.state {
                ParseState::Header => {
                    let mut header = [0u8; PACKET_HEADER_LEN];
                    match conn.read_bytes(&mut header) {
                        Ok(()) => {
                            let len =
                                u32::from_be_bytes(header[1..].try_into().unwrap()) as usize;
                            if len < LENGTH_FIELD_LEN || len - LENGTH_FIELD_LEN > MAX_PING_PAYLOAD
                            {
                                return HandlerStatus::Error;
                            }
                            self.state = ParseState::Payload {
                                msg_type: header[0],
                                remaining: len - LENGTH_FIELD_LEN,
                            };
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return HandlerStatus::NeedRead
                        }
                        Err(_) => return HandlerStatus::Error,
                    }
                }
                ParseState::Payload { msg_type, remaining } => {
                    let mut payload = vec![0u8; remaining];
                    match conn.read_bytes(&mut payload) {
                        Ok(()) => {
                            self.state = ParseState::Header;
                            match msg_type {
                                QUIT_REQUEST => return HandlerStatus::Done,
                                PING_REQUEST => {
                                    if payload.is_empty() {
                                        self.response.extend_from_slice(b"PONG");
                                    } else {
                                        self.response.extend_from_slice(&payload);
                                    }
                                    return self.queue_response(conn);
                                }
                                _ => return HandlerStatus::Error,
                            }
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return HandlerStatus::NeedRead
                        }
                        Err(_) => return HandlerStatus::Error,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::ProtocolKind;
    use mio::net::TcpStream;
    use mio::{Interest, Poll};
    use std::io::{Read, Write};
    use std::net::{TcpListener as StdListener, TcpStream as StdStream};
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    fn ping_pair(poll: &Poll) -> (StdStream, Connection) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let peer = StdStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let stream = TcpStream::from_std(accepted);
        let fd = stream.as_raw_fd();
        let mut conn = Connection::new(fd);
        conn.reset(
            stream,
            Interest::READABLE,
            0,
            poll.registry().try_clone().unwrap(),
            ProtocolKind::Ping,
        )
        .unwrap();
        (peer, conn)
    }

    fn frame(msg_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![msg_type];
        packet.extend_from_slice(&((LENGTH_FIELD_LEN + payload.len()) as u32).to_be_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    #[test]
    fn test_ping_echoes_payload() {
        let poll = Poll::new().unwrap();
        let (mut peer, mut conn) = ping_pair(&poll);
        let mut handler = PingHandler::new();

        peer.write_all(&frame(PING_REQUEST, b"hello")).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(handler.process(&mut conn), HandlerStatus::NeedWrite);
        assert!(conn.flush_write_buffer().unwrap());

        let mut wire = [0u8; 10];
        peer.read_exact(&mut wire).unwrap();
        assert_eq!(&wire[..5], &[PONG_RESPONSE, 0x00, 0x00, 0x00, 0x09]);
        assert_eq!(&wire[5..], b"hello");
    }

    #[test]
    fn test_empty_ping_answers_pong() {
        let poll = Poll::new().unwrap();
        let (mut peer, mut conn) = ping_pair(&poll);
        let mut handler = PingHandler::new();

        peer.write_all(&frame(PING_REQUEST, b"")).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(handler.process(&mut conn), HandlerStatus::NeedWrite);
        assert!(conn.flush_write_buffer().unwrap());

        let mut wire = [0u8; 9];
        peer.read_exact(&mut wire).unwrap();
        assert_eq!(&wire[5..], b"PONG");
    }

    #[test]
    fn test_header_then_pause_resumes() {
        let poll = Poll::new().unwrap();
        let (mut peer, mut conn) = ping_pair(&poll);
        let mut handler = PingHandler::new();

        let packet = frame(PING_REQUEST, b"later");
        peer.write_all(&packet[..PACKET_HEADER_LEN]).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        // Header consumed, payload pending: the handler must yield for read
        // and keep its place.
        assert_eq!(handler.process(&mut conn), HandlerStatus::NeedRead);

        peer.write_all(&packet[PACKET_HEADER_LEN..]).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(handler.process(&mut conn), HandlerStatus::NeedWrite);
        assert!(conn.flush_write_buffer().unwrap());

        let mut wire = [0u8; 10];
        peer.read_exact(&mut wire).unwrap();
        assert_eq!(&wire[5..], b"later");
    }

    #[test]
    fn test_quit_ends_session() {
        let poll = Poll::new().unwrap();
        let (mut peer, mut conn) = ping_pair(&poll);
        let mut handler = PingHandler::new();

        peer.write_all(&frame(QUIT_REQUEST, b"")).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(handler.process(&mut conn), HandlerStatus::Done);
    }

    #[test]
    fn test_bad_length_is_fatal() {
        let poll = Poll::new().unwrap();
        let (mut peer, mut conn) = ping_pair(&poll);
        let mut handler = PingHandler::new();

        // Length word smaller than the length field itself.
        let mut packet = vec![PING_REQUEST];
        packet.extend_from_slice(&2u32.to_be_bytes());
        peer.write_all(&packet).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(handler.process(&mut conn), HandlerStatus::Error);
    }
}
