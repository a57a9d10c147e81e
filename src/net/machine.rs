//! Connection state-machine driver.
//!
//! Runs a ready connection until every path is blocked on a specific
//! readiness condition, then re-arms the reactor for exactly that
//! condition. Level-triggered in effect: the loop only yields when the
//! socket pushes back or the session ends.

use mio::Interest;

use crate::net::connection::Connection;
use crate::net::protocol::HandlerStatus;

/// What became of a connection after a drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Still live; the reactor mask reflects what it waits for.
    Open,
    /// Closed and deregistered; the owner should forget the token.
    Closed,
}

/// Advance `conn` until it blocks, finishes, or dies.
pub fn drive(conn: &mut Connection) -> Transition {
    loop {
        if conn.is_disconnected() {
            conn.close_socket();
            return Transition::Closed;
        }

        // Finish any write the socket pushed back on before asking the
        // handler for more.
        if conn.has_pending_write() {
            match conn.flush_write_buffer() {
                Ok(true) => {}
                Ok(false) => return rearm(conn, Interest::READABLE | Interest::WRITABLE),
                Err(_) => return close(conn),
            }
        }

        match conn.process() {
            HandlerStatus::Continue => {}
            HandlerStatus::NeedRead => {
                return match try_flush(conn) {
                    Flush::Clean => rearm(conn, Interest::READABLE),
                    Flush::Blocked => rearm(conn, Interest::READABLE | Interest::WRITABLE),
                    Flush::Failed => close(conn),
                };
            }
            HandlerStatus::NeedWrite => match try_flush(conn) {
                // Response is out; loop to see what the handler wants next.
                Flush::Clean => {}
                Flush::Blocked => return rearm(conn, Interest::WRITABLE),
                Flush::Failed => return close(conn),
            },
            HandlerStatus::Done => {
                let _ = conn.flush_write_buffer();
                return close(conn);
            }
            HandlerStatus::Error => return close(conn),
        }
    }
}

enum Flush {
    Clean,
    Blocked,
    Failed,
}

fn try_flush(conn: &mut Connection) -> Flush {
    if !conn.has_pending_write() {
        return Flush::Clean;
    }
    match conn.flush_write_buffer() {
        Ok(true) => Flush::Clean,
        Ok(false) => Flush::Blocked,
        Err(_) => Flush::Failed,
    }
}

fn close(conn: &mut Connection) -> Transition {
    conn.close_socket();
    Transition::Closed
}

fn rearm(conn: &mut Connection, interest: Interest) -> Transition {
    if conn.rearm(interest).is_err() {
        return close(conn);
    }
    Transition::Open
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::Connection;
    use crate::protocols::ProtocolKind;
    use mio::net::TcpStream;
    use mio::Poll;
    use std::io::{Read, Write};
    use std::net::{TcpListener as StdListener, TcpStream as StdStream};
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    fn echo_connection(poll: &Poll) -> (StdStream, Connection) {
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
            ProtocolKind::Echo,
        )
        .unwrap();
        (peer, conn)
    }

    #[test]
    fn test_drive_echoes_and_rearms_for_read() {
        let poll = Poll::new().unwrap();
        let (mut peer, mut conn) = echo_connection(&poll);

        peer.write_all(b"hi").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(drive(&mut conn), Transition::Open);
        assert_eq!(conn.interest(), Some(Interest::READABLE));

        let mut wire = [0u8; 7];
        peer.read_exact(&mut wire).unwrap();
        assert_eq!(&wire, &[0x41, 0x00, 0x00, 0x00, 0x06, b'h', b'i']);
    }

    #[test]
    fn test_drive_closes_on_peer_eof() {
        let poll = Poll::new().unwrap();
        let (peer, mut conn) = echo_connection(&poll);
        drop(peer);
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(drive(&mut conn), Transition::Closed);
        assert!(conn.is_disconnected());
    }
}
