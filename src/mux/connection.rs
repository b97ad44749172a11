//! Per-connection native state.
//!
//! A [`Connection`] owns the socket and its two byte buffers. It carries no
//! script-side state at all; the scripting layer refers to it only through
//! its [`ConnId`], which is unique for the lifetime of the process.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::net::TcpStream;
use mio::Token;

use super::buffer::Buffer;

/// Chunk size for draining a readable socket.
const READ_CHUNK: usize = 4096;

/// Process-unique identifier of one native connection.
///
/// Ids are allocated from a monotonically increasing counter and never
/// reused, so the decimal rendering of an id is a stable, unique key for the
/// connection's whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw id value.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Reconstruct an id from its raw value, e.g. one round-tripped through
    /// a script. The result may or may not name a live connection.
    #[must_use]
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) fn token(self) -> Token {
        Token(self.0 as usize)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One accepted TCP connection: socket, buffers, and close state.
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    pub(crate) stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    recv: Buffer,
    send: Buffer,
    /// Close once the outbound buffer has drained.
    finished_sending: bool,
    /// Close on the next quantum without flushing.
    close_immediately: bool,
    /// Peer closed or the socket errored.
    pub(crate) closing: bool,
    /// A Close event for this connection was already produced.
    pub(crate) close_emitted: bool,
}

impl Connection {
    pub(crate) fn new(id: ConnId, stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self {
            id,
            stream,
            peer_addr,
            recv: Buffer::new(),
            send: Buffer::new(),
            finished_sending: false,
            close_immediately: false,
            closing: false,
            close_emitted: false,
        }
    }

    /// This connection's process-unique id.
    #[must_use]
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Peer address, when known.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Currently buffered inbound bytes, oldest first.
    #[must_use]
    pub fn inbound(&self) -> &[u8] {
        self.recv.as_slice()
    }

    /// Number of buffered inbound bytes.
    #[must_use]
    pub fn inbound_len(&self) -> usize {
        self.recv.len()
    }

    /// Number of not-yet-flushed outbound bytes.
    #[must_use]
    pub fn outbound_len(&self) -> usize {
        self.send.len()
    }

    /// Queue bytes for flushing by the multiplexer.
    pub fn enqueue_outbound(&mut self, bytes: &[u8]) {
        self.send.append(bytes);
    }

    /// Remove the first `n` inbound bytes. `n` must address buffered data
    /// exactly: `n == 0` or `n > inbound_len()` leaves the buffer unchanged
    /// and returns false.
    pub fn discard_inbound(&mut self, n: usize) -> bool {
        if n == 0 || n > self.recv.len() {
            return false;
        }
        self.recv.remove_front(n);
        true
    }

    /// Mark the connection to close once the outbound buffer drains.
    pub fn mark_finished_sending(&mut self) {
        self.finished_sending = true;
    }

    /// Mark the connection to close on the next quantum, unflushed.
    pub fn mark_close_immediately(&mut self) {
        self.close_immediately = true;
    }

    /// True once any close condition holds.
    #[must_use]
    pub fn close_pending(&self) -> bool {
        self.closing
            || self.close_immediately
            || (self.finished_sending && self.send.is_empty())
    }

    /// True when a truthy handler return has marked this connection done.
    #[must_use]
    pub fn is_finished_sending(&self) -> bool {
        self.finished_sending
    }

    /// Drain the socket into the inbound buffer. Returns true when new
    /// bytes arrived; EOF and socket errors flip `closing`.
    pub(crate) fn read_inbound(&mut self) -> bool {
        if self.closing {
            return false;
        }
        let mut grew = false;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.closing = true;
                    break;
                }
                Ok(n) => {
                    self.recv.append(&chunk[..n]);
                    grew = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::debug!("connection {} read error: {e}", self.id);
                    self.closing = true;
                    break;
                }
            }
        }
        grew
    }

    /// Write buffered outbound bytes until the buffer drains or the socket
    /// stops accepting; socket errors flip `closing`.
    pub(crate) fn flush_outbound(&mut self) {
        while !self.send.is_empty() {
            match self.stream.write(self.send.as_slice()) {
                Ok(0) => {
                    self.closing = true;
                    return;
                }
                Ok(n) => {
                    self.send.remove_front(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::debug!("connection {} write error: {e}", self.id);
                    self.closing = true;
                    return;
                }
            }
        }
        let _ = self.stream.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a real loopback connection pair; the mio end becomes the
    /// `Connection`, the std end plays the remote peer.
    fn connected_pair() -> (Connection, std::net::TcpStream) {
        let listener =
            std::net::TcpListener::bind("127.0.0.1:0").expect("Should bind loopback listener");
        let addr = listener.local_addr().expect("Should read local addr");
        let peer = std::net::TcpStream::connect(addr).expect("Should connect");
        let (accepted, _) = listener.accept().expect("Should accept");
        accepted
            .set_nonblocking(true)
            .expect("Should set non-blocking");
        let conn = Connection::new(ConnId::new(7), TcpStream::from_std(accepted));
        (conn, peer)
    }

    /// Feed bytes to the connection through the peer socket.
    fn seed_inbound(conn: &mut Connection, peer: &mut std::net::TcpStream, bytes: &[u8]) {
        peer.write_all(bytes).expect("Should write");
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while conn.inbound_len() < bytes.len() {
            conn.read_inbound();
            assert!(std::time::Instant::now() < deadline, "seed timed out");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    #[test]
    fn test_conn_id_display_is_decimal() {
        assert_eq!(ConnId::new(42).to_string(), "42");
    }

    #[test]
    fn test_discard_inbound_bounds() {
        let (mut conn, mut peer) = connected_pair();
        seed_inbound(&mut conn, &mut peer, b"abc");

        // Out-of-range requests leave the buffer untouched.
        assert!(!conn.discard_inbound(0));
        assert!(!conn.discard_inbound(4));
        assert_eq!(conn.inbound(), b"abc");

        // A valid request removes exactly the front n bytes.
        assert!(conn.discard_inbound(2));
        assert_eq!(conn.inbound(), b"c");
        assert!(conn.discard_inbound(1));
        assert!(!conn.discard_inbound(1));
        assert_eq!(conn.inbound_len(), 0);
    }

    #[test]
    fn test_close_pending_conditions() {
        let (mut conn, _peer) = connected_pair();
        assert!(!conn.close_pending());

        // Finished-sending only closes once outbound is drained.
        conn.enqueue_outbound(b"bye");
        conn.mark_finished_sending();
        assert!(!conn.close_pending());
        conn.flush_outbound();
        assert!(conn.close_pending());
    }

    #[test]
    fn test_close_immediately_ignores_pending_output() {
        let (mut conn, _peer) = connected_pair();
        conn.enqueue_outbound(b"never flushed");
        conn.mark_close_immediately();
        assert!(conn.close_pending());
    }

    #[test]
    fn test_read_inbound_accumulates() {
        let (mut conn, mut peer) = connected_pair();
        peer.write_all(b"ping").expect("Should write");

        // Nonblocking read may need a moment for loopback delivery.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while conn.inbound_len() < 4 {
            conn.read_inbound();
            assert!(std::time::Instant::now() < deadline, "read timed out");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(conn.inbound(), b"ping");
        assert!(!conn.closing);
    }

    #[test]
    fn test_read_inbound_detects_eof() {
        let (mut conn, peer) = connected_pair();
        drop(peer);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while !conn.closing {
            conn.read_inbound();
            assert!(std::time::Instant::now() < deadline, "eof not observed");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(conn.close_pending());
    }

    #[test]
    fn test_flush_outbound_reaches_peer() {
        let (mut conn, mut peer) = connected_pair();
        conn.enqueue_outbound(b"pong");
        conn.flush_outbound();
        assert_eq!(conn.outbound_len(), 0);

        peer.set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .expect("Should set timeout");
        let mut got = [0u8; 4];
        peer.read_exact(&mut got).expect("Should read flushed bytes");
        assert_eq!(&got, b"pong");
    }
}
