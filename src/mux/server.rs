//! Non-blocking TCP multiplexer.
//!
//! [`MuxServer`] owns the listening socket and the registry of accepted
//! connections, and surfaces all socket activity as a flat sequence of
//! [`MuxEvent`]s produced one bounded quantum at a time. Readiness comes
//! from `mio` (epoll/kqueue); all sockets are non-blocking and everything
//! runs on the caller's thread.
//!
//! The event protocol per [`poll`](MuxServer::poll) call:
//!
//! 1. `Poll` for every connection that existed at quantum start,
//! 2. `Accept` for each newly accepted connection,
//! 3. `Recv` for each connection whose inbound buffer grew this quantum,
//! 4. `Close` for each connection that reached a close condition.
//!
//! A `Close` is produced exactly once per connection. The connection stays
//! resident (its buffers remain readable) until the caller acknowledges the
//! close with [`remove_connection`](MuxServer::remove_connection), which
//! releases the socket.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use super::connection::{ConnId, Connection};

/// Token reserved for the listening socket; connection tokens start at 1.
const LISTENER: Token = Token(0);

/// One unit of socket activity reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxEvent {
    /// A new connection was accepted.
    Accept(ConnId),
    /// The connection's inbound buffer grew this quantum.
    Recv(ConnId),
    /// Periodic per-connection tick; no new bytes implied.
    Poll(ConnId),
    /// The connection reached a close condition. Emitted once; the
    /// connection stays resident until `remove_connection`.
    Close(ConnId),
}

/// Listener plus connection registry, polled in bounded quanta.
#[derive(Debug)]
pub struct MuxServer {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    conns: HashMap<ConnId, Connection>,
    next_id: u64,
}

impl MuxServer {
    /// Create an unbound multiplexer.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            listener: None,
            local_addr: None,
            conns: HashMap::new(),
            next_id: 1,
        })
    }

    /// Bind and start listening on `spec`: either a bare port (`"8080"`,
    /// all interfaces) or a full `host:port` address.
    pub fn bind(&mut self, spec: &str) -> io::Result<()> {
        if self.listener.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "server is already bound",
            ));
        }
        let addr = parse_spec(spec)?;
        let mut listener = TcpListener::bind(addr)?;
        self.poll
            .registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        self.local_addr = listener.local_addr().ok();
        log::debug!("listening on {:?}", self.local_addr);
        self.listener = Some(listener);
        Ok(())
    }

    /// Address actually bound (useful with port 0).
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// True while the listening socket is valid.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    /// Number of resident connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Look up a resident connection.
    #[must_use]
    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.conns.get(&id)
    }

    /// Look up a resident connection for mutation.
    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    /// Drive the multiplexer for one quantum of at most `timeout`,
    /// returning the activity observed. A fatal polling error invalidates
    /// the listener, which callers observe via [`is_listening`](Self::is_listening).
    pub fn poll(&mut self, timeout: Duration) -> Vec<MuxEvent> {
        let mut out = Vec::new();

        // Tick targets are fixed before any I/O: connections accepted
        // during this quantum get their first tick next quantum.
        let mut tick_ids: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, c)| !c.close_emitted)
            .map(|(id, _)| *id)
            .collect();
        tick_ids.sort_unstable();

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                // Signal during the wait; the caller checks its flag
                // between quanta.
                self.events.clear();
            }
            Err(e) => {
                log::error!("socket poll failed: {e}");
                self.drop_listener();
                return out;
            }
        }

        let ready: Vec<(Token, bool)> = self
            .events
            .iter()
            .map(|ev| (ev.token(), ev.is_readable()))
            .collect();

        let mut accepted = Vec::new();
        let mut received = Vec::new();
        for (token, readable) in ready {
            if token == LISTENER {
                self.accept_ready(&mut accepted);
            } else if readable {
                let id = ConnId::new(token.0 as u64);
                if self.read_ready(id) && !received.contains(&id) {
                    received.push(id);
                }
            }
        }

        // Outbound data is flushed once per quantum regardless of
        // readiness; a full socket buffer just retries next quantum.
        let flush_ids: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, c)| c.outbound_len() > 0 && !c.closing)
            .map(|(id, _)| *id)
            .collect();
        for id in flush_ids {
            self.flush(id);
        }

        for id in tick_ids {
            if self.conns.contains_key(&id) {
                out.push(MuxEvent::Poll(id));
            }
        }
        for id in accepted {
            out.push(MuxEvent::Accept(id));
        }
        for id in received {
            if self.conns.contains_key(&id) {
                out.push(MuxEvent::Recv(id));
            }
        }
        let closeable: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, c)| c.close_pending() && !c.close_emitted)
            .map(|(id, _)| *id)
            .collect();
        for id in closeable {
            if let Some(conn) = self.conns.get_mut(&id) {
                conn.close_emitted = true;
            }
            out.push(MuxEvent::Close(id));
        }

        out
    }

    /// Release a connection's socket and forget it. Safe to call with an
    /// id that is no longer (or never was) resident.
    pub fn remove_connection(&mut self, id: ConnId) {
        if let Some(mut conn) = self.conns.remove(&id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            log::debug!("connection {id} released");
        }
    }

    /// Drop the listening socket; resident connections are unaffected.
    pub fn drop_listener(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
    }

    fn accept_ready(&mut self, accepted: &mut Vec<ConnId>) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            match listener.accept() {
                Ok((mut stream, addr)) => {
                    let id = ConnId::new(self.next_id);
                    self.next_id += 1;
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        id.token(),
                        Interest::READABLE,
                    ) {
                        log::warn!("failed to register connection from {addr}: {e}");
                        continue;
                    }
                    log::debug!("accepted {addr} as connection {id}");
                    self.conns.insert(id, Connection::new(id, stream));
                    accepted.push(id);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    return;
                }
            }
        }
    }

    /// Drain a readable socket into the inbound buffer. Returns true when
    /// new bytes arrived.
    fn read_ready(&mut self, id: ConnId) -> bool {
        match self.conns.get_mut(&id) {
            Some(conn) if !conn.close_emitted => conn.read_inbound(),
            _ => false,
        }
    }

    fn flush(&mut self, id: ConnId) {
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.flush_outbound();
        }
    }
}

/// Parse an address spec: a bare port listens on all interfaces, anything
/// with a colon must be a full socket address.
fn parse_spec(spec: &str) -> io::Result<SocketAddr> {
    if spec.contains(':') {
        spec.parse().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid listen address '{spec}': {e}"),
            )
        })
    } else {
        let port: u16 = spec.parse().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid listen port '{spec}': {e}"),
            )
        })?;
        Ok(SocketAddr::from(([0, 0, 0, 0], port)))
    }
}
