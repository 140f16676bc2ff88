//! Readiness-driven echo event loop.
//!
//! One thread owns the listener, the registry, and every connection. Each
//! turn waits for readiness, drains the accept backlog when the listener is
//! ready, and otherwise drives the ready connection's state machine:
//!
//! - readable: drain the socket, move input to the output queue, write once
//! - writable: write once
//! - afterwards: hold write interest iff output is pending
//!
//! Per-connection failures tear down that connection only. A registry
//! contract violation means connection state and the poller disagree, and
//! ends the loop.

use crate::runtime::connection::{Connection, ConnectionTable};
use crate::runtime::error::{AcceptError, ConnectionFatal, RuntimeError, StartupError};
use crate::runtime::registry::{InterestSet, Readiness, Registry};
use crate::runtime::socket::{self, Handle};
use crate::runtime::Tuning;
use mio::net::{TcpListener, TcpStream};
use socket2::SockAddr;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Server context: everything the event loop touches.
pub struct Server {
    listener: TcpListener,
    listen_handle: Handle,
    local_addr: SocketAddr,
    registry: Registry,
    connections: ConnectionTable,
    tuning: Tuning,
}

impl Server {
    /// Bind, listen, and register the listener for accept readiness.
    ///
    /// An absent or empty `bind` address listens on every IPv4 interface.
    pub fn init(bind: Option<&str>, port: u16, tuning: Tuning) -> Result<Self, StartupError> {
        let addr = socket::resolve_addr(bind, port)?;
        let mut listener = socket::bind_and_listen(addr, tuning.backlog)?;
        let listen_handle = listener.as_raw_fd();
        let local_addr = listener.local_addr().map_err(StartupError::Configure)?;

        let mut registry = Registry::new(tuning.max_events).map_err(StartupError::Poll)?;
        registry
            .register(&mut listener, InterestSet::Read)
            .map_err(StartupError::Registration)?;

        info!(
            addr = %local_addr,
            handle = listen_handle,
            buffer_capacity = tuning.buffer_capacity,
            write_chunk = tuning.write_chunk,
            "Server listening"
        );

        Ok(Self {
            listener,
            listen_handle,
            local_addr,
            registry,
            connections: ConnectionTable::new(tuning.buffer_capacity),
            tuning,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Drive the event loop forever.
    pub fn run(&mut self) -> Result<Infallible, RuntimeError> {
        let timeout = self.tuning.poll_timeout;
        loop {
            self.turn(Some(timeout))?;
        }
    }

    /// Wait once for readiness and dispatch every notification.
    ///
    /// Returns the number of notifications handled.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<usize, RuntimeError> {
        let ready = self.registry.wait(timeout).map_err(RuntimeError::Poll)?;

        for &(handle, readiness) in &ready {
            if handle == self.listen_handle {
                self.accept_connections();
            } else {
                self.dispatch(handle, readiness)?;
            }
        }

        Ok(ready.len())
    }

    /// Accept until the backlog is empty.
    fn accept_connections(&mut self) {
        self.accept_with(socket::accept_one);
    }

    fn accept_with<F>(&mut self, mut accept: F)
    where
        F: FnMut(&TcpListener) -> Result<Option<(TcpStream, SockAddr)>, AcceptError>,
    {
        loop {
            match accept(&self.listener) {
                Ok(Some((stream, peer))) => self.admit(stream, peer),
                Ok(None) => break,
                Err(e @ AcceptError::Configure { .. }) => {
                    error!(error = %e, "Dropping accepted connection");
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // The backlog may still hold connections and no new edge
                    // will report them, so ask to hear about the listener again
                    if let Err(e) = self.registry.rearm(&mut self.listener) {
                        error!(error = %e, "Failed to re-arm listener");
                    }
                    break;
                }
            }
        }
    }

    /// Track and register a freshly accepted stream for read readiness.
    fn admit(&mut self, stream: TcpStream, peer: SockAddr) {
        let handle = stream.as_raw_fd();
        match peer.as_socket() {
            Some(peer) => debug!(handle, peer = %peer, "Accepted connection"),
            None => debug!(handle, "Accepted connection"),
        }

        let conn = match self.connections.add(stream) {
            Ok(conn) => conn,
            Err(_rejected) => return,
        };

        if let Err(e) = conn.register(&mut self.registry, InterestSet::Read) {
            error!(handle, error = %e, "Failed to register connection");
            self.connections.remove(handle, &mut self.registry);
        }
    }

    /// Drive one connection through a readiness notification.
    fn dispatch(&mut self, handle: Handle, readiness: Readiness) -> Result<(), RuntimeError> {
        if !readiness.is_actionable() {
            error!(handle, ?readiness, "Invalid event");
            self.teardown(handle, ConnectionFatal::UnexpectedReadiness(readiness));
            return Ok(());
        }

        if readiness.error || readiness.hangup {
            debug!(handle, ?readiness, "Error or hangup reported");
        }

        let Some(conn) = self.connections.get_mut(handle) else {
            debug!(handle, "Event for untracked handle");
            return Ok(());
        };

        match drive(conn, readiness, &self.tuning, &mut self.registry) {
            Ok(()) => Ok(()),
            Err(ConnectionFatal::Registration(e)) if e.is_invariant_breach() => {
                error!(handle, error = %e, "Readiness registry out of sync");
                self.connections.remove(handle, &mut self.registry);
                Err(RuntimeError::Invariant(e))
            }
            Err(fatal) => {
                self.teardown(handle, fatal);
                Ok(())
            }
        }
    }

    fn teardown(&mut self, handle: Handle, reason: ConnectionFatal) {
        let discarded = self
            .connections
            .get(handle)
            .map_or(0, |conn| conn.state.write_pending());
        match reason {
            ConnectionFatal::PeerClosed => debug!(handle, discarded, "Client closed"),
            ref other => warn!(handle, discarded, error = %other, "Dropping connection"),
        }
        if self.connections.remove(handle, &mut self.registry) {
            debug!(handle, active = self.connection_count(), "Connection closed");
        }
    }
}

/// Perform the I/O a notification allows, then resync interest.
fn drive(
    conn: &mut Connection,
    readiness: Readiness,
    tuning: &Tuning,
    registry: &mut Registry,
) -> Result<(), ConnectionFatal> {
    if readiness.readable {
        conn.on_readable(tuning.read_chunk, tuning.write_chunk)?;
    }
    if readiness.writable {
        conn.on_writable(tuning.write_chunk)?;
    }
    conn.sync_interest(registry)
        .map_err(ConnectionFatal::Registration)
}
