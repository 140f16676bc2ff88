//! Connection state machine and the table that owns every live connection.
//!
//! A connection reads everything available into its read buffer, moves it to
//! the tail of its write buffer (the echo step), and writes it back in chunks
//! no larger than the configured write cap. Write interest is held exactly
//! while the write buffer has pending bytes.

use crate::runtime::buffer::BoundedBuffer;
use crate::runtime::error::{ConnectionFatal, RegistrationError};
use crate::runtime::registry::{InterestSet, Registry};
use crate::runtime::socket::{self, Handle, ReadOutcome, WriteOutcome};
use mio::net::TcpStream;
use std::collections::hash_map::{Entry, HashMap};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use tracing::{debug, trace, warn};

/// Action the registry must take to bring a connection's interest in line
/// with its write buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestChange {
    /// Interest already matches.
    Keep,
    /// Output still pending and write interest already held; re-arm it.
    Rearm,
    /// Move to the contained interest.
    Set(InterestSet),
}

/// Decide the interest change after a write attempt.
pub fn next_interest(current: InterestSet, write_pending: bool) -> InterestChange {
    match (write_pending, current.is_writable()) {
        (true, false) => InterestChange::Set(current.with_write()),
        (false, true) => InterestChange::Set(current.without_write()),
        (true, true) => InterestChange::Rearm,
        (false, false) => InterestChange::Keep,
    }
}

/// Buffering half of a connection, independent of the socket type.
#[derive(Debug)]
pub struct EchoState {
    read_buf: BoundedBuffer,
    write_buf: BoundedBuffer,
    // Read staging area, sized on first use and reused after that
    scratch: Vec<u8>,
}

impl EchoState {
    pub fn new(capacity: usize) -> Self {
        Self {
            read_buf: BoundedBuffer::new(capacity),
            write_buf: BoundedBuffer::new(capacity),
            scratch: Vec::new(),
        }
    }

    /// Handle read readiness: drain `src`, then echo.
    ///
    /// Peer close is fatal even when output is still pending; that output is
    /// discarded with the connection.
    pub fn on_readable<S: Read + Write>(
        &mut self,
        stream: &mut S,
        read_chunk: usize,
        write_chunk: usize,
    ) -> Result<(), ConnectionFatal> {
        self.scratch.resize(read_chunk, 0);
        match socket::read_into(stream, &mut self.read_buf, &mut self.scratch)? {
            ReadOutcome::Closed => return Err(ConnectionFatal::PeerClosed),
            ReadOutcome::Error(e) => return Err(ConnectionFatal::Io(e)),
            ReadOutcome::Data(n) => trace!(read = n, "Drained socket"),
            ReadOutcome::WouldBlock => {}
        }
        self.echo(stream, write_chunk)
    }

    /// Move buffered input to the output queue and attempt one write.
    pub fn echo<W: Write>(&mut self, stream: &mut W, write_chunk: usize) -> Result<(), ConnectionFatal> {
        if !self.read_buf.is_empty() {
            self.read_buf.drain_into(&mut self.write_buf)?;
        }
        self.flush(stream, write_chunk)
    }

    /// Attempt one bounded write of pending output.
    pub fn flush<W: Write>(&mut self, stream: &mut W, write_chunk: usize) -> Result<(), ConnectionFatal> {
        match socket::write_from(stream, &mut self.write_buf, write_chunk) {
            WriteOutcome::Written(_) | WriteOutcome::WouldBlock => Ok(()),
            WriteOutcome::Error(e) => Err(ConnectionFatal::Io(e)),
        }
    }

    #[cfg(test)]
    pub fn read_pending(&self) -> usize {
        self.read_buf.len()
    }

    pub fn write_pending(&self) -> usize {
        self.write_buf.len()
    }
}

/// A single accepted client.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    /// Interest currently registered for this connection.
    pub interest: InterestSet,
    pub state: EchoState,
}

impl Connection {
    /// Wrap an accepted stream. Nothing is registered yet.
    pub fn new(stream: TcpStream, capacity: usize) -> Self {
        Self {
            stream,
            interest: InterestSet::None,
            state: EchoState::new(capacity),
        }
    }

    pub fn handle(&self) -> Handle {
        self.stream.as_raw_fd()
    }

    /// First registration after accept.
    pub fn register(&mut self, registry: &mut Registry, interest: InterestSet) -> Result<(), RegistrationError> {
        registry.register(&mut self.stream, interest)?;
        self.interest = interest;
        Ok(())
    }

    pub fn on_readable(&mut self, read_chunk: usize, write_chunk: usize) -> Result<(), ConnectionFatal> {
        self.state
            .on_readable(&mut self.stream, read_chunk, write_chunk)
    }

    pub fn on_writable(&mut self, write_chunk: usize) -> Result<(), ConnectionFatal> {
        self.state.flush(&mut self.stream, write_chunk)
    }

    #[cfg(test)]
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Bring registered interest in line with the write buffer.
    pub fn sync_interest(&mut self, registry: &mut Registry) -> Result<(), RegistrationError> {
        let handle = self.handle();
        match next_interest(self.interest, self.state.write_pending() > 0) {
            InterestChange::Keep => Ok(()),
            InterestChange::Rearm => registry.rearm(&mut self.stream),
            InterestChange::Set(next) => {
                if self.interest.is_none() {
                    registry.register(&mut self.stream, next)?;
                } else {
                    // An empty target deregisters
                    registry.modify(&mut self.stream, next)?;
                }
                debug!(handle, from = ?self.interest, to = ?next, "Interest changed");
                self.interest = next;
                Ok(())
            }
        }
    }
}

/// Live connections keyed by socket handle.
pub struct ConnectionTable {
    connections: HashMap<Handle, Connection>,
    buffer_capacity: usize,
}

impl ConnectionTable {
    /// Create an empty table whose connections get `buffer_capacity`-byte buffers.
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            connections: HashMap::new(),
            buffer_capacity,
        }
    }

    /// Track a newly accepted stream.
    ///
    /// Fails if the handle is already tracked, handing the new stream back
    /// and leaving the existing entry alone.
    pub fn add(&mut self, stream: TcpStream) -> Result<&mut Connection, TcpStream> {
        let handle = stream.as_raw_fd();
        let capacity = self.buffer_capacity;
        match self.connections.entry(handle) {
            Entry::Occupied(_) => {
                warn!(handle, "Connection already tracked, add failed");
                Err(stream)
            }
            Entry::Vacant(slot) => {
                debug!(handle, "Added connection");
                Ok(slot.insert(Connection::new(stream, capacity)))
            }
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&Connection> {
        self.connections.get(&handle)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Connection> {
        self.connections.get_mut(&handle)
    }

    /// Tear a connection down: deregister, close, and forget it.
    ///
    /// Returns `false` if nothing was tracked under `handle`.
    pub fn remove(&mut self, handle: Handle, registry: &mut Registry) -> bool {
        let Some(mut conn) = self.connections.remove(&handle) else {
            warn!(handle, "Remove of untracked connection");
            return false;
        };
        if !conn.interest.is_none() {
            registry.deregister(&mut conn.stream);
        }
        drop(conn);
        debug!(handle, "Removed connection");
        true
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &Connection)> {
        self.connections.iter().map(|(h, c)| (*h, c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::socket::tests::{ScriptedReader, ThrottledWriter};
    use std::io;
    use std::net::TcpListener;
    use std::os::fd::{FromRawFd, IntoRawFd};

    /// Scripted peer: reads come from the script, writes land in the writer.
    struct Peer {
        input: ScriptedReader,
        output: ThrottledWriter,
    }

    impl Peer {
        fn new(script: Vec<io::Result<Vec<u8>>>, per_call: usize) -> Self {
            Self {
                input: ScriptedReader::new(script),
                output: ThrottledWriter::new(per_call),
            }
        }
    }

    impl Read for Peer {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Peer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn accepted_stream() -> (std::net::TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, TcpStream::from_std(server))
    }

    #[test]
    fn test_next_interest() {
        assert_eq!(
            next_interest(InterestSet::Read, true),
            InterestChange::Set(InterestSet::ReadWrite)
        );
        assert_eq!(
            next_interest(InterestSet::ReadWrite, false),
            InterestChange::Set(InterestSet::Read)
        );
        assert_eq!(
            next_interest(InterestSet::None, true),
            InterestChange::Set(InterestSet::Write)
        );
        assert_eq!(
            next_interest(InterestSet::Write, false),
            InterestChange::Set(InterestSet::None)
        );
        assert_eq!(next_interest(InterestSet::ReadWrite, true), InterestChange::Rearm);
        assert_eq!(next_interest(InterestSet::Read, false), InterestChange::Keep);
    }

    #[test]
    fn test_readable_echoes_one_chunk() {
        let mut peer = Peer::new(vec![Ok(b"hello world".to_vec())], usize::MAX);
        let mut state = EchoState::new(64);

        state.on_readable(&mut peer, 1024, 8).unwrap();

        assert_eq!(peer.output.sink, b"hello wo");
        assert_eq!(state.read_pending(), 0);
        assert_eq!(state.write_pending(), 3);

        state.flush(&mut peer, 8).unwrap();
        assert_eq!(peer.output.sink, b"hello world");
        assert_eq!(state.write_pending(), 0);
    }

    #[test]
    fn test_readable_without_data_still_flushes() {
        let mut peer = Peer::new(vec![Ok(b"0123456789".to_vec())], usize::MAX);
        let mut state = EchoState::new(64);
        state.on_readable(&mut peer, 1024, 4).unwrap();
        assert_eq!(state.write_pending(), 6);

        // Readiness with nothing to read piggybacks a write
        state.on_readable(&mut peer, 1024, 4).unwrap();
        assert_eq!(peer.output.sink, b"01234567");
        assert_eq!(state.write_pending(), 2);
    }

    #[test]
    fn test_peer_close_discards_pending_output() {
        let mut peer = Peer::new(vec![Ok(b"unflushed".to_vec()), Ok(Vec::new())], usize::MAX);
        let mut state = EchoState::new(64);

        let err = state.on_readable(&mut peer, 1024, 8).unwrap_err();
        assert!(matches!(err, ConnectionFatal::PeerClosed));
        // Teardown happens before the echo step
        assert!(peer.output.sink.is_empty());
        assert_eq!(peer.output.calls, 0);
    }

    #[test]
    fn test_read_error_is_fatal() {
        let mut peer = Peer::new(vec![Err(io::ErrorKind::ConnectionReset.into())], 8);
        let mut state = EchoState::new(64);
        assert!(matches!(
            state.on_readable(&mut peer, 1024, 8),
            Err(ConnectionFatal::Io(_))
        ));
    }

    #[test]
    fn test_write_error_is_fatal() {
        let mut state = EchoState::new(64);
        let mut peer = Peer::new(vec![Ok(b"data".to_vec())], 8);
        peer.output.blocked = true;
        state.on_readable(&mut peer, 1024, 8).unwrap();
        assert_eq!(state.write_pending(), 4);

        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        assert!(matches!(
            state.flush(&mut Broken, 8),
            Err(ConnectionFatal::Io(_))
        ));
    }

    #[test]
    fn test_overflow_before_flush() {
        // Writer is blocked, so nothing leaves the write buffer
        let mut peer = Peer::new(vec![Ok(vec![1u8; 40])], 8);
        peer.output.blocked = true;
        let mut state = EchoState::new(64);
        state.on_readable(&mut peer, 1024, 8).unwrap();
        assert_eq!(state.write_pending(), 40);

        // Another 40 bytes read fine but cannot join the write queue
        peer.input = ScriptedReader::new(vec![Ok(vec![2u8; 40])]);
        assert!(matches!(
            state.on_readable(&mut peer, 1024, 8),
            Err(ConnectionFatal::Overflow(_))
        ));

        // And more than capacity in one drain overflows the read side
        let mut fresh = EchoState::new(64);
        let mut flood = Peer::new(vec![Ok(vec![3u8; 100])], 8);
        assert!(matches!(
            fresh.on_readable(&mut flood, 1024, 8),
            Err(ConnectionFatal::Overflow(_))
        ));
    }

    #[test]
    fn test_scratch_reused_across_reads() {
        let mut peer = Peer::new(vec![Ok(b"first".to_vec())], usize::MAX);
        let mut state = EchoState::new(64);
        state.on_readable(&mut peer, 16, 8).unwrap();
        let staging = state.scratch.as_ptr();

        peer.input = ScriptedReader::new(vec![Ok(b"second".to_vec())]);
        state.on_readable(&mut peer, 16, 8).unwrap();

        assert_eq!(state.scratch.as_ptr(), staging);
        assert_eq!(state.scratch.len(), 16);
        assert_eq!(peer.output.sink, b"firstsecond");
    }

    #[test]
    fn test_single_byte_writes_preserve_order() {
        let payload: Vec<u8> = (0..50u8).collect();
        let mut peer = Peer::new(vec![Ok(payload.clone())], 1);
        let mut state = EchoState::new(64);

        state.on_readable(&mut peer, 7, 8).unwrap();
        let mut attempts = 1;
        while state.write_pending() > 0 {
            state.flush(&mut peer, 8).unwrap();
            attempts += 1;
        }

        assert_eq!(attempts, payload.len());
        assert_eq!(peer.output.sink, payload);
    }

    #[test]
    fn test_connection_table() {
        let (_c1, s1) = accepted_stream();
        let (_c2, s2) = accepted_stream();
        let h1 = s1.as_raw_fd();
        let h2 = s2.as_raw_fd();
        let mut registry = Registry::new(16).unwrap();
        let mut table = ConnectionTable::new(128);

        let conn = table.add(s1).unwrap();
        assert_eq!(conn.handle(), h1);
        assert_eq!(conn.interest, InterestSet::None);
        conn.sync_interest(&mut registry).unwrap();
        // Nothing pending, no interest wanted
        assert_eq!(conn.interest, InterestSet::None);

        table.add(s2).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.iter().count(), 2);

        // Out-of-range and untracked handles are simply absent
        assert!(table.get(-1).is_none());
        assert!(table.get(i32::MAX).is_none());

        assert!(table.remove(h2, &mut registry));
        assert!(table.get(h2).is_none());
        assert!(!table.remove(h2, &mut registry));
        assert_eq!(table.len(), 1);
        assert!(table.get_mut(h1).is_some());
    }

    #[test]
    fn test_duplicate_add_fails() {
        let (_client, stream) = accepted_stream();
        let handle = stream.as_raw_fd();
        let mut table = ConnectionTable::new(128);
        table.add(stream).unwrap();

        // A second stream claiming the same descriptor
        let alias = unsafe { TcpStream::from_raw_fd(handle) };
        let rejected = table.add(alias).unwrap_err();
        assert_eq!(rejected.as_raw_fd(), handle);
        // The table still owns the descriptor
        let _ = rejected.into_raw_fd();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_deregisters() {
        let (_client, stream) = accepted_stream();
        let handle = stream.as_raw_fd();
        let mut registry = Registry::new(16).unwrap();
        let mut table = ConnectionTable::new(128);

        let conn = table.add(stream).unwrap();
        conn.register(&mut registry, InterestSet::Read).unwrap();
        assert_eq!(registry.interest(handle), InterestSet::Read);

        assert!(table.remove(handle, &mut registry));
        assert_eq!(registry.interest(handle), InterestSet::None);
    }
}
