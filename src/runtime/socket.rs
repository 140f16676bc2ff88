//! Socket adapter: listener setup, accept, and non-blocking read/write.
//!
//! Sockets are built and configured through socket2, then handed to mio as
//! `TcpListener`/`TcpStream` so they can be registered directly. Every
//! outcome is classified here so callers only see would-block as a distinct
//! result, never as an error.

use crate::runtime::buffer::{BoundedBuffer, BufferOverflow};
use crate::runtime::error::{AcceptError, StartupError};
use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use tracing::{debug, trace};

/// OS-level socket identifier.
pub type Handle = RawFd;

/// Result of draining a socket.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Peer sent FIN. Bytes read before the FIN were still appended.
    Closed,
    /// Nothing was available.
    WouldBlock,
    /// `n` bytes appended, then the socket would block.
    Data(usize),
    /// Hard I/O error.
    Error(io::Error),
}

/// Result of one bounded write attempt.
#[derive(Debug)]
pub enum WriteOutcome {
    WouldBlock,
    Written(usize),
    Error(io::Error),
}

/// Resolve the textual bind address. Absent or empty means the IPv4 wildcard.
///
/// An unparsable address is a bind failure.
pub fn resolve_addr(address: Option<&str>, port: u16) -> Result<SocketAddr, StartupError> {
    let ip = match address.map(str::trim) {
        None | Some("") => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        Some(text) => text.parse::<IpAddr>().map_err(|_| {
            StartupError::Bind(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid bind address '{text}'"),
            ))
        })?,
    };
    Ok(SocketAddr::new(ip, port))
}

/// Create a non-blocking listening socket bound to `addr`.
pub fn bind_and_listen(addr: SocketAddr, backlog: i32) -> Result<TcpListener, StartupError> {
    let socket = Socket::new(
        Domain::for_address(addr),
        Type::STREAM,
        Some(Protocol::TCP),
    )
    .map_err(StartupError::Bind)?;

    socket
        .set_reuse_address(true)
        .map_err(StartupError::Configure)?;
    socket.bind(&addr.into()).map_err(StartupError::Bind)?;
    socket.listen(backlog).map_err(StartupError::Listen)?;
    socket
        .set_nonblocking(true)
        .map_err(StartupError::Configure)?;

    debug!(handle = socket.as_raw_fd(), addr = %addr, "Listening socket ready");
    Ok(TcpListener::from_std(socket.into()))
}

/// Accept one pending connection.
///
/// `Ok(None)` means the backlog is empty. The returned stream is already
/// non-blocking; if that cannot be arranged the socket is dropped (closed).
pub fn accept_one(listener: &TcpListener) -> Result<Option<(TcpStream, SockAddr)>, AcceptError> {
    let (socket, peer) = loop {
        match SockRef::from(listener).accept() {
            Ok(pair) => break pair,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(AcceptError::Accept(e)),
        }
    };

    if let Err(source) = socket.set_nonblocking(true) {
        return Err(AcceptError::Configure {
            handle: socket.as_raw_fd(),
            source,
        });
    }

    Ok(Some((TcpStream::from_std(socket.into()), peer)))
}

/// Drain everything currently readable from `src` into `buf`.
///
/// Reads up to `scratch.len()` bytes at a time until the source would block
/// or reports end of stream. Overflowing `buf` is an error; the bytes of the
/// offending chunk are not appended.
pub fn read_into<R: Read>(
    src: &mut R,
    buf: &mut BoundedBuffer,
    scratch: &mut [u8],
) -> Result<ReadOutcome, BufferOverflow> {
    let mut total = 0;

    loop {
        match src.read(scratch) {
            Ok(0) => return Ok(ReadOutcome::Closed),
            Ok(n) => {
                buf.extend(&scratch[..n])?;
                total += n;
                trace!(read = n, pending = buf.len(), "Read chunk");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(if total == 0 {
                    ReadOutcome::WouldBlock
                } else {
                    ReadOutcome::Data(total)
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Ok(ReadOutcome::Error(e)),
        }
    }
}

/// Make one write attempt of at most `max_len` bytes from the head of `buf`.
///
/// Written bytes are consumed from `buf`. Callers must expect short writes.
pub fn write_from<W: Write>(dst: &mut W, buf: &mut BoundedBuffer, max_len: usize) -> WriteOutcome {
    if buf.is_empty() {
        return WriteOutcome::Written(0);
    }

    let len = buf.len().min(max_len);
    match dst.write(&buf.as_slice()[..len]) {
        Ok(0) => WriteOutcome::Error(io::Error::new(
            io::ErrorKind::WriteZero,
            "write returned 0",
        )),
        Ok(n) => {
            buf.consume(n);
            trace!(written = n, left = buf.len(), "Wrote chunk");
            WriteOutcome::Written(n)
        }
        Err(ref e)
            if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted =>
        {
            WriteOutcome::WouldBlock
        }
        Err(e) => WriteOutcome::Error(e),
    }
}
