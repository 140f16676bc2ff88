//! Error taxonomy for the event loop.
//!
//! Errors are scoped by blast radius: `StartupError` aborts startup,
//! `AcceptError` and `ConnectionFatal` are contained to one accept attempt or
//! one connection, and `RuntimeError` ends the loop.

use crate::runtime::buffer::BufferOverflow;
use crate::runtime::registry::Readiness;
use crate::runtime::socket::Handle;
use std::io;
use thiserror::Error;

/// Failure while bringing the server up. `run` is never reached.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("bind failed: {0}")]
    Bind(#[source] io::Error),
    #[error("listen failed: {0}")]
    Listen(#[source] io::Error),
    #[error("failed to configure listening socket: {0}")]
    Configure(#[source] io::Error),
    #[error("failed to create poller: {0}")]
    Poll(#[source] io::Error),
    #[error("failed to register listening socket: {0}")]
    Registration(#[source] RegistrationError),
}

/// Failure accepting a single pending connection.
#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("failed to set handle {handle} non-blocking: {source}")]
    Configure {
        handle: Handle,
        #[source]
        source: io::Error,
    },
}

/// Misuse of the readiness registry, or the OS refusing a registration.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("handle {0} is already registered")]
    AlreadyRegistered(Handle),
    #[error("handle {0} is not registered")]
    NotRegistered(Handle),
    #[error("refusing to register handle {0} with no interest")]
    EmptyInterest(Handle),
    #[error("poller rejected handle {handle}: {source}")]
    Os {
        handle: Handle,
        #[source]
        source: io::Error,
    },
}

impl RegistrationError {
    /// True when the error means connection state and registry disagree.
    pub fn is_invariant_breach(&self) -> bool {
        !matches!(self, RegistrationError::Os { .. })
    }
}

/// Condition that ends one connection and nothing else.
#[derive(Debug, Error)]
pub enum ConnectionFatal {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error(transparent)]
    Overflow(#[from] BufferOverflow),
    #[error("unexpected readiness {0:?}")]
    UnexpectedReadiness(Readiness),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Registration(RegistrationError),
}

/// Failure that stops the event loop.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("wait for readiness failed: {0}")]
    Poll(#[source] io::Error),
    #[error("internal state corrupted: {0}")]
    Invariant(#[source] RegistrationError),
}
