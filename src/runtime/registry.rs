//! Readiness registry over a mio `Poll`.
//!
//! Sources are mio sockets registered directly, keyed by their raw
//! descriptor, which doubles as the mio token. The registry keeps its own
//! record of each handle's interest so contract violations (double register,
//! modify of an unknown handle) are reported instead of surfacing as errno
//! values from the poller.
//!
//! mio is edge-triggered. A handle that still has data to send after a write
//! that did not hit would-block must be re-armed with [`Registry::rearm`] or
//! it will not be told about write readiness again.

use crate::runtime::error::RegistrationError;
use crate::runtime::socket::Handle;
use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::os::fd::AsRawFd;
use std::time::Duration;
use tracing::debug;

/// Interest flags a handle can be registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterestSet {
    #[default]
    None,
    Read,
    Write,
    ReadWrite,
}

impl InterestSet {
    pub fn is_readable(self) -> bool {
        matches!(self, InterestSet::Read | InterestSet::ReadWrite)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, InterestSet::Write | InterestSet::ReadWrite)
    }

    pub fn is_none(self) -> bool {
        self == InterestSet::None
    }

    fn from_flags(read: bool, write: bool) -> Self {
        match (read, write) {
            (false, false) => InterestSet::None,
            (true, false) => InterestSet::Read,
            (false, true) => InterestSet::Write,
            (true, true) => InterestSet::ReadWrite,
        }
    }

    /// This set plus write interest.
    pub fn with_write(self) -> Self {
        Self::from_flags(self.is_readable(), true)
    }

    /// This set minus write interest.
    pub fn without_write(self) -> Self {
        Self::from_flags(self.is_readable(), false)
    }

    fn to_mio(self) -> Option<Interest> {
        match self {
            InterestSet::None => None,
            InterestSet::Read => Some(Interest::READABLE),
            InterestSet::Write => Some(Interest::WRITABLE),
            InterestSet::ReadWrite => Some(Interest::READABLE | Interest::WRITABLE),
        }
    }
}

/// Flags observed on one readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

impl Readiness {
    fn from_event(event: &mio::event::Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            hangup: event.is_read_closed() || event.is_write_closed(),
        }
    }

    /// Carries at least one of the flags the state machine acts on.
    pub fn is_actionable(&self) -> bool {
        self.readable || self.writable
    }
}

/// Owner of the OS multiplexer and the handle → interest record.
pub struct Registry {
    poll: Poll,
    events: Events,
    registered: HashMap<Handle, InterestSet>,
}

impl Registry {
    /// Create a poller that reports at most `max_events` notifications per wait.
    pub fn new(max_events: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(max_events),
            registered: HashMap::new(),
        })
    }

    /// Start watching `source`. Adding is not idempotent.
    pub fn register<S>(&mut self, source: &mut S, interest: InterestSet) -> Result<(), RegistrationError>
    where
        S: Source + AsRawFd,
    {
        let handle = source.as_raw_fd();
        if self.registered.contains_key(&handle) {
            return Err(RegistrationError::AlreadyRegistered(handle));
        }
        let mio_interest = interest
            .to_mio()
            .ok_or(RegistrationError::EmptyInterest(handle))?;

        self.poll
            .registry()
            .register(source, Token(handle as usize), mio_interest)
            .map_err(|source| RegistrationError::Os { handle, source })?;

        debug!(handle, ?interest, "Registered");
        self.registered.insert(handle, interest);
        Ok(())
    }

    /// Replace the interest of an already registered source.
    ///
    /// An empty interest is a deregistration.
    pub fn modify<S>(&mut self, source: &mut S, interest: InterestSet) -> Result<(), RegistrationError>
    where
        S: Source + AsRawFd,
    {
        let handle = source.as_raw_fd();
        if !self.registered.contains_key(&handle) {
            return Err(RegistrationError::NotRegistered(handle));
        }
        let Some(mio_interest) = interest.to_mio() else {
            self.deregister(source);
            return Ok(());
        };

        self.poll
            .registry()
            .reregister(source, Token(handle as usize), mio_interest)
            .map_err(|source| RegistrationError::Os { handle, source })?;

        debug!(handle, ?interest, "Modified interest");
        self.registered.insert(handle, interest);
        Ok(())
    }

    /// Re-submit the current interest so pending readiness is reported again.
    pub fn rearm<S>(&mut self, source: &mut S) -> Result<(), RegistrationError>
    where
        S: Source + AsRawFd,
    {
        let handle = source.as_raw_fd();
        let interest = self
            .registered
            .get(&handle)
            .copied()
            .ok_or(RegistrationError::NotRegistered(handle))?;
        let mio_interest = interest
            .to_mio()
            .ok_or(RegistrationError::EmptyInterest(handle))?;

        self.poll
            .registry()
            .reregister(source, Token(handle as usize), mio_interest)
            .map_err(|source| RegistrationError::Os { handle, source })
    }

    /// Stop watching `source`. Unregistered sources are ignored.
    pub fn deregister<S>(&mut self, source: &mut S)
    where
        S: Source + AsRawFd,
    {
        let handle = source.as_raw_fd();
        if self.registered.remove(&handle).is_none() {
            return;
        }
        if let Err(e) = self.poll.registry().deregister(source) {
            debug!(handle, error = %e, "Deregister failed");
        } else {
            debug!(handle, "Deregistered");
        }
    }

    /// Interest currently on record for `handle`.
    pub fn interest(&self, handle: Handle) -> InterestSet {
        self.registered.get(&handle).copied().unwrap_or_default()
    }

    /// Block until some handle is ready or `timeout` elapses.
    ///
    /// A timeout or an interrupted wait yields an empty batch.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(Handle, Readiness)>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        Ok(self
            .events
            .iter()
            .map(|event| (event.token().0 as Handle, Readiness::from_event(event)))
            .collect())
    }
}
