//! Single-threaded readiness runtime for the echo server.
//!
//! Built on mio (epoll on Linux, kqueue on macOS). Layered leaves first:
//! - `socket`: listener setup, accept, bounded non-blocking read/write
//! - `registry`: interest bookkeeping over the poller
//! - `buffer` / `connection`: per-connection buffering and interest decisions
//! - `event_loop`: the `Server` context that ties them together

mod buffer;
mod connection;
mod error;
mod event_loop;
mod registry;
mod socket;

pub use error::StartupError;
pub use event_loop::Server;

use crate::config::Config;
use std::time::Duration;

/// Tunable limits of the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    /// Listen backlog.
    pub backlog: i32,
    /// Capacity of each connection's read and write buffer.
    pub buffer_capacity: usize,
    /// Maximum bytes handed to one write call.
    pub write_chunk: usize,
    /// Bytes requested per read call while draining.
    pub read_chunk: usize,
    /// Maximum notifications collected per wait.
    pub max_events: usize,
    /// Upper bound on a single wait.
    pub poll_timeout: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            backlog: 1024,
            buffer_capacity: 4096,
            // Small on purpose so partial writes and write interest get exercised
            write_chunk: 8,
            read_chunk: 1024,
            max_events: 1024,
            poll_timeout: Duration::from_secs(5),
        }
    }
}

/// Bring up a server from resolved configuration.
pub fn init(config: &Config) -> Result<Server, StartupError> {
    Server::init(config.bind.as_deref(), config.port, config.tuning)
}
