//! echo-reactor: a single-threaded TCP echo server
//!
//! Every accepted connection gets its bytes back verbatim, driven by one
//! readiness event loop with no per-connection threads.
//!
//! Features:
//! - Non-blocking sockets multiplexed through mio
//! - Bounded per-connection buffers; overflow drops the connection
//! - Write-size cap to exercise partial writes and write interest
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;

use config::Config;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        bind = config.bind.as_deref().unwrap_or(""),
        port = config.port,
        backlog = config.tuning.backlog,
        buffer_capacity = config.tuning.buffer_capacity,
        write_chunk = config.tuning.write_chunk,
        poll_timeout_ms = config.tuning.poll_timeout.as_millis() as u64,
        "Starting echo-reactor server"
    );

    let mut server = runtime::init(&config)?;
    info!(addr = %server.local_addr(), "Entering event loop");

    match server.run() {
        Ok(never) => match never {},
        Err(e) => {
            error!(error = %e, "Event loop stopped");
            Err(e.into())
        }
    }
}
