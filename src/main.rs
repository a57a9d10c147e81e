//! portico: event-driven network front-end for a database server.
//!
//! Accepts client connections on a listening socket, deals them across a
//! fixed pool of I/O worker threads, and drives each connection's wire
//! protocol with non-blocking, buffered I/O:
//! - One acceptor thread, round-robin hand-off over lock-free queues
//! - Per-worker reactors; a connection never changes workers
//! - Framed read/write buffering with pluggable protocol handlers
//! - Configuration via CLI arguments or TOML file

mod config;
mod net;
mod protocols;
mod server;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        protocol = ?config.protocol,
        max_connections = config.max_connections,
        "Starting portico"
    );

    // Bring up workers and the listener, wire SIGINT to a clean stop.
    let server = Server::bind(config)?;
    info!(addr = %server.local_addr(), "serving");

    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || shutdown.signal())?;

    server.run()?;

    Ok(())
}
