//! ws-echo: a WebSocket echo server
//!
//! Accepts TCP connections, performs the WebSocket upgrade handshake,
//! and echoes every text or binary message back to its sender with the
//! payload and frame type unchanged.
//!
//! Features:
//! - One serialized session task per connection; connections never
//!   block each other
//! - Configurable listen address and worker thread count
//! - Configuration via CLI arguments or TOML file

mod config;
mod server;
mod session;

use config::Config;
use server::Server;
use tracing::info;
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

    let workers = if config.workers == 0 {
        num_cpus()
    } else {
        config.workers
    };

    info!(
        host = %config.host,
        port = config.port,
        workers,
        "Starting ws-echo server"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()?;

    // Bind failures abort startup; the accept loop runs until the
    // process is terminated externally.
    runtime.block_on(Server::new(config).run())?;

    Ok(())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
