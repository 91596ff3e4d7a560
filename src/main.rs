//! linewire demo host
//!
//! Serves a handful of example methods over the linewire protocol:
//! - `ping`, `echo`, `time`, `clients`, `announce`
//! - Optional heartbeat broadcast to every connected client
//! - Configuration via CLI arguments or TOML file

mod demo;

use linewire::config::Config;
use linewire::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut server = Server::new(config.server);
    demo::register(&mut server)?;

    let bound = server.bind().await?;
    info!(
        address = %bound.local_addr(),
        heartbeat_interval = config.heartbeat_interval,
        "Starting linewire server"
    );

    if config.heartbeat_interval > 0 {
        tokio::spawn(demo::heartbeat_task(
            bound.handle(),
            config.heartbeat_interval,
        ));
    }

    bound.serve().await?;
    Ok(())
}
