//! Parley server binary.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default port with uploads under ./parley-files
//! parley-server
//!
//! # Custom address and storage root, no operator console
//! parley-server --bind 127.0.0.1:7000 --storage-root /var/lib/parley --no-console
//! ```

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use parley_server::{DriverConfig, Server, ServerRuntimeConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Parley chat and file-relay server
#[derive(Parser, Debug)]
#[command(name = "parley-server")]
#[command(about = "Multi-user chat and file-relay server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:9000")]
    bind: String,

    /// Directory for group uploads
    #[arg(short, long, default_value = "parley-files")]
    storage_root: PathBuf,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Seconds a file offer waits for an answer
    #[arg(long, default_value = "30")]
    invite_timeout_secs: u64,

    /// Messages queued for a slow client before it is dropped
    #[arg(long, default_value = "256")]
    outbox_capacity: usize,

    /// Do not read operator commands from standard input
    #[arg(long)]
    no_console: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Parley server starting");
    tracing::info!("Binding to {}", args.bind);
    tracing::info!("Storing group files under {}", args.storage_root.display());

    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        storage_root: args.storage_root,
        driver: DriverConfig {
            max_connections: args.max_connections,
            invite_timeout: Duration::from_secs(args.invite_timeout_secs),
            outbox_capacity: args.outbox_capacity,
        },
        admin_console: !args.no_console,
    };

    let server = Server::bind(config).await?;

    tracing::info!("Server listening on {}", server.local_addr()?);

    server.run().await?;

    Ok(())
}
