//! Standalone relay server binary
//!
//! Run with:
//!   cargo run --bin skillsync-relay -- --port 8888

use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use skillsync_core::DEFAULT_RELAY_PORT;
use skillsync_net::RelayServer;

/// HTTP relay for skillsync rooms
#[derive(Parser, Debug)]
#[command(name = "skillsync-relay")]
#[command(about = "HTTP relay for skillsync rooms behind NAT")]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_RELAY_PORT)]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    let addr = SocketAddr::new(args.host, args.port);
    let server = RelayServer::start(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(addr = %server.addr(), "Relay server started");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            // Dropping the wait future drops the server, which stops it
            info!("Shutting down");
        }
        _ = server.wait() => {}
    }

    Ok(())
}
