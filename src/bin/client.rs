//! Burrow Client
//!
//! Keeps a pool of encrypted tunnels to a server and forwards every local
//! connection through it to a fixed destination.

use anyhow::{anyhow, Context, Result};
use burrow::{
    config::{generate_example_config, Config},
    protocol::Timeouts,
    transport::TcpDialer,
    ClientPeer, PeerOptions, VERSION,
};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Burrow Client - multiplexed tunnel forwarder
#[derive(Parser, Debug)]
#[command(name = "burrow-client")]
#[command(about = "Burrow Client - multiplexed tunnel forwarder")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Write an example configuration to the config path and exit
    #[arg(long)]
    generate_config: bool,

    /// Server tunnel endpoint (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Local listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Destination reached through the server (overrides config)
    #[arg(short, long)]
    dest: Option<String>,

    /// Number of tunnels (overrides config)
    #[arg(short, long)]
    tunnels: Option<usize>,

    /// Log level (trace, debug, info, warn, error), overrides config
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        generate_example_config()
            .save(&args.config)
            .context("Failed to write example configuration")?;
        println!("Example configuration written to {}", args.config);
        return Ok(());
    }

    // Load configuration
    let config = Config::load(&args.config).context("Failed to load configuration")?;

    // Initialize logging
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    tracing_subscriber::fmt().with_env_filter(level).init();

    let client_config = config
        .client
        .clone()
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;
    let server = args.server.unwrap_or(client_config.server);
    let listen = args.listen.unwrap_or(client_config.listen);
    let dest = args.dest.unwrap_or(client_config.dest);
    let tunnels = args.tunnels.unwrap_or(client_config.tunnels);
    if tunnels == 0 {
        return Err(anyhow!("At least one tunnel is required"));
    }

    let key = config.crypto.master_key().context("Invalid [crypto] section")?;
    let timeouts = Timeouts::from(&config.tuning);
    let options = PeerOptions {
        key: Arc::new(key),
        dialer: Arc::new(TcpDialer::new(timeouts.connect)),
        timeouts,
    };

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;

    info!("Burrow client v{}", VERSION);
    info!("Forwarding {} -> {} via {} ({} tunnels)", listen, dest, server, tunnels);

    let root = CancellationToken::new();
    let client = ClientPeer::new(&server, tunnels, options, &root);

    tokio::select! {
        result = client.serve_forward(listener, dest) => {
            result.context("Forwarding stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    root.cancel();
    Ok(())
}
