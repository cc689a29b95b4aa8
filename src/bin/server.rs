//! Burrow Server
//!
//! Accepts encrypted tunnels from clients, groups them by peer ID and dials
//! the destinations requested over them.

use anyhow::{anyhow, Context, Result};
use burrow::{
    config::{generate_example_config, Config},
    protocol::Timeouts,
    transport::TcpDialer,
    PeerOptions, Server, VERSION,
};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Burrow Server - multiplexed tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "burrow-server")]
#[command(about = "Burrow Server - multiplexed tunnel endpoint")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Write an example configuration to the config path and exit
    #[arg(long)]
    generate_config: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

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

    let server_config = config
        .server
        .clone()
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;
    let listen = args.listen.unwrap_or(server_config.listen);

    let key = config.crypto.master_key().context("Invalid [crypto] section")?;
    let timeouts = Timeouts::from(&config.tuning);
    let options = PeerOptions {
        key: Arc::new(key),
        dialer: Arc::new(TcpDialer::new(timeouts.connect)),
        timeouts,
    };

    let root = CancellationToken::new();
    let server = Server::new(options, &root);

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;

    info!("Burrow server v{}", VERSION);
    info!("Listening on {} ({})", listen, config.crypto.cipher);

    let shutdown = root.child_token();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
        }
        signal.cancel();
    });

    server.serve(listener, shutdown).await?;
    root.cancel();

    Ok(())
}
