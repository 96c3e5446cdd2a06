//! Culvert Server
//!
//! The publicly reachable half of the tunnel:
//! - Listens for the client's control channel and data connections
//! - Listens on every mapped public port
//! - Pairs user traffic with pooled tunnel connections

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use culvert::config::{generate_example_config, Config, TransportMode};
use culvert::server::{MuxServer, TcpServer};
use culvert::Endpoint;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Culvert Server - public endpoint of the reverse tunnel
#[derive(Parser, Debug)]
#[command(name = "culvert-server")]
#[command(about = "Culvert Server - expose NAT'd services through a public tunnel endpoint")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Write an example configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Tunnel bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .init();

    if args.generate_config {
        generate_example_config()
            .save(&args.config)
            .context("Failed to write example config")?;
        println!("Wrote example configuration to {}", args.config);
        return Ok(());
    }

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    let mut server_config = config
        .server
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;

    if let Some(bind) = args.bind {
        server_config.bind_addr = bind;
    }
    if server_config.token.is_empty() {
        return Err(anyhow!("server token must not be empty"));
    }
    if server_config.ports.is_empty() {
        warn!("no port mappings configured - tunnel will carry no traffic");
    }

    info!("Culvert Server v{}", culvert::VERSION);
    info!(transport = ?server_config.transport, bind = %server_config.bind_addr, "starting");

    let parent = CancellationToken::new();
    let endpoint: Arc<dyn Endpoint> = match server_config.transport {
        TransportMode::Tcp => TcpServer::new(server_config, parent.clone())?,
        TransportMode::Tcpmux => MuxServer::new(server_config, parent.clone())?,
    };

    let run = tokio::spawn(endpoint.run());

    tokio::signal::ctrl_c().await?;
    info!("shutting down...");
    parent.cancel();
    let _ = run.await;

    Ok(())
}
