//! Culvert Client
//!
//! The NAT'd half of the tunnel:
//! - Dials the server and authenticates the control channel
//! - Keeps a pool of pre-dialed tunnel connections sized to observed load
//! - Forwards paired connections to the local services

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use culvert::config::{generate_example_config, Config, TransportMode};
use culvert::client::{MuxClient, TcpClient};
use culvert::Endpoint;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Culvert Client - private endpoint of the reverse tunnel
#[derive(Parser, Debug)]
#[command(name = "culvert-client")]
#[command(about = "Culvert Client - connect private services to a public tunnel endpoint")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Write an example configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Server tunnel address (overrides config)
    #[arg(short, long)]
    remote: Option<String>,

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
    let mut client_config = config
        .client
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;

    if let Some(remote) = args.remote {
        client_config.remote_addr = remote;
    }
    if client_config.token.is_empty() {
        return Err(anyhow!("client token must not be empty"));
    }

    info!("Culvert Client v{}", culvert::VERSION);
    info!(transport = ?client_config.transport, remote = %client_config.remote_addr, "starting");

    let parent = CancellationToken::new();
    let endpoint: Arc<dyn Endpoint> = match client_config.transport {
        TransportMode::Tcp => TcpClient::new(client_config, parent.clone()),
        TransportMode::Tcpmux => MuxClient::new(client_config, parent.clone())?,
    };

    let run = tokio::spawn(endpoint.run());

    tokio::signal::ctrl_c().await?;
    info!("shutting down...");
    parent.cancel();
    let _ = run.await;

    Ok(())
}
