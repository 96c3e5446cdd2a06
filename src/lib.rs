//! # Culvert
//!
//! A reverse tunneling proxy that exposes services running behind NAT or
//! restrictive firewalls to the public internet.
//!
//! Two peers cooperate: a **client** next to the private services dials out
//! to a publicly reachable **server**. The pair maintain a long-lived,
//! token-authenticated control channel plus a pool of pre-dialed data
//! connections, so that public TCP (and optionally UDP) connections arriving
//! at the server are paired with a ready tunnel connection and streamed to
//! the right local service with minimal added latency.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 Dispatch / Pool Layer                 │
//! │  (pairing workers, adaptive pool sizer, supervisor)   │
//! ├──────────────────────────────────────────────────────┤
//! │                   Control Channel                     │
//! │        (token handshake, signals, heartbeats)         │
//! ├──────────────────────────────────────────────────────┤
//! │                  Mux Session Layer                    │
//! │    (optional: many logical streams per connection)    │
//! ├──────────────────────────────────────────────────────┤
//! │                   Transport Layer                     │
//! │        (TCP dial/accept, keepalive, nodelay)          │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod control;
pub mod monitor;
pub mod mux;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod transport;

pub use config::Config;

use async_trait::async_trait;
use std::sync::Arc;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Control channel error: {0}")]
    Control(#[from] control::ControlError),

    #[error("Mux error: {0}")]
    Mux(#[from] mux::MuxError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// A runnable tunnel endpoint: one of the server dispatchers or client pools.
///
/// `run` drives the endpoint through establish/serve/restart cycles until the
/// parent cancellation token it was built with is cancelled.
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    async fn run(self: Arc<Self>);
}
