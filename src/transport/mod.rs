//! TCP connection primitives and address handling
//!
//! Everything that touches a raw socket option lives here: outbound dials
//! with a connect timeout, the keepalive/nodelay policy applied to accepted
//! connections, and the textual address forms used by port mappings.

use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dial to {0} timed out")]
    DialTimeout(String),

    #[error("invalid address: {0}")]
    InvalidAddr(String),

    #[error("invalid port mapping: {0}")]
    InvalidMapping(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Dial a TCP endpoint with a connect timeout, then apply the keepalive
/// period and `TCP_NODELAY` flag.
pub async fn dial(
    addr: &str,
    dial_timeout: Duration,
    keepalive: Duration,
    nodelay: bool,
) -> Result<TcpStream, TransportError> {
    let stream = timeout(dial_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::DialTimeout(addr.to_string()))?
        .map_err(|e| TransportError::Dial {
            addr: addr.to_string(),
            source: e,
        })?;

    configure(&stream, keepalive, nodelay)?;

    trace!(addr, nodelay, "TCP connection established");
    Ok(stream)
}

/// Apply the socket policy to a connection: OS-level keep-alive at the given
/// period, and `TCP_NODELAY` per the flag. Used on both dialed and accepted
/// sockets.
pub fn configure(
    stream: &TcpStream,
    keepalive: Duration,
    nodelay: bool,
) -> Result<(), TransportError> {
    stream.set_nodelay(nodelay)?;

    let params = TcpKeepalive::new()
        .with_time(keepalive)
        .with_interval(keepalive);
    SockRef::from(stream).set_tcp_keepalive(&params)?;

    Ok(())
}

/// Parse a target address string into `(port, dialable address)`.
///
/// Bare integers and `":port"` mean that port on loopback; anything else must
/// be `host:port`.
pub fn resolve_remote_addr(addr: &str) -> Result<(u16, String), TransportError> {
    if let Ok(port) = addr.parse::<u16>() {
        return Ok((port, format!("127.0.0.1:{port}")));
    }

    if let Some(rest) = addr.strip_prefix(':') {
        let port = rest
            .parse::<u16>()
            .map_err(|_| TransportError::InvalidAddr(addr.to_string()))?;
        return Ok((port, format!("127.0.0.1:{port}")));
    }

    // host:port, including bracketed IPv6
    let (_, port_str) = addr
        .rsplit_once(':')
        .ok_or_else(|| TransportError::InvalidAddr(addr.to_string()))?;
    let port = port_str
        .parse::<u16>()
        .map_err(|_| TransportError::InvalidAddr(addr.to_string()))?;

    Ok((port, addr.to_string()))
}

/// A static rule translating a server-side listening endpoint to a
/// client-side target endpoint.
///
/// Textual form is `"L=R"` where each side is `host:port`, `:port`, or a
/// bare port. A bare port on the left means `":port"`; a single entry with
/// no `=` applies the same port to both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    /// Server-side bind address
    pub local_bind: String,
    /// Address forwarded to the client for each paired connection
    pub remote_target: String,
}

impl FromStr for PortMapping {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            None => {
                let port = s
                    .trim()
                    .parse::<u16>()
                    .map_err(|_| TransportError::InvalidMapping(s.to_string()))?;
                Ok(PortMapping {
                    local_bind: format!(":{port}"),
                    remote_target: port.to_string(),
                })
            }
            Some((left, right)) => {
                let mut local_bind = left.trim().to_string();
                if local_bind.parse::<u16>().is_ok() {
                    local_bind = format!(":{local_bind}");
                }
                let remote_target = right.trim().to_string();
                if local_bind.is_empty() || remote_target.is_empty() {
                    return Err(TransportError::InvalidMapping(s.to_string()));
                }
                Ok(PortMapping {
                    local_bind,
                    remote_target,
                })
            }
        }
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.local_bind, self.remote_target)
    }
}

impl PortMapping {
    /// Bind address in the form `TcpListener::bind` accepts; a bare `":p"`
    /// becomes `"0.0.0.0:p"`.
    pub fn bind_addr(&self) -> String {
        if self.local_bind.starts_with(':') {
            format!("0.0.0.0{}", self.local_bind)
        } else {
            self.local_bind.clone()
        }
    }
}

/// Parse every configured mapping, failing on the first malformed entry.
pub fn parse_port_mappings(ports: &[String]) -> Result<Vec<PortMapping>, TransportError> {
    ports.iter().map(|p| p.parse()).collect()
}
