//! Control channel
//!
//! The single authenticated connection between peers. It carries only
//! signals, never user payload: heartbeats from the server, `REQ_CHAN`
//! demand notifications, and the `CLOSED` farewell. The handshake is a token
//! exchange under a short read deadline; everything after that is bare
//! signal bytes.

use crate::protocol::{self, ProtocolError, Signal};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Read deadline for each handshake step.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Control channel errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("timeout while waiting for handshake response")]
    HandshakeTimeout,

    #[error("invalid security token")]
    TokenMismatch,

    #[error("invalid handshake signal: {0:?}")]
    WrongTag(Signal),

    #[error("control channel closed by peer")]
    PeerClosed,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Client side of the token handshake.
///
/// Sends the shared token tagged `REQ_CHAN`, then waits for the echoed token
/// under the handshake deadline. On success the connection is Established.
pub async fn client_handshake<C>(conn: &mut C, token: &str) -> Result<(), ControlError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    protocol::send_tagged_string(conn, token, Signal::ReqChan).await?;

    let (_, echoed) = timeout(HANDSHAKE_TIMEOUT, protocol::recv_tagged_string(conn))
        .await
        .map_err(|_| ControlError::HandshakeTimeout)??;

    if echoed != token {
        return Err(ControlError::TokenMismatch);
    }
    Ok(())
}

/// Server side of the token handshake.
///
/// Reads a tagged token under the deadline; the tag must be `REQ_CHAN` and
/// the token must match. Echoes the token back tagged `REQ_CHAN`.
pub async fn server_handshake<C>(conn: &mut C, token: &str) -> Result<(), ControlError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (tag, received) = timeout(HANDSHAKE_TIMEOUT, protocol::recv_tagged_string(conn))
        .await
        .map_err(|_| ControlError::HandshakeTimeout)??;

    if tag != Signal::ReqChan {
        return Err(ControlError::WrongTag(tag));
    }
    if received != token {
        return Err(ControlError::TokenMismatch);
    }

    protocol::send_tagged_string(conn, token, Signal::ReqChan).await?;
    Ok(())
}

/// An established control channel, split for its reader and writer tasks.
///
/// Exactly one exists per peer pair while Established; the supervisor drops
/// it wholesale on restart rather than repairing it in place.
pub struct ControlChannel {
    pub read: OwnedReadHalf,
    pub write: OwnedWriteHalf,
    /// Peer address, used by the server to discard spoofed tunnel dials
    pub peer_ip: IpAddr,
}

impl ControlChannel {
    pub fn new(conn: TcpStream) -> std::io::Result<Self> {
        let peer_ip = conn.peer_addr()?.ip();
        let (read, write) = conn.into_split();
        Ok(Self {
            read,
            write,
            peer_ip,
        })
    }
}
