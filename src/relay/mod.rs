//! Byte movement between paired connections
//!
//! Once the dispatcher has matched a public connection with a tunnel
//! connection (or mux stream), one of the pipes in this module takes over and
//! streams payload until either side ends. Either direction finishing (EOF,
//! reset, or error) tears down both ends; there is no half-open lingering.
//!
//! Every byte moved in either direction is reported to the usage monitor
//! under the public-facing port of the connection.

use crate::monitor::Usage;
use crate::mux::{MuxStream, StreamEvent};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::trace;

const COPY_BUF: usize = 32 * 1024;

/// Stream bytes both ways between two TCP connections until either direction
/// ends or the lifecycle is cancelled. Both sockets are closed on return.
pub async fn pipe_conns(
    a: TcpStream,
    b: TcpStream,
    usage: Arc<Usage>,
    port: u16,
    cancel: CancellationToken,
) {
    let (mut a_read, mut a_write) = a.into_split();
    let (mut b_read, mut b_write) = b.into_split();

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = copy_half(&mut a_read, &mut b_write, &usage, port) => {}
        _ = copy_half(&mut b_read, &mut a_write, &usage, port) => {}
    }

    trace!(port, "connection pair finished");
}

async fn copy_half(
    read: &mut OwnedReadHalf,
    write: &mut OwnedWriteHalf,
    usage: &Usage,
    port: u16,
) {
    let mut buf = vec![0u8; COPY_BUF];
    loop {
        match read.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if write.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                usage.record(port, n as u64);
            }
        }
    }
    let _ = write.shutdown().await;
}

/// Stream bytes both ways between a mux stream and a TCP connection.
///
/// Used on both peers in mux mode: the server pairs a freshly opened stream
/// with a public connection, the client pairs an accepted stream with the
/// local service it dialed.
pub async fn pipe_stream(
    stream: MuxStream,
    conn: TcpStream,
    usage: Arc<Usage>,
    port: u16,
    cancel: CancellationToken,
) {
    let (sender, mut events) = stream.split();
    let (mut conn_read, mut conn_write) = conn.into_split();

    let to_tunnel = async {
        let mut buf = vec![0u8; COPY_BUF];
        loop {
            match conn_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if sender.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                    usage.record(port, n as u64);
                }
            }
        }
    };

    let from_tunnel = async {
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Data(data) => {
                    if conn_write.write_all(&data).await.is_err() {
                        break;
                    }
                    usage.record(port, data.len() as u64);
                }
                StreamEvent::Close | StreamEvent::Error(_) => break,
            }
        }
        let _ = conn_write.shutdown().await;
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = to_tunnel => {}
        _ = from_tunnel => {}
    }

    sender.close().await;
    trace!(port, "stream pair finished");
}

/// Write one UDP payload onto a byte stream as a `u16`-length-prefixed frame.
pub async fn send_datagram<W>(conn: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug_assert!(payload.len() <= u16::MAX as usize);
    let mut buf = Vec::with_capacity(2 + payload.len());
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    conn.write_all(&buf).await
}

/// Read one length-prefixed UDP payload from a byte stream.
pub async fn recv_datagram<R>(conn: &mut R) -> std::io::Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    conn.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut buf = vec![0u8; len];
    conn.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Server-side UDP relay: datagrams from one public peer ride a tunnel
/// connection as length-prefixed frames.
///
/// The per-mapping listener owns the socket and routes inbound datagrams to
/// this task over `from_user`; replies coming back down the tunnel are sent
/// to the recorded peer address. A quiet uplink for `idle` ends the session.
pub async fn pipe_udp_server(
    tunnel: TcpStream,
    mut from_user: mpsc::Receiver<Bytes>,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    usage: Arc<Usage>,
    port: u16,
    idle: Duration,
    cancel: CancellationToken,
) {
    let (mut tunnel_read, mut tunnel_write) = tunnel.into_split();

    let up = async {
        loop {
            match timeout(idle, from_user.recv()).await {
                Err(_) | Ok(None) => break,
                Ok(Some(payload)) => {
                    usage.record(port, payload.len() as u64);
                    if send_datagram(&mut tunnel_write, &payload).await.is_err() {
                        break;
                    }
                }
            }
        }
    };

    let down = async {
        loop {
            match recv_datagram(&mut tunnel_read).await {
                Err(_) => break,
                Ok(payload) => {
                    usage.record(port, payload.len() as u64);
                    if socket.send_to(&payload, peer).await.is_err() {
                        break;
                    }
                }
            }
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = up => {}
        _ = down => {}
    }

    trace!(port, %peer, "udp session finished");
}

/// Client-side UDP relay: frames from the tunnel become datagrams on a
/// connected local socket, and replies are framed back up the tunnel.
pub async fn pipe_udp_client(
    tunnel: TcpStream,
    socket: UdpSocket,
    usage: Arc<Usage>,
    port: u16,
    idle: Duration,
    cancel: CancellationToken,
) {
    let (mut tunnel_read, mut tunnel_write) = tunnel.into_split();

    let down = async {
        loop {
            match recv_datagram(&mut tunnel_read).await {
                Err(_) => break,
                Ok(payload) => {
                    usage.record(port, payload.len() as u64);
                    if socket.send(&payload).await.is_err() {
                        break;
                    }
                }
            }
        }
    };

    let up = async {
        let mut buf = vec![0u8; u16::MAX as usize];
        loop {
            match timeout(idle, socket.recv(&mut buf)).await {
                Err(_) | Ok(Err(_)) => break,
                Ok(Ok(n)) => {
                    usage.record(port, n as u64);
                    if send_datagram(&mut tunnel_write, &buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = down => {}
        _ = up => {}
    }

    trace!(port, "udp session finished");
}
