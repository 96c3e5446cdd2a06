//! Server-side dispatch engine
//!
//! The server owns all public surface: the tunnel listener the client dials,
//! one listener per port mapping, and the control channel. Incoming user
//! connections are parked on a bounded queue until a pairing worker matches
//! them with a ready tunnel connection (or mux stream), forwards the target
//! address, and hands both ends to a copier.

pub mod tcp;
pub mod tcpmux;
mod udp;

pub use tcp::TcpServer;
pub use tcpmux::MuxServer;

use crate::control::ControlChannel;
use crate::protocol::{self, Signal};
use crate::transport::PortMapping;
use crate::{control, transport};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Pairing workers per cycle, capped regardless of core count.
pub(crate) fn pairing_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(4)
}

/// Drain period between cancelling a cycle and starting the next one.
pub(crate) const RESTART_DELAY: Duration = Duration::from_secs(2);

/// Expiry for quiet UDP sessions.
pub(crate) const UDP_SESSION_IDLE: Duration = Duration::from_secs(120);

/// A user connection parked until a tunnel connection is available.
pub struct LocalPending {
    pub conn: PendingConn,
    /// Address forwarded to the client once paired
    pub target: String,
    /// Public port, for usage attribution
    pub port: u16,
}

pub enum PendingConn {
    Tcp(TcpStream),
    Udp(UdpPending),
}

impl PendingConn {
    pub fn tag(&self) -> Signal {
        match self {
            PendingConn::Tcp(_) => Signal::Tcp,
            PendingConn::Udp(_) => Signal::Udp,
        }
    }
}

/// A logical UDP flow: one public peer address on one mapping.
pub struct UdpPending {
    /// Datagrams routed here by the mapping's listener
    pub from_user: mpsc::Receiver<Bytes>,
    /// Listener socket, shared for replies
    pub socket: Arc<UdpSocket>,
    pub peer: SocketAddr,
}

/// Endpoint hooks the shared server tasks need.
pub(crate) trait ServerEndpoint: Send + Sync + 'static {
    fn restart_lock(&self) -> &Mutex<()>;
    fn heartbeat(&self) -> Duration;
}

/// Idempotent restart request: cancel the current cycle under the restart
/// mutex. The supervisor loop in `run` observes the cycle ending, waits the
/// drain period, and rebuilds with fresh queues and counters.
pub(crate) async fn restart<S: ServerEndpoint>(server: &S, cancel: &CancellationToken) {
    let Ok(_guard) = server.restart_lock().try_lock() else {
        warn!("server restart already in progress, skipping restart attempt");
        return;
    };
    info!("restarting server...");
    cancel.cancel();
}

/// Accept on the tunnel listener until one connection completes the token
/// handshake; that connection becomes the control channel. Failed attempts
/// are logged and dropped, the loop continues.
pub(crate) async fn await_control(
    listener: &TcpListener,
    token: &str,
    keepalive: Duration,
    nodelay: bool,
    cancel: &CancellationToken,
) -> Option<ControlChannel> {
    loop {
        let (mut conn, peer) = tokio::select! {
            _ = cancel.cancelled() => return None,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) => {
                    debug!(error = %e, "failed to accept tunnel connection");
                    continue;
                }
            },
        };

        if let Err(e) = transport::configure(&conn, keepalive, nodelay) {
            warn!(%peer, error = %e, "failed to configure accepted socket");
        }

        match control::server_handshake(&mut conn, token).await {
            Ok(()) => {
                info!("control channel successfully established");
                match ControlChannel::new(conn) {
                    Ok(control) => return Some(control),
                    Err(e) => {
                        error!(error = %e, "failed to split control channel");
                        continue;
                    }
                }
            }
            Err(control::ControlError::TokenMismatch) => {
                warn!(%peer, "invalid security token received");
            }
            Err(control::ControlError::HandshakeTimeout) => {
                warn!(%peer, "timeout while waiting for control channel signal");
            }
            Err(e) => {
                error!(%peer, error = %e, "failed to receive control channel signal");
            }
        }
    }
}

/// Apply the accept-side policy to a tunnel connection and reject peers other
/// than the one holding the control channel.
pub(crate) fn vet_tunnel_conn(
    conn: TcpStream,
    peer: SocketAddr,
    expected_ip: std::net::IpAddr,
    keepalive: Duration,
    nodelay: bool,
) -> Option<TcpStream> {
    if peer.ip() != expected_ip {
        debug!(
            suspicious = %peer.ip(),
            expected = %expected_ip,
            "suspicious tunnel connection, discarding"
        );
        return None;
    }
    if let Err(e) = transport::configure(&conn, keepalive, nodelay) {
        warn!(%peer, error = %e, "failed to configure tunnel socket");
    }
    Some(conn)
}

/// One TCP listener per port mapping: park accepted connections on the
/// bounded local queue and offer a demand token. Overflow never blocks the
/// accept path: connections are dropped, tokens coalesced.
pub(crate) async fn local_listener(
    mapping: PortMapping,
    local_tx: mpsc::Sender<LocalPending>,
    req_tx: mpsc::Sender<()>,
    nodelay: bool,
    cancel: CancellationToken,
) {
    let listener = match TcpListener::bind(mapping.bind_addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(bind = %mapping.bind_addr(), error = %e, "failed to listen");
            return;
        }
    };
    let local_addr = listener.local_addr().ok();
    info!(addr = ?local_addr, "listener started successfully");

    loop {
        let (conn, peer) = tokio::select! {
            _ = cancel.cancelled() => return,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) => {
                    debug!(error = %e, "failed to accept connection");
                    continue;
                }
            },
        };

        if let Err(e) = conn.set_nodelay(nodelay) {
            warn!(%peer, error = %e, "failed to set TCP_NODELAY");
        }

        let port = conn.local_addr().map(|a| a.port()).unwrap_or(0);
        let pending = LocalPending {
            conn: PendingConn::Tcp(conn),
            target: mapping.remote_target.clone(),
            port,
        };

        match local_tx.try_send(pending) {
            Ok(()) => {
                if req_tx.try_send(()).is_err() {
                    warn!("channel is full, cannot request a new connection");
                }
                debug!(%peer, "accepted incoming TCP connection");
            }
            Err(TrySendError::Full(_)) => {
                warn!(%peer, "local queue is full, discarding connection");
            }
            Err(TrySendError::Closed(_)) => return,
        }
    }
}

/// Spawn the UDP listener for a mapping when `accept_udp` is on.
pub(crate) fn spawn_udp_listener(
    mapping: &PortMapping,
    local_tx: mpsc::Sender<LocalPending>,
    req_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    tokio::spawn(udp::udp_listener(
        mapping.bind_addr(),
        mapping.remote_target.clone(),
        local_tx,
        req_tx,
        cancel,
    ));
}

/// Control-channel steady state, server side: write `HB` on the heartbeat
/// timer and `REQ_CHAN` for each drained demand token; read signals from the
/// client. Any write failure, read failure, or peer `CLOSED` triggers
/// restart.
pub(crate) async fn channel_handler<S: ServerEndpoint>(
    server: Arc<S>,
    channel: ControlChannel,
    mut req_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    let ControlChannel {
        mut read,
        mut write,
        ..
    } = channel;

    let period = server.heartbeat();
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = protocol::send_signal(&mut write, Signal::Closed).await;
                return;
            }

            token = req_rx.recv() => {
                if token.is_none() {
                    return;
                }
                if protocol::send_signal(&mut write, Signal::ReqChan).await.is_err() {
                    error!("error sending channel signal, attempting to restart server...");
                    restart(&*server, &cancel).await;
                    return;
                }
            }

            _ = heartbeat.tick() => {
                if protocol::send_signal(&mut write, Signal::Heartbeat).await.is_err() {
                    error!("failed to send heartbeat signal, attempting to restart server...");
                    restart(&*server, &cancel).await;
                    return;
                }
                trace!("heartbeat signal sent successfully");
            }

            res = protocol::recv_signal(&mut read) => {
                match res {
                    Ok(Signal::Closed) => {
                        info!("control channel has been closed by the client");
                        restart(&*server, &cancel).await;
                        return;
                    }
                    Ok(signal) => {
                        trace!(?signal, "signal received on control channel");
                    }
                    Err(e) => {
                        error!(error = %e, "failed to receive message from channel connection");
                        restart(&*server, &cancel).await;
                        return;
                    }
                }
            }
        }
    }
}
