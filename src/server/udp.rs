//! UDP listener for mapped ports
//!
//! One socket per mapping. Each distinct peer address becomes a logical
//! session parked on the same local queue the TCP listeners feed; the
//! pairing workers then forward the target tagged `UDP` and hand the flow to
//! the framed UDP relay. Entries whose relay has ended are swept on a timer,
//! so one-shot peers cannot grow the session table without bound.

use super::{LocalPending, PendingConn, UdpPending, UDP_SESSION_IDLE};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Datagrams buffered per session before the accept path starts dropping.
const SESSION_QUEUE: usize = 64;

pub(crate) async fn udp_listener(
    bind_addr: String,
    target: String,
    local_tx: mpsc::Sender<LocalPending>,
    req_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    let socket = match UdpSocket::bind(&bind_addr).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            error!(bind = %bind_addr, error = %e, "failed to bind UDP listener");
            return;
        }
    };
    let port = socket.local_addr().map(|a| a.port()).unwrap_or(0);
    info!(bind = %bind_addr, "udp listener started successfully");

    let mut sessions: HashMap<SocketAddr, mpsc::Sender<Bytes>> = HashMap::new();
    let mut buf = vec![0u8; u16::MAX as usize];

    // The relay drops its receiver when the session ends (idle expiry, tunnel
    // error, or the pending being discarded); the sweep reclaims those
    // entries even if the peer never sends again.
    let mut sweep = tokio::time::interval(UDP_SESSION_IDLE);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let (len, peer) = tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sweep.tick() => {
                let before = sessions.len();
                sessions.retain(|_, session_tx| !session_tx.is_closed());
                if sessions.len() < before {
                    trace!(swept = before - sessions.len(), "removed finished udp sessions");
                }
                continue;
            }
            res = socket.recv_from(&mut buf) => match res {
                Ok(received) => received,
                Err(e) => {
                    debug!(error = %e, "udp recv error");
                    continue;
                }
            },
        };
        let datagram = Bytes::copy_from_slice(&buf[..len]);

        if let Some(session_tx) = sessions.get(&peer) {
            match session_tx.try_send(datagram.clone()) {
                Ok(()) => continue,
                Err(TrySendError::Full(_)) => {
                    trace!(%peer, "udp session queue full, dropping datagram");
                    continue;
                }
                Err(TrySendError::Closed(_)) => {
                    // Relay ended; start a fresh session with this datagram
                    sessions.remove(&peer);
                }
            }
        }

        let (session_tx, session_rx) = mpsc::channel(SESSION_QUEUE);
        let _ = session_tx.try_send(datagram);

        let pending = LocalPending {
            conn: PendingConn::Udp(UdpPending {
                from_user: session_rx,
                socket: Arc::clone(&socket),
                peer,
            }),
            target: target.clone(),
            port,
        };

        match local_tx.try_send(pending) {
            Ok(()) => {
                sessions.insert(peer, session_tx);
                if req_tx.try_send(()).is_err() {
                    warn!("channel is full, cannot request a new connection");
                }
                debug!(%peer, "new udp session parked");
            }
            Err(TrySendError::Full(_)) => {
                warn!(%peer, "local queue is full, discarding udp session");
            }
            Err(TrySendError::Closed(_)) => return,
        }
    }
}
