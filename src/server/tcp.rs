//! Non-mux server dispatcher
//!
//! One tunnel connection per user connection. Pairing workers pull one
//! parked user connection and one tunnel connection, forward the tagged
//! target address on the tunnel, and hand both sockets to the copier.

use super::{
    await_control, channel_handler, local_listener, pairing_workers, spawn_udp_listener,
    vet_tunnel_conn, LocalPending, PendingConn, ServerEndpoint, RESTART_DELAY, UDP_SESSION_IDLE,
};
use crate::config::ServerConfig;
use crate::monitor::Usage;
use crate::protocol;
use crate::relay;
use crate::transport::{parse_port_mappings, PortMapping};
use crate::{Endpoint, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// TCP transport server
pub struct TcpServer {
    config: ServerConfig,
    mappings: Vec<PortMapping>,
    parent: CancellationToken,
    restart_lock: Mutex<()>,
    usage: Arc<Usage>,
}

impl TcpServer {
    pub fn new(config: ServerConfig, parent: CancellationToken) -> Result<Arc<Self>> {
        let mappings = parse_port_mappings(&config.ports)?;
        Ok(Arc::new(Self {
            config,
            mappings,
            parent,
            restart_lock: Mutex::new(()),
            usage: Usage::new(),
        }))
    }

    pub fn usage(&self) -> Arc<Usage> {
        Arc::clone(&self.usage)
    }

    /// One Established lifetime: bind, handshake, serve until the cycle
    /// token is cancelled. All queues and workers are locals, so every
    /// restart starts from a clean slate.
    async fn run_cycle(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let keepalive = self.config.keepalive();
        let nodelay = self.config.nodelay;

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!(addr = %listener.local_addr()?, "server started successfully, listening for tunnel");

        let Some(channel) =
            await_control(&listener, &self.config.token, keepalive, nodelay, &cancel).await
        else {
            return Ok(());
        };
        let peer_ip = channel.peer_ip;

        let (tunnel_tx, tunnel_rx) = mpsc::channel::<TcpStream>(self.config.channel_size);
        let (local_tx, local_rx) = mpsc::channel::<LocalPending>(self.config.channel_size);
        let (req_tx, req_rx) = mpsc::channel::<()>(self.config.channel_size);

        tokio::spawn(Arc::clone(&self).accept_tunnel_loop(
            listener,
            tunnel_tx,
            peer_ip,
            cancel.clone(),
        ));

        for mapping in &self.mappings {
            tokio::spawn(local_listener(
                mapping.clone(),
                local_tx.clone(),
                req_tx.clone(),
                nodelay,
                cancel.clone(),
            ));
            if self.config.accept_udp {
                spawn_udp_listener(mapping, local_tx.clone(), req_tx.clone(), cancel.clone());
            }
        }

        tokio::spawn(channel_handler(
            Arc::clone(&self),
            channel,
            req_rx,
            cancel.clone(),
        ));

        let workers = pairing_workers();
        info!(workers, "starting pairing workers");

        let local_rx = Arc::new(Mutex::new(local_rx));
        let tunnel_rx = Arc::new(Mutex::new(tunnel_rx));
        for _ in 0..workers {
            tokio::spawn(Arc::clone(&self).pairing_loop(
                Arc::clone(&local_rx),
                Arc::clone(&tunnel_rx),
                cancel.clone(),
            ));
        }

        cancel.cancelled().await;
        Ok(())
    }

    /// Accept data connections from the client once the control channel is
    /// up. Spoofed peers are discarded; queue overflow drops the connection.
    async fn accept_tunnel_loop(
        self: Arc<Self>,
        listener: TcpListener,
        tunnel_tx: mpsc::Sender<TcpStream>,
        peer_ip: std::net::IpAddr,
        cancel: CancellationToken,
    ) {
        let keepalive = self.config.keepalive();
        loop {
            let (conn, peer) = tokio::select! {
                _ = cancel.cancelled() => return,
                res = listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        debug!(error = %e, "failed to accept tunnel connection");
                        continue;
                    }
                },
            };

            let Some(conn) = vet_tunnel_conn(conn, peer, peer_ip, keepalive, self.config.nodelay)
            else {
                continue;
            };

            match tunnel_tx.try_send(conn) {
                Ok(()) => debug!(%peer, "tunnel connection queued"),
                Err(TrySendError::Full(_)) => {
                    warn!(%peer, "tunnel queue is full, discarding connection");
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }

    /// The pairing state machine: one parked user connection, one tunnel
    /// connection, forward the tagged target, hand off to the copier. If the
    /// forward fails the tunnel connection is dropped and the worker retries
    /// with the next one without re-reading the local queue.
    async fn pairing_loop(
        self: Arc<Self>,
        local_rx: Arc<Mutex<mpsc::Receiver<LocalPending>>>,
        tunnel_rx: Arc<Mutex<mpsc::Receiver<TcpStream>>>,
        cancel: CancellationToken,
    ) {
        loop {
            let pending = tokio::select! {
                _ = cancel.cancelled() => return,
                pending = async { local_rx.lock().await.recv().await } => match pending {
                    Some(pending) => pending,
                    None => return,
                },
            };
            let LocalPending { conn, target, port } = pending;
            let tag = conn.tag();

            loop {
                let mut tunnel = tokio::select! {
                    _ = cancel.cancelled() => return,
                    tunnel = async { tunnel_rx.lock().await.recv().await } => match tunnel {
                        Some(tunnel) => tunnel,
                        None => return,
                    },
                };

                if let Err(e) = protocol::send_tagged_string(&mut tunnel, &target, tag).await {
                    error!(error = %e, "failed to forward target address, dropping tunnel connection");
                    continue;
                }

                match conn {
                    PendingConn::Tcp(user) => {
                        tokio::spawn(relay::pipe_conns(
                            user,
                            tunnel,
                            self.usage(),
                            port,
                            cancel.clone(),
                        ));
                    }
                    PendingConn::Udp(udp) => {
                        tokio::spawn(relay::pipe_udp_server(
                            tunnel,
                            udp.from_user,
                            udp.socket,
                            udp.peer,
                            self.usage(),
                            port,
                            UDP_SESSION_IDLE,
                            cancel.clone(),
                        ));
                    }
                }
                break;
            }
        }
    }
}

impl ServerEndpoint for TcpServer {
    fn restart_lock(&self) -> &Mutex<()> {
        &self.restart_lock
    }

    fn heartbeat(&self) -> Duration {
        self.config.heartbeat()
    }
}

#[async_trait]
impl Endpoint for TcpServer {
    async fn run(self: Arc<Self>) {
        loop {
            let cycle = self.parent.child_token();
            if let Err(e) = Arc::clone(&self).run_cycle(cycle.clone()).await {
                error!(error = %e, "server cycle failed");
            }
            cycle.cancel();

            if self.parent.is_cancelled() {
                return;
            }
            tokio::time::sleep(RESTART_DELAY).await;
        }
    }
}
