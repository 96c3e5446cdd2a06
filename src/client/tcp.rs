//! Non-mux pool client
//!
//! Each tunnel-dial task parks one pre-dialed connection at the server and
//! blocks on the tagged target-address frame. Receiving it means the server
//! has paired this connection with user traffic: dial the local service and
//! start the copier.

use super::{
    channel_handler, establish_control, pool_maintainer, PoolClient, PoolState, RESTART_DELAY,
    UDP_SESSION_IDLE,
};
use crate::config::ClientConfig;
use crate::monitor::Usage;
use crate::protocol::{self, Signal};
use crate::relay;
use crate::transport;
use crate::{Endpoint, Result};
use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// TCP transport client
pub struct TcpClient {
    config: ClientConfig,
    parent: CancellationToken,
    restart_lock: Mutex<()>,
    state: PoolState,
    usage: Arc<Usage>,
}

impl TcpClient {
    pub fn new(config: ClientConfig, parent: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            config,
            parent,
            restart_lock: Mutex::new(()),
            state: PoolState::default(),
            usage: Usage::new(),
        })
    }

    pub fn usage(&self) -> Arc<Usage> {
        Arc::clone(&self.usage)
    }

    pub fn pool_state(&self) -> &PoolState {
        &self.state
    }

    async fn run_cycle(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let Some(channel) = establish_control(&self.config, &cancel).await else {
            return Ok(());
        };

        self.state.reset(self.config.conn_pool_size);
        let (shrink_tx, shrink_rx) = mpsc::channel::<()>(1);

        tokio::spawn(pool_maintainer(
            Arc::clone(&self),
            shrink_tx,
            cancel.clone(),
        ));
        tokio::spawn(channel_handler(
            Arc::clone(&self),
            channel,
            shrink_rx,
            cancel.clone(),
        ));

        cancel.cancelled().await;
        Ok(())
    }

    /// Dial the tunnel endpoint, wait pooled until the server forwards a
    /// target address, then connect the two ends. No retry; the pool sizer
    /// replaces lost connections.
    async fn tunnel_dialer(self: Arc<Self>, cancel: CancellationToken) {
        debug!(remote = %self.config.remote_addr, "initiating new connection to tunnel server");

        let mut conn = match transport::dial(
            &self.config.remote_addr,
            self.config.dial_timeout(),
            self.config.keepalive(),
            self.config.nodelay,
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "failed to dial tunnel server");
                return;
            }
        };

        self.state.pool_inflight.fetch_add(1, Ordering::Relaxed);

        // Pooled until this read completes; that is the pairing moment
        let received = tokio::select! {
            _ = cancel.cancelled() => None,
            res = protocol::recv_tagged_string(&mut conn) => Some(res),
        };

        self.state.pool_inflight.fetch_sub(1, Ordering::Relaxed);

        let (tag, target_raw) = match received {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!(error = %e, "failed to receive target address from tunnel connection");
                return;
            }
            None => return,
        };

        let (port, target) = match transport::resolve_remote_addr(&target_raw) {
            Ok(resolved) => resolved,
            Err(e) => {
                info!(error = %e, "failed to resolve remote port");
                return;
            }
        };

        match tag {
            Signal::Tcp => self.local_dialer(conn, target, port, cancel).await,
            Signal::Udp => self.local_udp(conn, target, port, cancel).await,
            other => {
                warn!(?other, "unexpected tag on tunnel connection, dropping");
            }
        }
    }

    async fn local_dialer(
        self: Arc<Self>,
        tunnel: TcpStream,
        target: String,
        port: u16,
        cancel: CancellationToken,
    ) {
        let local = match transport::dial(
            &target,
            self.config.dial_timeout(),
            self.config.keepalive(),
            self.config.nodelay,
        )
        .await
        {
            Ok(local) => local,
            Err(e) => {
                error!(%target, error = %e, "failed to connect to local service");
                return;
            }
        };

        debug!(%target, "connected to local service successfully");
        relay::pipe_conns(tunnel, local, self.usage(), port, cancel).await;
    }

    async fn local_udp(
        self: Arc<Self>,
        tunnel: TcpStream,
        target: String,
        port: u16,
        cancel: CancellationToken,
    ) {
        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(e) => {
                error!(error = %e, "failed to bind local udp socket");
                return;
            }
        };
        if let Err(e) = socket.connect(&target).await {
            error!(%target, error = %e, "failed to connect local udp socket");
            return;
        }

        debug!(%target, "connected to local udp service");
        relay::pipe_udp_client(tunnel, socket, self.usage(), port, UDP_SESSION_IDLE, cancel).await;
    }
}

impl PoolClient for TcpClient {
    fn state(&self) -> &PoolState {
        &self.state
    }

    fn pool_floor(&self) -> usize {
        self.config.conn_pool_size
    }

    fn restart_lock(&self) -> &Mutex<()> {
        &self.restart_lock
    }

    fn spawn_tunnel_dialer(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(self.tunnel_dialer(cancel));
    }
}

#[async_trait]
impl Endpoint for TcpClient {
    async fn run(self: Arc<Self>) {
        loop {
            let cycle = self.parent.child_token();
            if let Err(e) = Arc::clone(&self).run_cycle(cycle.clone()).await {
                error!(error = %e, "client cycle failed");
            }
            cycle.cancel();

            if self.parent.is_cancelled() {
                return;
            }
            tokio::time::sleep(RESTART_DELAY).await;
        }
    }
}
