//! Mux pool client
//!
//! Same pool mechanics as the non-mux client, but each tunnel connection
//! becomes a stream-multiplexed session with the server on the opening side.
//! The dialer parks until the first stream arrives, then demultiplexes: one
//! task per accepted stream dials the local service and runs the copier.

use super::{
    channel_handler, establish_control, pool_maintainer, PoolClient, PoolState, RESTART_DELAY,
};
use crate::config::ClientConfig;
use crate::monitor::Usage;
use crate::mux::{MuxSession, MuxStream, SessionRole};
use crate::protocol::Signal;
use crate::relay;
use crate::transport;
use crate::{Endpoint, Error, Result};
use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Mux transport client
pub struct MuxClient {
    config: ClientConfig,
    parent: CancellationToken,
    restart_lock: Mutex<()>,
    state: PoolState,
    usage: Arc<Usage>,
}

impl MuxClient {
    pub fn new(config: ClientConfig, parent: CancellationToken) -> Result<Arc<Self>> {
        config
            .mux
            .session_config()
            .validate()
            .map_err(Error::Mux)?;
        Ok(Arc::new(Self {
            config,
            parent,
            restart_lock: Mutex::new(()),
            state: PoolState::default(),
            usage: Usage::new(),
        }))
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

    /// Dial one tunnel connection and serve it as a mux session until the
    /// server retires it. The connection counts as pooled until the first
    /// stream arrives.
    async fn tunnel_dialer(self: Arc<Self>, cancel: CancellationToken) {
        debug!(remote = %self.config.remote_addr, "initiating new session with tunnel server");

        let conn = match transport::dial(
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

        let mut session = MuxSession::new(
            conn,
            self.config.mux.session_config(),
            SessionRole::Acceptor,
            cancel.clone(),
        );

        self.state.pool_inflight.fetch_add(1, Ordering::Relaxed);
        let mut pooled = true;

        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => None,
                stream = session.accept_stream() => stream,
            };

            if pooled {
                self.state.pool_inflight.fetch_sub(1, Ordering::Relaxed);
                pooled = false;
            }

            let Some(stream) = stream else {
                debug!("mux session ended");
                return;
            };

            tokio::spawn(Arc::clone(&self).handle_stream(stream, cancel.clone()));
        }
    }

    /// One accepted stream: resolve the forwarded target, dial the local
    /// service, and copy until either end closes.
    async fn handle_stream(self: Arc<Self>, stream: MuxStream, cancel: CancellationToken) {
        if stream.tag() != Signal::Tcp {
            warn!(tag = ?stream.tag(), "unexpected stream tag, closing");
            stream.close().await;
            return;
        }

        let (port, target) = match transport::resolve_remote_addr(stream.target()) {
            Ok(resolved) => resolved,
            Err(e) => {
                info!(error = %e, "failed to resolve remote port");
                stream.close().await;
                return;
            }
        };

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
                stream.close().await;
                return;
            }
        };

        debug!(%target, "connected to local service successfully");
        relay::pipe_stream(stream, local, self.usage(), port, cancel).await;
    }
}

impl PoolClient for MuxClient {
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
impl Endpoint for MuxClient {
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
