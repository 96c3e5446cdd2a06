//! Mux server dispatcher
//!
//! Tunnel connections are wrapped as stream-multiplexed sessions; each
//! pairing worker drives one session at a time, opening a stream per parked
//! user connection. A session retires once it has opened its stream budget
//! (or on the first open failure), the worker requests a replacement, and
//! the retired session is closed in the background after its streams drain.

use super::{
    await_control, channel_handler, local_listener, pairing_workers, vet_tunnel_conn,
    LocalPending, PendingConn, ServerEndpoint, RESTART_DELAY,
};
use crate::config::ServerConfig;
use crate::monitor::Usage;
use crate::mux::{MuxSession, SessionRole};
use crate::relay;
use crate::transport::{parse_port_mappings, PortMapping};
use crate::{Endpoint, Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Mux transport server
pub struct MuxServer {
    config: ServerConfig,
    mappings: Vec<PortMapping>,
    parent: CancellationToken,
    restart_lock: Mutex<()>,
    usage: Arc<Usage>,
}

impl MuxServer {
    pub fn new(config: ServerConfig, parent: CancellationToken) -> Result<Arc<Self>> {
        config
            .mux
            .session_config()
            .validate()
            .map_err(Error::Mux)?;
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

        let (session_tx, session_rx) = mpsc::channel::<MuxSession>(self.config.channel_size);
        let (local_tx, local_rx) = mpsc::channel::<LocalPending>(self.config.channel_size);
        let (req_tx, req_rx) = mpsc::channel::<()>(self.config.channel_size);

        tokio::spawn(Arc::clone(&self).accept_session_loop(
            listener,
            session_tx,
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
        let session_rx = Arc::new(Mutex::new(session_rx));
        for _ in 0..workers {
            tokio::spawn(Arc::clone(&self).pairing_loop(
                Arc::clone(&local_rx),
                Arc::clone(&session_rx),
                local_tx.clone(),
                req_tx.clone(),
                cancel.clone(),
            ));
        }

        cancel.cancelled().await;
        Ok(())
    }

    /// Accept tunnel connections and wrap each as a mux session with this
    /// side opening streams.
    async fn accept_session_loop(
        self: Arc<Self>,
        listener: TcpListener,
        session_tx: mpsc::Sender<MuxSession>,
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

            let session = MuxSession::new(
                conn,
                self.config.mux.session_config(),
                SessionRole::Opener,
                cancel.clone(),
            );

            match session_tx.try_send(session) {
                Ok(()) => debug!(%peer, "mux session queued"),
                Err(TrySendError::Full(session)) => {
                    warn!(%peer, "session queue is full, discarding connection");
                    session.close().await;
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }

    /// Each worker drives one session at a time and picks up the next as
    /// soon as the current one stops accepting new streams.
    async fn pairing_loop(
        self: Arc<Self>,
        local_rx: Arc<Mutex<mpsc::Receiver<LocalPending>>>,
        session_rx: Arc<Mutex<mpsc::Receiver<MuxSession>>>,
        local_tx: mpsc::Sender<LocalPending>,
        req_tx: mpsc::Sender<()>,
        cancel: CancellationToken,
    ) {
        loop {
            let session = tokio::select! {
                _ = cancel.cancelled() => return,
                session = async { session_rx.lock().await.recv().await } => match session {
                    Some(session) => session,
                    None => return,
                },
            };

            Arc::clone(&self)
                .drive_session(session, &local_rx, &local_tx, &req_tx, &cancel)
                .await;
        }
    }

    /// Open one stream per parked user connection until the session's stream
    /// budget is spent or an open fails. Either way the session is closed in
    /// the background once its streams finish, and a replacement is
    /// requested.
    async fn drive_session(
        self: Arc<Self>,
        session: MuxSession,
        local_rx: &Arc<Mutex<mpsc::Receiver<LocalPending>>>,
        local_tx: &mpsc::Sender<LocalPending>,
        req_tx: &mpsc::Sender<()>,
        cancel: &CancellationToken,
    ) {
        let mux_con = self.config.mux.mux_con;
        let mut handles = Vec::with_capacity(mux_con);
        let mut opened = 0usize;

        while opened < mux_con {
            let pending = tokio::select! {
                _ = cancel.cancelled() => break,
                pending = async { local_rx.lock().await.recv().await } => match pending {
                    Some(pending) => pending,
                    None => break,
                },
            };

            let tag = pending.conn.tag();
            match session.open_stream(tag, &pending.target).await {
                Ok(stream) => {
                    let PendingConn::Tcp(user) = pending.conn else {
                        // UDP never rides the mux transport
                        warn!("dropping udp session on mux transport");
                        stream.close().await;
                        continue;
                    };
                    handles.push(tokio::spawn(relay::pipe_stream(
                        stream,
                        user,
                        self.usage(),
                        pending.port,
                        cancel.clone(),
                    )));
                    opened += 1;
                }
                Err(e) => {
                    error!(error = %e, "failed to open stream, retiring session");
                    // Hand the connection back; the send must stay
                    // cancellable or shutdown could wedge on a full queue
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = local_tx.send(pending) => {}
                    }
                    break;
                }
            }
        }

        if req_tx.try_send(()).is_err() {
            warn!("request new connection channel is full");
        }

        // Close after the remaining streams drain; the worker moves on
        tokio::spawn(async move {
            for handle in handles {
                let _ = handle.await;
            }
            session.close().await;
        });
    }
}

impl ServerEndpoint for MuxServer {
    fn restart_lock(&self) -> &Mutex<()> {
        &self.restart_lock
    }

    fn heartbeat(&self) -> Duration {
        self.config.heartbeat()
    }
}

#[async_trait]
impl Endpoint for MuxServer {
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
