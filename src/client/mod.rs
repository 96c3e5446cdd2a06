//! Client-side tunnel pool
//!
//! The client dials the server's tunnel endpoint: once for the control
//! channel, then repeatedly for data connections that wait pre-warmed until
//! the server pairs them with user traffic. An adaptive sizer keeps roughly
//! `load / 5` connections in flight (about 200 ms of headroom at steady
//! state) and never fewer than the configured floor.

pub mod tcp;
pub mod tcpmux;

pub use tcp::TcpClient;
pub use tcpmux::MuxClient;

use crate::config::ClientConfig;
use crate::control::{self, ControlChannel, ControlError};
use crate::protocol::{self, Signal};
use crate::transport;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Drain period between cancelling a cycle and starting the next one.
pub(crate) const RESTART_DELAY: Duration = Duration::from_secs(2);

/// Sampling tick for the pool gauge.
const POOL_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Window over which the sizer averages load and pool occupancy.
const POOL_WINDOW: Duration = Duration::from_secs(60);
const POOL_WINDOW_SECS: i64 = 60;

/// Expiry for quiet UDP sessions.
pub(crate) const UDP_SESSION_IDLE: Duration = Duration::from_secs(120);

/// Shared pool gauges.
///
/// `pool_inflight` counts tunnel connections dialed but not yet consumed by
/// the server; `load_observed` counts `REQ_CHAN` signals in the current
/// window; `pool_size` is the adaptive target, floored at the configured
/// minimum.
#[derive(Debug, Default)]
pub struct PoolState {
    pub pool_inflight: AtomicI32,
    pub load_observed: AtomicI32,
    pub pool_size: AtomicUsize,
}

impl PoolState {
    fn reset(&self, floor: usize) {
        self.pool_inflight.store(0, Ordering::Relaxed);
        self.load_observed.store(0, Ordering::Relaxed);
        self.pool_size.store(floor, Ordering::Relaxed);
    }
}

/// What the sizer should do at the close of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolAdjustment {
    Grow,
    Shrink,
    Hold,
}

/// Pure sizing rule: grow when a fifth of the average load exceeds the
/// average pool, shrink (above the floor) when a quarter of it is still
/// below. The gap between the two thresholds damps oscillation.
pub(crate) fn adjust_pool(
    avg_load: i64,
    avg_pool: i64,
    pool_size: usize,
    floor: usize,
) -> PoolAdjustment {
    if (avg_load + 4) / 5 > avg_pool {
        PoolAdjustment::Grow
    } else if (avg_load + 3) / 4 < avg_pool && pool_size > floor {
        PoolAdjustment::Shrink
    } else {
        PoolAdjustment::Hold
    }
}

/// Hooks the shared client tasks need from a concrete pool client.
pub(crate) trait PoolClient: Send + Sync + 'static {
    fn state(&self) -> &PoolState;
    fn pool_floor(&self) -> usize;
    fn restart_lock(&self) -> &Mutex<()>;
    /// Start one tunnel-dial task.
    fn spawn_tunnel_dialer(self: Arc<Self>, cancel: CancellationToken);
}

/// Idempotent restart request, mirroring the server side: cancel the cycle
/// under the restart mutex and let the supervisor loop rebuild.
pub(crate) async fn restart<C: PoolClient>(client: &C, cancel: &CancellationToken) {
    let Ok(_guard) = client.restart_lock().try_lock() else {
        warn!("client is already restarting");
        return;
    };
    info!("restarting client...");
    cancel.cancel();
}

/// Dial and authenticate the control channel, backing off `retry_interval`
/// after every failure, forever. `None` only on cancellation.
pub(crate) async fn establish_control(
    config: &ClientConfig,
    cancel: &CancellationToken,
) -> Option<ControlChannel> {
    info!("attempting to establish a new control channel connection...");

    loop {
        if cancel.is_cancelled() {
            return None;
        }

        let mut conn = match transport::dial(
            &config.remote_addr,
            config.dial_timeout(),
            config.keepalive(),
            config.nodelay,
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => {
                error!(remote = %config.remote_addr, error = %e, "channel dialer: dial failed");
                if sleep_cancellable(config.retry_interval(), cancel).await {
                    return None;
                }
                continue;
            }
        };

        match control::client_handshake(&mut conn, &config.token).await {
            Ok(()) => {
                info!("control channel established successfully");
                match ControlChannel::new(conn) {
                    Ok(channel) => return Some(channel),
                    Err(e) => {
                        error!(error = %e, "failed to split control channel");
                        continue;
                    }
                }
            }
            Err(ControlError::HandshakeTimeout) => {
                warn!("timeout while waiting for control channel response");
            }
            Err(ControlError::TokenMismatch) => {
                error!("invalid security token, retrying...");
            }
            Err(e) => {
                error!(error = %e, "failed to receive control channel response");
            }
        }

        if sleep_cancellable(config.retry_interval(), cancel).await {
            return None;
        }
    }
}

/// Returns true if cancelled while sleeping.
async fn sleep_cancellable(period: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(period) => false,
    }
}

/// Adaptive pool sizer: fill the pool to the floor, sample occupancy every
/// second, and close a sizing window every 60 seconds.
pub(crate) async fn pool_maintainer<C: PoolClient>(
    client: Arc<C>,
    shrink_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    for _ in 0..client.pool_floor() {
        Arc::clone(&client).spawn_tunnel_dialer(cancel.clone());
    }

    let start = tokio::time::Instant::now();
    let mut sample = tokio::time::interval_at(start + POOL_SAMPLE_INTERVAL, POOL_SAMPLE_INTERVAL);
    let mut window = tokio::time::interval_at(start + POOL_WINDOW, POOL_WINDOW);

    let mut pool_sum: i64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            _ = sample.tick() => {
                pool_sum += client.state().pool_inflight.load(Ordering::Relaxed) as i64;
            }

            _ = window.tick() => {
                let state = client.state();
                let load = state.load_observed.swap(0, Ordering::Relaxed) as i64;
                let avg_load = (load + POOL_WINDOW_SECS - 1) / POOL_WINDOW_SECS;
                let avg_pool = (pool_sum + POOL_WINDOW_SECS - 1) / POOL_WINDOW_SECS;
                pool_sum = 0;

                let pool_size = state.pool_size.load(Ordering::Relaxed);
                match adjust_pool(avg_load, avg_pool, pool_size, client.pool_floor()) {
                    PoolAdjustment::Grow => {
                        info!(
                            from = pool_size,
                            to = pool_size + 1,
                            avg_pool,
                            avg_load,
                            "increasing pool size"
                        );
                        state.pool_size.fetch_add(1, Ordering::Relaxed);
                        Arc::clone(&client).spawn_tunnel_dialer(cancel.clone());
                    }
                    PoolAdjustment::Shrink => {
                        info!(from = pool_size, to = pool_size - 1, "decreasing pool size");
                        state.pool_size.fetch_sub(1, Ordering::Relaxed);
                        // Capacity-1 channel; a pending token already
                        // coalesces the shrink
                        let _ = shrink_tx.try_send(());
                    }
                    PoolAdjustment::Hold => {}
                }
            }
        }
    }
}

/// Control-channel steady state, client side: dispatch signals from the
/// server. `REQ_CHAN` spawns a tunnel dialer unless a shrink token elides
/// it; read errors, unexpected signals, and peer `CLOSED` trigger restart.
pub(crate) async fn channel_handler<C: PoolClient>(
    client: Arc<C>,
    channel: ControlChannel,
    mut shrink_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    let ControlChannel {
        mut read,
        mut write,
        ..
    } = channel;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = protocol::send_signal(&mut write, Signal::Closed).await;
                return;
            }

            res = protocol::recv_signal(&mut read) => match res {
                Ok(Signal::ReqChan) => {
                    client.state().load_observed.fetch_add(1, Ordering::Relaxed);
                    if shrink_rx.try_recv().is_ok() {
                        debug!("pool shrink pending, skipping tunnel dialer");
                    } else {
                        debug!("channel signal received, initiating tunnel dialer");
                        Arc::clone(&client).spawn_tunnel_dialer(cancel.clone());
                    }
                }
                Ok(Signal::Heartbeat) => {
                    debug!("heartbeat signal received successfully");
                }
                Ok(Signal::Closed) => {
                    info!("control channel has been closed by the server");
                    restart(&*client, &cancel).await;
                    return;
                }
                Ok(signal) => {
                    error!(?signal, "unexpected signal on control channel, restarting client...");
                    restart(&*client, &cancel).await;
                    return;
                }
                Err(e) => {
                    error!(error = %e, "failed to read channel signal, restarting client");
                    restart(&*client, &cancel).await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjust_pool_grows_under_load() {
        // avg_load 50 → target ceil(50/5) = 10 > avg_pool 4
        assert_eq!(adjust_pool(50, 4, 4, 1), PoolAdjustment::Grow);
    }

    #[test]
    fn test_adjust_pool_holds_in_tolerance_band() {
        // ceil(16/5) = 4 is not > 4, ceil(16/4) = 4 is not < 4
        assert_eq!(adjust_pool(16, 4, 4, 1), PoolAdjustment::Hold);
    }

    #[test]
    fn test_adjust_pool_shrinks_when_idle() {
        // ceil(4/4) = 1 < avg_pool 5
        assert_eq!(adjust_pool(4, 5, 6, 2), PoolAdjustment::Shrink);
    }

    #[test]
    fn test_adjust_pool_never_shrinks_below_floor() {
        assert_eq!(adjust_pool(0, 5, 4, 4), PoolAdjustment::Hold);
        assert_eq!(adjust_pool(0, 5, 5, 4), PoolAdjustment::Shrink);
    }

    #[test]
    fn test_adjust_pool_converges_on_steady_load() {
        // Steady 50 req/s should settle the pool near ceil(50/5) = 10
        let floor = 1;
        let mut pool_size = floor;
        for _ in 0..20 {
            match adjust_pool(50, pool_size as i64, pool_size, floor) {
                PoolAdjustment::Grow => pool_size += 1,
                PoolAdjustment::Shrink => pool_size -= 1,
                PoolAdjustment::Hold => break,
            }
        }
        assert_eq!(pool_size, 10);
    }

    #[test]
    fn test_pool_state_reset() {
        let state = PoolState::default();
        state.pool_inflight.store(7, Ordering::Relaxed);
        state.load_observed.store(3, Ordering::Relaxed);

        state.reset(4);
        assert_eq!(state.pool_inflight.load(Ordering::Relaxed), 0);
        assert_eq!(state.load_observed.load(Ordering::Relaxed), 0);
        assert_eq!(state.pool_size.load(Ordering::Relaxed), 4);
    }
}
