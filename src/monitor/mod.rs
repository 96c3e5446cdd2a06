//! Per-port traffic accounting
//!
//! Every byte the copiers move is attributed to the public-facing port it
//! entered through. The store is a plain concurrent map exposed as a
//! snapshot API plus an optional periodic debug report; dashboards can sit
//! on top of it.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Concurrent per-port byte counters.
#[derive(Debug, Default)]
pub struct Usage {
    ports: DashMap<u16, u64>,
}

impl Usage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add bytes to a port's counter. Both directions of a connection are
    /// summed under the same public port.
    pub fn record(&self, port: u16, bytes: u64) {
        *self.ports.entry(port).or_insert(0) += bytes;
    }

    /// Bytes observed for one port.
    pub fn port_total(&self, port: u16) -> u64 {
        self.ports.get(&port).map(|v| *v).unwrap_or(0)
    }

    /// Bytes observed across all ports.
    pub fn total(&self) -> u64 {
        self.ports.iter().map(|e| *e.value()).sum()
    }

    /// Current counters, sorted by port.
    pub fn snapshot(&self) -> Vec<(u16, u64)> {
        let mut entries: Vec<_> = self.ports.iter().map(|e| (*e.key(), *e.value())).collect();
        entries.sort_unstable_by_key(|(port, _)| *port);
        entries
    }

    /// Log a usage summary at a fixed interval until cancelled.
    pub async fn report_loop(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    for (port, bytes) in self.snapshot() {
                        debug!(port, bytes, "traffic usage");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_totals() {
        let usage = Usage::new();

        usage.record(8080, 100);
        usage.record(8080, 50);
        usage.record(443, 7);

        assert_eq!(usage.port_total(8080), 150);
        assert_eq!(usage.port_total(443), 7);
        assert_eq!(usage.port_total(9999), 0);
        assert_eq!(usage.total(), 157);
    }

    #[test]
    fn test_snapshot_sorted() {
        let usage = Usage::new();
        usage.record(9000, 1);
        usage.record(80, 2);
        usage.record(443, 3);

        let snap = usage.snapshot();
        assert_eq!(snap, vec![(80, 2), (443, 3), (9000, 1)]);
    }

    #[test]
    fn test_concurrent_record() {
        let usage = Usage::new();
        std::thread::scope(|s| {
            for _ in 0..4 {
                let usage = Arc::clone(&usage);
                s.spawn(move || {
                    for _ in 0..1000 {
                        usage.record(8080, 1);
                    }
                });
            }
        });
        assert_eq!(usage.port_total(8080), 4000);
    }
}
