//! Frontend counters.
//!
//! Aggregates only: no addresses, targets or usernames are retained.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::endpoint::Side;

/// Atomic counters shared by a frontend's accept loop and relay tasks.
pub struct ProxyStats {
    start_time: Instant,
    /// Connections accepted on the listening socket
    accepted: AtomicU64,
    /// Connections currently relaying or negotiating
    active: AtomicU64,
    /// SOCKS or TLS handshakes that failed
    handshake_failures: AtomicU64,
    /// Outbound dials that failed or timed out
    dial_failures: AtomicU64,
    /// Bytes relayed from the client leg to the bridge leg
    bytes_to_bridge: AtomicU64,
    /// Bytes relayed from the bridge leg to the client leg
    bytes_to_client: AtomicU64,
}

/// Point-in-time copy of [`ProxyStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Seconds since the frontend started
    pub uptime_secs: u64,
    /// Connections accepted
    pub accepted: u64,
    /// Connections in flight
    pub active: u64,
    /// Failed handshakes
    pub handshake_failures: u64,
    /// Failed dials
    pub dial_failures: u64,
    /// Client to bridge bytes
    pub bytes_to_bridge: u64,
    /// Bridge to client bytes
    pub bytes_to_client: u64,
}

impl ProxyStats {
    /// Zeroed counters.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            accepted: AtomicU64::new(0),
            active: AtomicU64::new(0),
            handshake_failures: AtomicU64::new(0),
            dial_failures: AtomicU64::new(0),
            bytes_to_bridge: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
        }
    }

    /// Count an accepted connection.
    pub fn connection_opened(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a connection leaving the frontend.
    pub fn connection_closed(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Count a failed SOCKS or TLS handshake.
    pub fn handshake_failed(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed outbound dial.
    pub fn dial_failed(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count `bytes` relayed into `to`.
    pub fn add_relayed(&self, to: Side, bytes: usize) {
        let counter = match to {
            Side::Bridge => &self.bytes_to_bridge,
            Side::Client => &self.bytes_to_client,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Current values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            bytes_to_bridge: self.bytes_to_bridge.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
        }
    }
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "uptime={}s accepted={} active={} handshake_failures={} dial_failures={} \
             to_bridge={}B to_client={}B",
            self.uptime_secs,
            self.accepted,
            self.active,
            self.handshake_failures,
            self.dial_failures,
            self.bytes_to_bridge,
            self.bytes_to_client,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ProxyStats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        stats.handshake_failed();
        stats.dial_failed();
        stats.add_relayed(Side::Bridge, 100);
        stats.add_relayed(Side::Client, 40);

        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 2);
        assert_eq!(snap.active, 1);
        assert_eq!(snap.handshake_failures, 1);
        assert_eq!(snap.dial_failures, 1);
        assert_eq!(snap.bytes_to_bridge, 100);
        assert_eq!(snap.bytes_to_client, 40);
    }

    #[test]
    fn test_active_never_underflows() {
        let stats = ProxyStats::new();
        stats.connection_closed();
        assert_eq!(stats.snapshot().active, 0);
    }

    #[test]
    fn test_display() {
        let shown = StatsSnapshot {
            accepted: 3,
            ..Default::default()
        }
        .to_string();
        assert!(shown.contains("accepted=3"));
    }
}
