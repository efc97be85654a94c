//! Bidirectional relay between the two legs of an endpoint.
//!
//! Each direction runs its own forwarding loop, so a peer that stops reading
//! only stalls the direction writing to it:
//!
//! ```text
//!  forward(from), for client => bridge and bridge => client:
//!    endpoint detached?            -> exit, legs untouched
//!    wait: from readable | idle tick
//!      readable -> drain from => peer until from would block
//!      idle     -> reclaim zombies; a sink emits chaff towards the bridge
//! ```
//!
//! Bytes only move through the [`TrafficShaper`]. Each leg has exactly one
//! writer. A `Closed` from either leg ends the relay; teardown is left to the
//! caller.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use super::registry::ConnectionRegistry;
use super::stats::ProxyStats;
use crate::endpoint::{DuplexEndpoint, Side, Transfer};
use crate::obfuscation::TrafficShaper;

/// Upper bound on a readiness wait, so idle relays still reclaim zombies.
pub const RELAY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Read buffer per direction.
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Reads per wakeup before the direction yields to other tasks.
const PUMP_BURST: usize = 32;

/// Why a relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// The given leg closed or failed
    Closed(Side),
    /// The endpoint was removed from the registry by its owner
    Detached,
}

enum Drained {
    /// Source would block
    Idle,
    /// Burst used up; TLS or shaper buffers may still hold data
    More,
}

/// Everything a relay task needs besides the endpoint.
#[derive(Clone)]
pub struct RelayContext {
    /// Live/zombie sets of the owning frontend
    pub registry: Arc<ConnectionRegistry>,
    /// Byte transfer surface
    pub shaper: Arc<dyn TrafficShaper>,
    /// Counters of the owning frontend
    pub stats: Arc<ProxyStats>,
}

impl RelayContext {
    /// Fresh registry and counters around `shaper`.
    pub fn new(shaper: Arc<dyn TrafficShaper>) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            shaper,
            stats: Arc::new(ProxyStats::new()),
        }
    }

    /// Relay `ep` until a leg closes, then shut both legs down. A detached
    /// endpoint is handed back to its owner untouched.
    pub async fn run(&self, ep: Arc<DuplexEndpoint>) -> RelayExit {
        let exit = relay(&ep, self).await;
        match exit {
            RelayExit::Closed(side) => {
                tracing::debug!(id = ep.id(), "{} leg closed, tearing down", side);
                self.registry.shutdown_connection(&ep);
            }
            RelayExit::Detached => {
                tracing::debug!(id = ep.id(), "endpoint detached from relay");
            }
        }
        exit
    }
}

/// Relay `ep` until a leg closes or the endpoint is detached.
pub async fn relay(ep: &DuplexEndpoint, ctx: &RelayContext) -> RelayExit {
    tokio::select! {
        exit = forward(ep, ctx, Side::Client) => exit,
        exit = forward(ep, ctx, Side::Bridge) => exit,
    }
}

/// Forward everything read from `from` to its peer.
async fn forward(ep: &DuplexEndpoint, ctx: &RelayContext, from: Side) -> RelayExit {
    let to = from.peer();
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut pending = false;

    loop {
        if !ctx.registry.is_live(ep.id()) {
            return RelayExit::Detached;
        }

        if pending {
            tokio::task::yield_now().await;
        } else {
            // Only the client => bridge direction writes chaff, keeping the
            // bridge leg single-writer.
            let chaff = ep.is_sink() && to == Side::Bridge;
            let idle = match ctx.shaper.pacing_delay(Side::Bridge) {
                Some(delay) if chaff => delay,
                _ => RELAY_POLL_INTERVAL,
            };

            tokio::select! {
                res = ep.readable(from) => {
                    if let Err(e) = res {
                        tracing::trace!(id = ep.id(), "{} readiness failed: {}", from, e);
                        return RelayExit::Closed(from);
                    }
                }
                _ = sleep(idle) => {
                    ctx.registry.reclaim_zombies();
                    if chaff {
                        if let Transfer::Closed = ctx.shaper.write_chaff(ep, Side::Bridge) {
                            return RelayExit::Closed(Side::Bridge);
                        }
                    }
                    continue;
                }
            }
        }

        match pump(ep, ctx, from, &mut buf).await {
            Ok(Drained::Idle) => pending = false,
            Ok(Drained::More) => pending = true,
            Err(closed) => return RelayExit::Closed(closed),
        }
    }
}

/// Move bytes from `from` to its peer until `from` would block or the burst
/// is used up.
async fn pump(
    ep: &DuplexEndpoint,
    ctx: &RelayContext,
    from: Side,
    buf: &mut [u8],
) -> Result<Drained, Side> {
    let to = from.peer();

    for _ in 0..PUMP_BURST {
        let n = match ctx.shaper.read_msg(ep, from, buf) {
            Transfer::Pending | Transfer::Bytes(0) => return Ok(Drained::Idle),
            Transfer::Closed => return Err(from),
            Transfer::Bytes(n) => n,
        };

        if ep.is_sink() && !ep.is_connected(to) {
            tracing::trace!(id = ep.id(), "discarded {} bytes from {}", n, from);
            continue;
        }

        write_all(ep, ctx.shaper.as_ref(), to, &buf[..n])
            .await
            .map_err(|_| to)?;
        ctx.stats.add_relayed(to, n);
    }
    Ok(Drained::More)
}

/// Write all of `data` to `to`, waiting for writability and pacing between
/// frames as the shaper asks.
async fn write_all(
    ep: &DuplexEndpoint,
    shaper: &dyn TrafficShaper,
    to: Side,
    mut data: &[u8],
) -> Result<(), ()> {
    while !data.is_empty() {
        match shaper.write_msg(ep, to, data) {
            Transfer::Bytes(0) | Transfer::Pending => {
                ep.writable(to).await.map_err(|_| ())?;
            }
            Transfer::Bytes(n) => {
                data = &data[n..];
                flush(ep, shaper, to).await?;
                if let Some(delay) = shaper.pacing_delay(to) {
                    sleep(delay).await;
                }
            }
            Transfer::Closed => return Err(()),
        }
    }
    Ok(())
}

async fn flush(ep: &DuplexEndpoint, shaper: &dyn TrafficShaper, side: Side) -> Result<(), ()> {
    loop {
        match shaper.flush(ep, side) {
            Transfer::Bytes(_) => return Ok(()),
            Transfer::Pending => ep.writable(side).await.map_err(|_| ())?,
            Transfer::Closed => return Err(()),
        }
    }
}
