//! Live/zombie endpoint tracking.
//!
//! Every endpoint a frontend relays is either *live* (still being relayed) or
//! a *zombie* (torn down, waiting to be reclaimed). Both sets sit behind one
//! coarse lock. The lock is held only for set membership changes: endpoint I/O
//! and socket shutdown always happen after it has been released.
//!
//! Zombies are reclaimed in batches from relay idle ticks and the accept loop,
//! never while some task still dispatches readiness for them.
//!
//! A live endpoint normally has a client leg. Sink endpoints
//! ([`DuplexEndpoint::prewired`]) are the exception: they hold only a bridge
//! leg, discard what the bridge sends and are torn down when that leg closes.
//! A client endpoint whose client leg was shut down locally also stays live
//! with just its bridge leg until the owner restores or closes it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::endpoint::{DuplexEndpoint, EndpointId, Side};

#[derive(Default)]
struct Members {
    live: HashMap<EndpointId, Arc<DuplexEndpoint>>,
    zombies: HashMap<EndpointId, Arc<DuplexEndpoint>>,
}

/// Membership sets shared by a frontend's accept loop and relay tasks.
#[derive(Default)]
pub struct ConnectionRegistry {
    members: Mutex<Members>,
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new endpoint as live.
    pub fn insert(&self, ep: Arc<DuplexEndpoint>) {
        self.members.lock().live.insert(ep.id(), ep);
    }

    /// Look up a live endpoint.
    pub fn get(&self, id: EndpointId) -> Option<Arc<DuplexEndpoint>> {
        self.members.lock().live.get(&id).cloned()
    }

    /// Whether `id` is still live.
    pub fn is_live(&self, id: EndpointId) -> bool {
        self.members.lock().live.contains_key(&id)
    }

    /// Move `id` from live to zombie. Returns `true` only for the call that
    /// performed the move.
    pub fn mark_zombie(&self, id: EndpointId) -> bool {
        let mut members = self.members.lock();
        match members.live.remove(&id) {
            Some(ep) => {
                members.zombies.insert(id, ep);
                true
            }
            None => false,
        }
    }

    /// Stop tracking `id` without tearing it down; its relay task notices on
    /// the next tick and exits.
    pub fn detach(&self, id: EndpointId) -> Option<Arc<DuplexEndpoint>> {
        self.members.lock().live.remove(&id)
    }

    /// Drop every zombie. Returns how many were reclaimed.
    pub fn reclaim_zombies(&self) -> usize {
        let reclaimed = std::mem::take(&mut self.members.lock().zombies);
        let count = reclaimed.len();
        if count > 0 {
            tracing::trace!("reclaimed {} zombie endpoints", count);
        }
        count
    }

    /// Number of live endpoints.
    pub fn live_count(&self) -> usize {
        self.members.lock().live.len()
    }

    /// Number of zombies awaiting reclamation.
    pub fn zombie_count(&self) -> usize {
        self.members.lock().zombies.len()
    }

    /// Close both legs of `ep` and retire it. Safe to call repeatedly: legs
    /// already closed are skipped and only the first call retires.
    pub fn shutdown_connection(&self, ep: &DuplexEndpoint) -> bool {
        let retired = self.mark_zombie(ep.id());
        let client = ep.shutdown(Side::Client);
        let bridge = ep.shutdown(Side::Bridge);
        if client || bridge {
            tracing::debug!(id = ep.id(), client, bridge, "connection shut down");
        }
        retired
    }

    /// Close only the client leg of `ep`. The endpoint is retired once no
    /// bridge leg remains; a connected bridge leg is left untouched.
    pub fn shutdown_local_connection(&self, ep: &DuplexEndpoint) -> bool {
        let retired = !ep.is_connected(Side::Bridge) && self.mark_zombie(ep.id());
        if ep.shutdown(Side::Client) {
            tracing::debug!(id = ep.id(), "client leg shut down");
        }
        retired
    }
}
