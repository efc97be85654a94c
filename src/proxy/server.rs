//! Bridge-side frontend.
//!
//! Accepts links from client frontends, terminates TLS, and relays each one
//! to the local onion router port. The shaped side of the relay is the client
//! leg, mirroring the client frontend whose shaped side is its bridge leg.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use super::client::{RunMode, Started};
use super::stats::StatsSnapshot;
use super::{bind, dial_tcp, ConnectionRegistry, RelayContext};
use crate::config::BridgeConfig;
use crate::endpoint::{DuplexEndpoint, Side, Transport};
use crate::error::{Error, Result};
use crate::obfuscation::TrafficShaper;
use crate::socks::TargetAddr;
use crate::HANDSHAKE_TIMEOUT_MS;

/// Bridge frontend relaying to the local onion router.
pub struct ProxyServer {
    config: BridgeConfig,
    tls: Option<Arc<ServerConfig>>,
    ctx: RelayContext,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ProxyServer {
    /// Frontend for `config`; `tls` terminates TLS on accepted links.
    pub fn new(config: BridgeConfig, tls: Option<Arc<ServerConfig>>, shaper: Arc<dyn TrafficShaper>) -> Self {
        Self {
            config,
            tls,
            ctx: RelayContext::new(shaper),
            local_addr: Mutex::new(None),
        }
    }

    /// Address the listener is bound to, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Live/zombie sets.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.ctx.registry
    }

    /// Current counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Bind the bridge port and start accepting.
    pub async fn initialize(self: Arc<Self>, mode: RunMode) -> Result<Started> {
        let listener = bind(&self.config.listen_socket()).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        tracing::info!(
            tls = self.tls.is_some(),
            "bridge listening on {}, relaying to onion port {}",
            addr,
            self.config.onion_port
        );

        match mode {
            RunMode::Foreground => {
                self.serve(listener).await?;
                Ok(Started::Completed)
            }
            RunMode::Background => Ok(Started::Background(tokio::spawn(self.serve(listener)))),
        }
    }

    /// Accept loop.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    self.ctx.registry.reclaim_zombies();
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.handle_connection(stream, peer).await });
                }
                Err(e) => {
                    tracing::warn!("accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!("set_nodelay: {}", e);
        }
        self.ctx.stats.connection_opened();

        let client = match self.accept_link(stream).await {
            Ok(client) => client,
            Err(e) => {
                self.ctx.stats.handshake_failed();
                tracing::debug!(peer = %peer, "link handshake failed: {}", e);
                self.ctx.stats.connection_closed();
                return;
            }
        };

        let ep = Arc::new(DuplexEndpoint::new(client));
        self.ctx.registry.insert(Arc::clone(&ep));
        tracing::debug!(id = ep.id(), peer = %peer, "link accepted");

        let onion = TargetAddr::Ipv4(Ipv4Addr::LOCALHOST);
        match dial_tcp(&onion, self.config.onion_port, self.config.connect_timeout()).await {
            Ok(stream) => {
                ep.set_descriptor(Side::Bridge, stream.into());
                self.ctx.run(ep).await;
            }
            Err(e) => {
                self.ctx.stats.dial_failed();
                tracing::warn!(id = ep.id(), "onion router unreachable: {}", e);
                self.ctx.registry.shutdown_connection(&ep);
            }
        }
        self.ctx.stats.connection_closed();
    }

    async fn accept_link(&self, stream: TcpStream) -> Result<Transport> {
        let config = match &self.tls {
            Some(config) => Arc::clone(config),
            None => return Ok(Transport::from(stream)),
        };
        timeout(
            Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
            Transport::accept_tls(stream, config),
        )
        .await
        .map_err(|_| Error::Timeout(HANDSHAKE_TIMEOUT_MS))?
    }
}
