//! Client-side frontend: local SOCKS listener relaying to the bridge.
//!
//! Per accepted connection:
//!
//! 1. wrap the socket in a [`DuplexEndpoint`] and register it live
//! 2. negotiate SOCKS on the client leg
//! 3. dial the bridge (the SOCKS target, or the fixed `bridge_addr` when
//!    `direct_connect` is set), TLS-wrapped when configured
//! 4. reply with the outbound leg's local address, or the mapped failure
//! 5. relay until either leg closes, then tear both down
//!
//! With a pre-established bridge link the frontend skips listening and relays
//! that single link instead.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::relay::{RelayContext, RelayExit};
use super::stats::StatsSnapshot;
use super::{bind, dial_tcp, ConnectionRegistry};
use crate::config::{BridgeTls, ProxyConfig};
use crate::endpoint::{DuplexEndpoint, Side, Transport};
use crate::error::{Error, Result};
use crate::obfuscation::TrafficShaper;
use crate::socks::{v5, SocksEngine, TargetAddr};

/// Where `initialize` runs the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run on the calling task until the frontend stops
    Foreground,
    /// Spawn a task and return once listening
    Background,
}

/// Outcome of [`ProxyClient::initialize`].
#[derive(Debug)]
pub enum Started {
    /// The foreground frontend stopped
    Completed,
    /// The frontend runs on this task
    Background(JoinHandle<Result<()>>),
}

/// Relay of a connection owned by someone else.
#[derive(Debug)]
pub struct ConnHandle {
    endpoint: Arc<DuplexEndpoint>,
    task: JoinHandle<RelayExit>,
}

impl ConnHandle {
    /// Endpoint being relayed.
    pub fn endpoint(&self) -> &Arc<DuplexEndpoint> {
        &self.endpoint
    }

    /// Wait for the relay to stop.
    pub async fn finished(self) -> RelayExit {
        self.task.await.unwrap_or(RelayExit::Closed(Side::Bridge))
    }
}

/// SOCKS4/4a/5 frontend on the client host.
pub struct ProxyClient {
    config: ProxyConfig,
    engine: SocksEngine,
    tls: Option<BridgeTls>,
    ctx: RelayContext,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ProxyClient {
    /// Frontend for `config`, moving bytes through `shaper`.
    pub fn new(config: ProxyConfig, shaper: Arc<dyn TrafficShaper>) -> Self {
        Self {
            engine: config.engine(),
            config,
            tls: None,
            ctx: RelayContext::new(shaper),
            local_addr: Mutex::new(None),
        }
    }

    /// Wrap outbound bridge legs in TLS.
    pub fn with_tls(mut self, tls: Option<BridgeTls>) -> Self {
        self.tls = tls;
        self
    }

    /// Settings this frontend was built from.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Address the listener is bound to, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Live/zombie sets.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.ctx.registry
    }

    /// Transfer surface shared by all relays of this frontend.
    pub fn shaper(&self) -> &Arc<dyn TrafficShaper> {
        &self.ctx.shaper
    }

    /// Current counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Start the frontend.
    ///
    /// Without `bridge`, binds the configured port and accepts SOCKS clients.
    /// With `bridge`, skips listening and relays that pre-established link.
    pub async fn initialize(self: Arc<Self>, bridge: Option<Transport>, mode: RunMode) -> Result<Started> {
        if let Some(bridge) = bridge {
            let handle = self.init_conn_handler(bridge);
            tracing::info!(id = handle.endpoint().id(), "relaying pre-established bridge link");
            return Ok(match mode {
                RunMode::Foreground => {
                    handle.finished().await;
                    Started::Completed
                }
                RunMode::Background => Started::Background(tokio::spawn(async move {
                    handle.finished().await;
                    Ok(())
                })),
            });
        }

        let listener = bind(&self.config.listen_socket()).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        tracing::info!("SOCKS proxy listening on {}", addr);

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
        let ep = Arc::new(DuplexEndpoint::new(stream.into()));
        self.ctx.registry.insert(Arc::clone(&ep));
        self.ctx.stats.connection_opened();
        tracing::debug!(id = ep.id(), peer = %peer, "accepted");

        match self.establish(&ep).await {
            Ok(()) => {
                self.ctx.run(ep).await;
            }
            Err(e) => {
                tracing::debug!(id = ep.id(), peer = %peer, "connection failed: {}", e);
                if ep.is_connected(Side::Bridge) {
                    self.ctx.registry.shutdown_connection(&ep);
                } else {
                    self.ctx.registry.shutdown_local_connection(&ep);
                }
            }
        }
        self.ctx.stats.connection_closed();
    }

    /// Handshake, dial and reply. On success both legs are connected.
    async fn establish(&self, ep: &DuplexEndpoint) -> Result<()> {
        let mut client = ep.stream(Side::Client).ok_or(Error::ConnectionClosed)?;

        // The engine enforces the deadline and sends the stage's rejection.
        let request = match self.engine.negotiate(&mut client).await {
            Ok(request) => request,
            Err(e) => {
                self.ctx.stats.handshake_failed();
                return Err(e);
            }
        };
        tracing::debug!(id = ep.id(), target = %request.target_string(), "CONNECT");

        let outbound = match self.outbound_target(&request.target, request.port) {
            Ok((target, port)) => self.dial(&target, port).await,
            Err(e) => Err(e),
        };

        match outbound {
            Ok(bridge) => {
                ep.set_descriptor(Side::Bridge, bridge);
                let bound = ep.local_addr(Side::Bridge).unwrap_or(v5::UNSPECIFIED);
                self.engine.reply_success(&mut client, &request, bound).await
            }
            Err(e) => {
                self.ctx.stats.dial_failed();
                if let Err(reply_err) = self.engine.reply_failure(&mut client, &request, &e).await {
                    tracing::trace!(id = ep.id(), "failure reply not sent: {}", reply_err);
                }
                Err(e)
            }
        }
    }

    fn outbound_target(&self, target: &TargetAddr, port: u16) -> Result<(TargetAddr, u16)> {
        if self.config.direct_connect {
            self.config.bridge_target()
        } else {
            Ok((target.clone(), port))
        }
    }

    /// Raw outbound dial, independent of any endpoint and not registered.
    pub async fn app_connect(&self, addr: &TargetAddr, port: u16) -> Result<TcpStream> {
        dial_tcp(addr, port, self.config.connect_timeout()).await
    }

    /// Dial `addr:port` and wrap it in TLS when configured.
    pub async fn dial(&self, addr: &TargetAddr, port: u16) -> Result<Transport> {
        let stream = self.app_connect(addr, port).await?;
        let tls = match &self.tls {
            Some(tls) => tls,
            None => return Ok(Transport::from(stream)),
        };

        let name = tls.server_name_for(addr)?;
        let limit = self.config.connect_timeout();
        timeout(limit, Transport::connect_tls(stream, Arc::clone(&tls.config), name))
            .await
            .map_err(|_| Error::Timeout(limit.as_millis() as u64))?
    }

    /// Dial the configured `bridge_addr`.
    pub async fn connect_bridge(&self) -> Result<Transport> {
        let (addr, port) = self.config.bridge_target()?;
        self.dial(&addr, port).await
    }

    /// Relay an externally owned bridge link through this frontend.
    pub fn init_conn_handler(&self, bridge: Transport) -> ConnHandle {
        let endpoint = Arc::new(DuplexEndpoint::prewired(bridge));
        self.ctx.registry.insert(Arc::clone(&endpoint));

        let ctx = self.ctx.clone();
        let relayed = Arc::clone(&endpoint);
        let task = tokio::spawn(async move { ctx.run(relayed).await });
        ConnHandle { endpoint, task }
    }

    /// Stop relaying a link installed with [`init_conn_handler`] and hand its
    /// transport back. `None` if the link already closed.
    ///
    /// [`init_conn_handler`]: ProxyClient::init_conn_handler
    pub async fn restore_conn_handler(&self, handle: ConnHandle) -> Option<Transport> {
        let endpoint = Arc::clone(&handle.endpoint);
        self.ctx.registry.detach(endpoint.id());
        handle.finished().await;
        let transport = endpoint.take_descriptor(Side::Bridge)?;
        Arc::try_unwrap(transport).ok()
    }

    /// Close both legs of `ep` and retire it.
    pub fn shutdown_connection(&self, ep: &DuplexEndpoint) -> bool {
        self.ctx.registry.shutdown_connection(ep)
    }

    /// Close the client leg of `ep` only.
    pub fn shutdown_local_connection(&self, ep: &DuplexEndpoint) -> bool {
        self.ctx.registry.shutdown_local_connection(ep)
    }
}
