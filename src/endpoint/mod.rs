//! Duplex endpoint: the two legs of one relayed connection.
//!
//! A [`DuplexEndpoint`] owns the client-facing and bridge-facing transports.
//! Either leg may be vacant (not yet connected, or already closed); every
//! operation on a vacant leg reports [`Transfer::Closed`] instead of touching a
//! socket.
//!
//! All I/O follows one tri-state contract regardless of transport:
//!
//! | result            | meaning                                  |
//! |-------------------|------------------------------------------|
//! | `Pending`         | would block, retry on the next readiness |
//! | `Closed`          | peer closed, fatal error, or vacant leg  |
//! | `Bytes(n)`        | `n` bytes moved                          |
//!
//! Lock order: chunk staging buffers, then the leg slot, then the TLS session.
//! The proxy registry lock is never held while any of these is taken.

mod stream;
mod transport;

pub use stream::LegStream;
pub use transport::{SessionGuard, TlsSession, TlsTransport, Transport};

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::obfuscation::ChunkBuffers;

/// Unique endpoint identity within the process.
pub type EndpointId = u64;

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// Which leg of the endpoint an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Leg facing the local application (Tor, or a remote client on a bridge)
    Client,
    /// Leg facing the upstream bridge (or the local onion port on a bridge)
    Bridge,
}

impl Side {
    /// The opposite leg.
    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Bridge,
            Side::Bridge => Side::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Bridge => f.write_str("bridge"),
        }
    }
}

/// Result of one non-blocking transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Nothing could move right now
    Pending,
    /// The leg is gone
    Closed,
    /// Number of bytes moved
    Bytes(usize),
}

/// The two legs of a relayed connection.
pub struct DuplexEndpoint {
    id: EndpointId,
    client: RwLock<Option<Arc<Transport>>>,
    bridge: RwLock<Option<Arc<Transport>>>,
    chunks: Mutex<ChunkBuffers>,
    /// Bridge-only relay: inbound bytes with no client leg are discarded.
    sink: bool,
}

impl DuplexEndpoint {
    fn with_legs(client: Option<Transport>, bridge: Option<Transport>, sink: bool) -> Self {
        Self {
            id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
            client: RwLock::new(client.map(Arc::new)),
            bridge: RwLock::new(bridge.map(Arc::new)),
            chunks: Mutex::new(ChunkBuffers::default()),
            sink,
        }
    }

    /// Endpoint for a freshly accepted client; the bridge leg is vacant.
    pub fn new(client: Transport) -> Self {
        Self::with_legs(Some(client), None, false)
    }

    /// Endpoint with both legs already connected.
    pub fn pair(client: Transport, bridge: Transport) -> Self {
        Self::with_legs(Some(client), Some(bridge), false)
    }

    /// Bridge-only endpoint for a pre-established bridge link. It is a sink:
    /// registered live without a client leg, dropping what the bridge sends.
    pub fn prewired(bridge: Transport) -> Self {
        Self::with_legs(None, Some(bridge), true)
    }

    /// Endpoint identity.
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Whether bridge data without a client leg is drained and dropped.
    pub fn is_sink(&self) -> bool {
        self.sink
    }

    fn slot(&self, side: Side) -> &RwLock<Option<Arc<Transport>>> {
        match side {
            Side::Client => &self.client,
            Side::Bridge => &self.bridge,
        }
    }

    /// Transport currently connected on `side`, if any.
    pub fn descriptor(&self, side: Side) -> Option<Arc<Transport>> {
        self.slot(side).read().clone()
    }

    /// Async stream view of `side`, for handshakes run before relaying.
    pub fn stream(&self, side: Side) -> Option<LegStream> {
        self.descriptor(side).map(LegStream::new)
    }

    /// Connect `side`, replacing (and closing) whatever was there.
    pub fn set_descriptor(&self, side: Side, transport: Transport) {
        let previous = self.slot(side).write().replace(Arc::new(transport));
        if let Some(old) = previous {
            old.shutdown();
        }
    }

    /// Detach the transport on `side` without closing it.
    pub fn take_descriptor(&self, side: Side) -> Option<Arc<Transport>> {
        self.slot(side).write().take()
    }

    /// Whether `side` is connected.
    pub fn is_connected(&self, side: Side) -> bool {
        self.slot(side).read().is_some()
    }

    /// Whether the leg on `side` is TLS-protected.
    pub fn is_tls(&self, side: Side) -> bool {
        self.slot(side)
            .read()
            .as_ref()
            .map(|t| t.is_tls())
            .unwrap_or(false)
    }

    /// Local address of the leg on `side`.
    pub fn local_addr(&self, side: Side) -> Option<SocketAddr> {
        self.slot(side).read().as_ref().and_then(|t| t.local_addr().ok())
    }

    /// Read available bytes from `side`.
    pub fn read(&self, side: Side, buf: &mut [u8]) -> Transfer {
        match self.slot(side).read().as_ref() {
            Some(transport) => transport.try_read(buf),
            None => Transfer::Closed,
        }
    }

    /// Write to `side`; may accept fewer bytes than offered.
    pub fn write(&self, side: Side, buf: &[u8]) -> Transfer {
        match self.slot(side).read().as_ref() {
            Some(transport) => transport.try_write(buf),
            None => Transfer::Closed,
        }
    }

    /// Push out bytes buffered inside the transport on `side`.
    pub fn flush(&self, side: Side) -> Transfer {
        match self.slot(side).read().as_ref() {
            Some(transport) => transport.try_flush(),
            None => Transfer::Closed,
        }
    }

    /// Wait until `side` may be readable. Never resolves for a vacant leg,
    /// which lets a relay loop poll both legs uniformly.
    pub async fn readable(&self, side: Side) -> io::Result<()> {
        match self.descriptor(side) {
            Some(transport) => transport.readable().await,
            None => std::future::pending().await,
        }
    }

    /// Wait until `side` may accept writes.
    pub async fn writable(&self, side: Side) -> io::Result<()> {
        match self.descriptor(side) {
            Some(transport) => transport.writable().await,
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    /// Close the leg on `side`. Returns `false` if it was already vacant, so
    /// repeated calls never close a socket twice.
    pub fn shutdown(&self, side: Side) -> bool {
        match self.take_descriptor(side) {
            Some(transport) => {
                transport.shutdown();
                true
            }
            None => false,
        }
    }

    /// Staging buffers used by the chunk shaper.
    pub(crate) fn chunk_buffers(&self) -> MutexGuard<'_, ChunkBuffers> {
        self.chunks.lock()
    }
}

impl fmt::Debug for DuplexEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexEndpoint")
            .field("id", &self.id)
            .field("client", &self.is_connected(Side::Client))
            .field("bridge", &self.is_connected(Side::Bridge))
            .field("sink", &self.sink)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    async fn read_when_ready(ep: &DuplexEndpoint, side: Side, buf: &mut [u8]) -> Transfer {
        for _ in 0..100 {
            ep.readable(side).await.unwrap();
            match ep.read(side, buf) {
                Transfer::Pending => continue,
                other => return other,
            }
        }
        Transfer::Pending
    }

    #[test]
    fn test_side_peer() {
        assert_eq!(Side::Client.peer(), Side::Bridge);
        assert_eq!(Side::Bridge.peer(), Side::Client);
        assert_eq!(Side::Bridge.to_string(), "bridge");
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let (a, b) = socket_pair().await;
        let first = DuplexEndpoint::new(a.into());
        let second = DuplexEndpoint::new(b.into());
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn test_vacant_leg_reports_closed() {
        let (local, _remote) = socket_pair().await;
        let ep = DuplexEndpoint::new(local.into());

        let mut buf = [0u8; 16];
        assert!(!ep.is_connected(Side::Bridge));
        assert_eq!(ep.read(Side::Bridge, &mut buf), Transfer::Closed);
        assert_eq!(ep.write(Side::Bridge, b"data"), Transfer::Closed);
        assert!(ep.writable(Side::Bridge).await.is_err());
    }

    #[tokio::test]
    async fn test_plain_tristate() {
        let (local, mut remote) = socket_pair().await;
        let ep = DuplexEndpoint::new(local.into());
        let mut buf = [0u8; 64];

        assert_eq!(ep.read(Side::Client, &mut buf), Transfer::Pending);

        remote.write_all(b"hello").await.unwrap();
        assert_eq!(read_when_ready(&ep, Side::Client, &mut buf).await, Transfer::Bytes(5));
        assert_eq!(&buf[..5], b"hello");

        assert_eq!(ep.write(Side::Client, b"world"), Transfer::Bytes(5));
        let mut got = [0u8; 5];
        remote.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"world");

        drop(remote);
        assert_eq!(read_when_ready(&ep, Side::Client, &mut buf).await, Transfer::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (local, mut remote) = socket_pair().await;
        let ep = DuplexEndpoint::new(local.into());

        assert!(ep.shutdown(Side::Client));
        assert!(!ep.shutdown(Side::Client));
        assert!(!ep.shutdown(Side::Bridge));

        let mut buf = [0u8; 4];
        let n = tokio::time::timeout(Duration::from_secs(5), remote.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_set_descriptor_replaces_leg() {
        let (client, _client_peer) = socket_pair().await;
        let (bridge, mut bridge_peer) = socket_pair().await;
        let ep = DuplexEndpoint::new(client.into());

        ep.set_descriptor(Side::Bridge, bridge.into());
        assert!(ep.is_connected(Side::Bridge));
        assert!(!ep.is_tls(Side::Bridge));
        assert!(ep.local_addr(Side::Bridge).is_some());

        assert_eq!(ep.write(Side::Bridge, b"ping"), Transfer::Bytes(4));
        let mut got = [0u8; 4];
        bridge_peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");
    }

    #[tokio::test]
    async fn test_leg_stream_io() {
        let (local, mut remote) = socket_pair().await;
        let ep = DuplexEndpoint::new(local.into());
        let mut leg = ep.stream(Side::Client).unwrap();
        assert!(ep.stream(Side::Bridge).is_none());

        remote.write_all(b"\x05\x01\x00").await.unwrap();
        let mut greeting = [0u8; 3];
        leg.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [5, 1, 0]);

        leg.write_all(&[5, 0]).await.unwrap();
        leg.flush().await.unwrap();
        let mut reply = [0u8; 2];
        remote.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0]);

        drop(remote);
        let mut rest = Vec::new();
        leg.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_tls_leg_tristate() {
        let (server_cfg, client_cfg) = crate::tls::tests::test_configs();
        let (client_sock, server_sock) = socket_pair().await;

        let name = crate::tls::server_name("localhost").unwrap();
        let (client_tls, server_tls) = tokio::join!(
            Transport::connect_tls(client_sock, client_cfg, name),
            Transport::accept_tls(server_sock, server_cfg),
        );
        let bridge_side = DuplexEndpoint::prewired(client_tls.unwrap());
        let client_side = DuplexEndpoint::new(server_tls.unwrap());

        assert!(bridge_side.is_tls(Side::Bridge));
        let mut buf = [0u8; 64];
        assert_eq!(client_side.read(Side::Client, &mut buf), Transfer::Pending);

        assert_eq!(bridge_side.write(Side::Bridge, b"over tls"), Transfer::Bytes(8));
        assert_eq!(bridge_side.flush(Side::Bridge), Transfer::Bytes(0));
        assert_eq!(
            read_when_ready(&client_side, Side::Client, &mut buf).await,
            Transfer::Bytes(8)
        );
        assert_eq!(&buf[..8], b"over tls");

        assert!(bridge_side.shutdown(Side::Bridge));
        assert_eq!(
            read_when_ready(&client_side, Side::Client, &mut buf).await,
            Transfer::Closed
        );
    }
}
