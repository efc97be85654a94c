//! Proxy frontends.
//!
//! ```text
//!             ProxyClient                                  ProxyServer
//!  Tor ──SOCKS──▶ [client leg │ bridge leg] ══TLS/shaped══▶ [client leg │ bridge leg] ──▶ Tor OR port
//! ```
//!
//! Both frontends accept on one listening socket, build a
//! [`DuplexEndpoint`](crate::endpoint::DuplexEndpoint) per connection, track
//! it in a [`ConnectionRegistry`] and drive it with the shared relay loop on
//! its own task.

pub mod client;
pub mod registry;
pub mod relay;
#[cfg(feature = "server")]
pub mod server;
pub mod stats;

pub use client::{ConnHandle, ProxyClient, RunMode, Started};
pub use registry::ConnectionRegistry;
pub use relay::{RelayContext, RelayExit, RELAY_POLL_INTERVAL};
#[cfg(feature = "server")]
pub use server::ProxyServer;
pub use stats::{ProxyStats, StatsSnapshot};

use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::socks::TargetAddr;

/// Dial `addr:port` within `limit`.
pub(crate) async fn dial_tcp(addr: &TargetAddr, port: u16, limit: Duration) -> Result<TcpStream> {
    let connect = async {
        match addr {
            TargetAddr::Ipv4(ip) => TcpStream::connect((*ip, port)).await,
            TargetAddr::Domain(host) => TcpStream::connect((host.as_str(), port)).await,
        }
    };

    match timeout(limit, connect).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::trace!("set_nodelay: {}", e);
            }
            Ok(stream)
        }
        Ok(Err(source)) => Err(Error::Dial {
            target: format!("{}:{}", addr, port),
            source,
        }),
        Err(_) => Err(Error::Timeout(limit.as_millis() as u64)),
    }
}

/// Bind a listening socket; failure is a configuration error.
pub(crate) async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| Error::config(format!("cannot listen on {}: {}", addr, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = dial_tcp(&TargetAddr::Ipv4(Ipv4Addr::LOCALHOST), port, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Dial { .. }));
        assert_eq!(err.socks5_reply(), crate::socks::v5::reply::CONNECTION_REFUSED);
    }

    #[tokio::test]
    async fn test_dial_domain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = dial_tcp(&TargetAddr::Domain("127.0.0.1".into()), port, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_config_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert!(matches!(bind(&addr).await, Err(Error::Config(_))));
    }
}
