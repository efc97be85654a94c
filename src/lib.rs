//! # tork
//!
//! Pluggable transport for Tor: a local SOCKS4/4a/5 proxy that relays each
//! connection over a TLS-wrapped, optionally chunk-shaped link to a bridge,
//! which unwraps it into the local onion router.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Frontends (ProxyClient / ProxyServer, accept + dial)    │
//! ├──────────────────────────────────────────────────────────┤
//! │  Relay loop + ConnectionRegistry (live / zombie sets)    │
//! ├──────────────────────────────────────────────────────────┤
//! │  TrafficShaper (passthrough, chunk framing, pacing)      │
//! ├──────────────────────────────────────────────────────────┤
//! │  DuplexEndpoint (client leg │ bridge leg, plain or TLS)  │
//! ├──────────────────────────────────────────────────────────┤
//! │  SOCKS engine (v4, v4a, v5 CONNECT + user/password)      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Every transfer on an endpoint reports one of three outcomes
//! ([`Transfer`]): bytes moved, would block, or the leg is gone. The relay
//! loop is written entirely against that contract, so plain TCP, TLS and
//! shaped legs are interchangeable.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod endpoint;
pub mod error;
pub mod obfuscation;
pub mod proxy;
pub mod socks;
pub mod tls;

pub use config::{Mode, TorkConfig};
pub use endpoint::{DuplexEndpoint, Side, Transfer, Transport};
pub use error::{Error, Result};
pub use obfuscation::{Passthrough, ShapingConfig, TrafficShaper};
pub use proxy::{ProxyClient, RunMode, Started};
#[cfg(feature = "server")]
pub use proxy::ProxyServer;

/// Crate version, reported at startup
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Port the local SOCKS listener binds by default
pub const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Default timeout for handshake operations (milliseconds)
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_constants() {
        let config = TorkConfig::default();
        assert_eq!(config.proxy.listen_port, DEFAULT_SOCKS_PORT);
        assert_eq!(config.mode, Mode::Client);
        assert!(config.validate().is_ok());
    }
}
