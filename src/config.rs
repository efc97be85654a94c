//! Configuration file format.
//!
//! ```toml
//! mode = "client"            # client | bridge | chaff
//!
//! [proxy]
//! listen_port = 1080
//! bridge_addr = "198.51.100.7:8443"
//!
//! [tls]
//! enabled = true
//!
//! [shaping]
//! chunk_size = 3125
//! ts_min_us = 5000
//! ts_max_us = 15000
//! ```
//!
//! Every section and field is optional; omitted values take the defaults
//! below.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::obfuscation::ShapingConfig;
use crate::socks::{Credentials, Socks4Status, SocksEngine, TargetAddr};
use crate::{tls, DEFAULT_SOCKS_PORT, HANDSHAKE_TIMEOUT_MS};

/// Operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Local SOCKS frontend relaying to the bridge
    #[default]
    Client,
    /// Bridge-side frontend relaying to the local onion port
    Bridge,
    /// Tor-less pre-wired link to the bridge carrying only chaff
    Chaff,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TorkConfig {
    /// Operating mode
    pub mode: Mode,
    /// SOCKS frontend (client and chaff modes)
    pub proxy: ProxyConfig,
    /// Bridge frontend (bridge mode)
    pub bridge: BridgeConfig,
    /// TLS on the bridge link
    pub tls: TlsConfig,
    /// Shaping of the bridge link
    pub shaping: ShapingConfig,
}

/// `[proxy]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Local listen address
    pub listen_addr: String,
    /// Local SOCKS port
    pub listen_port: u16,
    /// Dial `bridge_addr` for every connection instead of the SOCKS target
    pub direct_connect: bool,
    /// Bridge `host:port`
    pub bridge_addr: Option<String>,
    /// Outbound dial timeout
    pub connect_timeout_ms: u64,
    /// Deadline for a client to finish the SOCKS handshake
    pub handshake_timeout_ms: u64,
    /// Exit instead of falling back to listening when the chaff link fails
    pub abort_on_conn: bool,
    /// Required SOCKS username
    pub username: Option<String>,
    /// Required SOCKS password
    pub password: Option<String>,
    /// SOCKS4 rejection codes
    pub socks4_status: Socks4Status,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".into(),
            listen_port: DEFAULT_SOCKS_PORT,
            direct_connect: false,
            bridge_addr: None,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: HANDSHAKE_TIMEOUT_MS,
            abort_on_conn: false,
            username: None,
            password: None,
            socks4_status: Socks4Status::default(),
        }
    }
}

impl ProxyConfig {
    /// `listen_addr:listen_port`.
    pub fn listen_socket(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }

    /// Outbound dial timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Configured credentials, if any.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some(Credentials::new(user.as_str(), pass.as_str())),
            _ => None,
        }
    }

    /// Handshake engine with this section's auth and SOCKS4 policy.
    pub fn engine(&self) -> SocksEngine {
        let engine = SocksEngine::new()
            .with_socks4_status(self.socks4_status)
            .with_handshake_timeout(Duration::from_millis(self.handshake_timeout_ms));
        match self.credentials() {
            Some(creds) => engine.with_credentials(creds),
            None => engine,
        }
    }

    /// Parsed `bridge_addr`.
    pub fn bridge_target(&self) -> Result<(TargetAddr, u16)> {
        let addr = self
            .bridge_addr
            .as_deref()
            .ok_or_else(|| Error::config("proxy.bridge_addr is not set"))?;
        parse_host_port(addr)
    }

    /// Check field consistency.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(Error::config("proxy.listen_addr cannot be empty"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(Error::config("proxy.connect_timeout_ms must be positive"));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(Error::config("proxy.handshake_timeout_ms must be positive"));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(Error::config(
                "proxy.username and proxy.password must be set together",
            ));
        }
        for field in [&self.username, &self.password].into_iter().flatten() {
            if field.is_empty() || field.len() > crate::socks::MAX_FIELD_LEN {
                return Err(Error::config("proxy credentials must be 1..=255 bytes"));
            }
        }
        if self.direct_connect {
            self.bridge_target()?;
        }
        Ok(())
    }
}

/// `[bridge]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Listen address for bridge clients
    pub listen_addr: String,
    /// Listen port for bridge clients
    pub listen_port: u16,
    /// Local Tor OR port, dialed on 127.0.0.1
    pub onion_port: u16,
    /// Dial timeout towards the onion port
    pub connect_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".into(),
            listen_port: 8443,
            onion_port: 9001,
            connect_timeout_ms: 10_000,
        }
    }
}

impl BridgeConfig {
    /// `listen_addr:listen_port`.
    pub fn listen_socket(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }

    /// Dial timeout towards the onion port.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Check field consistency.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(Error::config("bridge.listen_addr cannot be empty"));
        }
        if self.onion_port == 0 {
            return Err(Error::config("bridge.onion_port must be set"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(Error::config("bridge.connect_timeout_ms must be positive"));
        }
        Ok(())
    }
}

/// `[tls]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Wrap the bridge link in TLS
    pub enabled: bool,
    /// Bridge certificate chain (PEM)
    pub cert_path: PathBuf,
    /// Bridge private key (PEM)
    pub key_path: PathBuf,
    /// CA bundle for verifying the bridge; unverified when absent
    pub ca_path: Option<PathBuf>,
    /// SNI sent to the bridge; defaults to the dialed host
    pub server_name: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cert_path: PathBuf::from("../certs/bridge_cert.pem"),
            key_path: PathBuf::from("../certs/bridge_private.key"),
            ca_path: None,
            server_name: None,
        }
    }
}

/// Client-side TLS context for the bridge link.
#[derive(Clone)]
pub struct BridgeTls {
    /// rustls client context
    pub config: Arc<ClientConfig>,
    /// Fixed SNI; `None` uses the dialed host
    pub server_name: Option<ServerName<'static>>,
}

impl BridgeTls {
    /// Name to present when dialing `host`.
    pub fn server_name_for(&self, host: &TargetAddr) -> Result<ServerName<'static>> {
        match &self.server_name {
            Some(name) => Ok(name.clone()),
            None => tls::server_name(&host.to_string()),
        }
    }
}

impl TlsConfig {
    /// Client context, or `None` when TLS is off.
    pub fn client(&self) -> Result<Option<BridgeTls>> {
        if !self.enabled {
            return Ok(None);
        }
        let server_name = self.server_name.as_deref().map(tls::server_name).transpose()?;
        Ok(Some(BridgeTls {
            config: tls::client_config(self.ca_path.as_deref())?,
            server_name,
        }))
    }

    /// Server context, or `None` when TLS is off.
    pub fn server(&self) -> Result<Option<Arc<ServerConfig>>> {
        if !self.enabled {
            return Ok(None);
        }
        tls::server_config(&self.cert_path, &self.key_path).map(Some)
    }
}

impl TorkConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::config(e.to_string()))
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }

    /// Check the sections the selected mode uses.
    pub fn validate(&self) -> Result<()> {
        self.shaping.validate()?;
        match self.mode {
            Mode::Client => self.proxy.validate(),
            Mode::Chaff => {
                self.proxy.validate()?;
                self.proxy.bridge_target().map(|_| ())
            }
            Mode::Bridge => self.bridge.validate(),
        }
    }
}

/// Split `host:port`. Bracketed IPv6 literals are accepted.
pub fn parse_host_port(addr: &str) -> Result<(TargetAddr, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::config(format!("{}: expected host:port", addr)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::config(format!("{}: invalid port", addr)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || port == 0 {
        return Err(Error::config(format!("{}: expected host:port", addr)));
    }
    let target = match host.parse() {
        Ok(ip) => TargetAddr::Ipv4(ip),
        Err(_) => TargetAddr::Domain(host.to_string()),
    };
    Ok((target, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_defaults() {
        let config = TorkConfig::default();
        assert_eq!(config.mode, Mode::Client);
        assert_eq!(config.proxy.listen_socket(), "127.0.0.1:1080");
        assert_eq!(config.proxy.connect_timeout(), Duration::from_secs(10));
        assert!(config.tls.enabled);
        assert_eq!(config.shaping.chunk_size, 3125);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config = TorkConfig::from_toml(
            r#"
            mode = "chaff"

            [proxy]
            listen_port = 9150
            bridge_addr = "192.0.2.10:8443"
            username = "tor"
            password = "secret"

            [proxy.socks4_status]
            unreachable = 92

            [shaping]
            max_chunks = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, Mode::Chaff);
        assert_eq!(config.proxy.listen_port, 9150);
        assert_eq!(config.proxy.socks4_status.unreachable, 0x5C);
        assert_eq!(config.proxy.socks4_status.rejected, 0x5B);
        assert_eq!(config.shaping.max_chunks, 4);
        assert_eq!(config.shaping.chunk_size, 3125);
        assert!(config.proxy.engine().credentials().is_some());
        assert_eq!(config.proxy.engine().handshake_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_handshake_timeout_rejected() {
        let mut config = TorkConfig::default();
        config.proxy.handshake_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let err = TorkConfig::from_toml(r#"mode = "relay""#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_lone_username_rejected() {
        let mut config = TorkConfig::default();
        config.proxy.username = Some("tor".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chaff_requires_bridge() {
        let config = TorkConfig {
            mode: Mode::Chaff,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_direct_connect_requires_bridge() {
        let mut config = TorkConfig::default();
        config.proxy.direct_connect = true;
        assert!(config.validate().is_err());
        config.proxy.bridge_addr = Some("bridge.example.net:443".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("10.0.0.1:443").unwrap(),
            (TargetAddr::Ipv4(Ipv4Addr::new(10, 0, 0, 1)), 443)
        );
        assert_eq!(
            parse_host_port("bridge.example.net:8443").unwrap(),
            (TargetAddr::Domain("bridge.example.net".into()), 8443)
        );
        assert_eq!(
            parse_host_port("[::1]:80").unwrap(),
            (TargetAddr::Domain("::1".into()), 80)
        );
        assert!(parse_host_port("no-port").is_err());
        assert!(parse_host_port("host:0").is_err());
        assert!(parse_host_port(":80").is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = TorkConfig::default();
        config.proxy.bridge_addr = Some("192.0.2.1:8443".into());
        let text = config.to_toml().unwrap();
        let parsed = TorkConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.proxy.bridge_addr, config.proxy.bridge_addr);
        assert_eq!(parsed.shaping, config.shaping);
    }

    #[test]
    fn test_tls_disabled_yields_none() {
        let tls = TlsConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(tls.client().unwrap().is_none());
        assert!(tls.server().unwrap().is_none());
    }

    #[test]
    fn test_missing_bridge_cert_is_fatal() {
        let tls = TlsConfig {
            cert_path: PathBuf::from("/nonexistent/cert.pem"),
            ..Default::default()
        };
        assert!(tls.server().unwrap_err().is_fatal());
    }
}
