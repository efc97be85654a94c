//! SOCKS4/4a/5 handshake engine.
//!
//! Pure protocol logic: the engine reads the client's handshake from any
//! `AsyncRead + AsyncWrite` stream, negotiates authentication, decodes the
//! CONNECT target and later encodes the reply once the frontend knows whether
//! the outbound leg came up.
//!
//! ```text
//!  client                 engine                 frontend
//!    | greeting / request   |                        |
//!    |--------------------->| negotiate()            |
//!    |                      |----------------------->| dial target
//!    |                      |<-----------------------| bound addr / error
//!    |        reply         | reply_success()        |
//!    |<---------------------| reply_failure()        |
//! ```
//!
//! Failures inside `negotiate` send the protocol-defined rejection where the
//! stage allows one and are returned as [`Error`]; nothing escapes as a panic.

pub mod v4;
pub mod v5;

use std::fmt;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::{timeout_at, Instant};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::HANDSHAKE_TIMEOUT_MS;

/// Maximum length of a domain name or user-id field.
pub const MAX_FIELD_LEN: usize = 255;

/// Protocol version detected from the first handshake byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    /// SOCKS4, literal IPv4 target
    V4,
    /// SOCKS4a, hostname resolved by the proxy
    V4a,
    /// SOCKS5 (RFC 1928)
    V5,
}

/// Authentication method negotiated for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication
    None,
    /// RFC 1929 username/password
    UserPass,
}

/// Target address requested by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// Literal IPv4 address
    Ipv4(Ipv4Addr),
    /// Domain name to be resolved by the proxy (at most 255 bytes)
    Domain(String),
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip) => write!(f, "{}", ip),
            TargetAddr::Domain(name) => f.write_str(name),
        }
    }
}

/// Configured username/password pair. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Create a credential pair.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Configured username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Constant-time check; both fields are always compared.
    fn matches(&self, username: &[u8], password: &[u8]) -> bool {
        let user = self.username.as_bytes().ct_eq(username);
        let pass = self.password.as_bytes().ct_eq(password);
        bool::from(user & pass)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// SOCKS4 rejection codes used for each failure class.
///
/// The legacy protocol only defines 0x5B (rejected or failed), 0x5C (no
/// identd) and 0x5D (user-id mismatch); which one a given failure maps to is
/// deployment policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Socks4Status {
    /// Malformed or unsupported request
    pub rejected: u8,
    /// Outbound connection failed
    pub unreachable: u8,
    /// User-id does not match the configured username
    pub ident_mismatch: u8,
}

impl Default for Socks4Status {
    fn default() -> Self {
        Self {
            rejected: v4::status::REJECTED,
            unreachable: v4::status::REJECTED,
            ident_mismatch: v4::status::REJECTED,
        }
    }
}

impl Socks4Status {
    /// Status byte for an error raised while handling a SOCKS4 session.
    pub fn for_error(&self, error: &Error) -> u8 {
        match error {
            Error::Authentication => self.ident_mismatch,
            Error::Dial { .. } | Error::Timeout(_) => self.unreachable,
            _ => self.rejected,
        }
    }
}

/// Outcome of a successful negotiation.
///
/// Transient: lives only until the frontend has sent the reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    /// Protocol version spoken by the client
    pub version: SocksVersion,
    /// Authentication method that was negotiated
    pub method: AuthMethod,
    /// Authenticated username (SOCKS5) or user-id (SOCKS4)
    pub user: Option<String>,
    /// Requested destination
    pub target: TargetAddr,
    /// Requested destination port
    pub port: u16,
    /// DSTIP exactly as received, echoed in SOCKS4 replies
    pub(crate) v4_dst_ip: Ipv4Addr,
}

impl SocksRequest {
    /// `host:port` form suitable for dialing and logging.
    pub fn target_string(&self) -> String {
        format!("{}:{}", self.target, self.port)
    }
}

/// Stateless handshake engine shared by every connection of a frontend.
#[derive(Debug, Clone)]
pub struct SocksEngine {
    credentials: Option<Credentials>,
    socks4_status: Socks4Status,
    handshake_timeout: Duration,
}

impl Default for SocksEngine {
    fn default() -> Self {
        Self {
            credentials: None,
            socks4_status: Socks4Status::default(),
            handshake_timeout: Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
        }
    }
}

impl SocksEngine {
    /// Engine accepting unauthenticated clients.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require username/password authentication.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Override the SOCKS4 rejection policy.
    pub fn with_socks4_status(mut self, status: Socks4Status) -> Self {
        self.socks4_status = status;
        self
    }

    /// Bound the whole handshake, from the version byte to the request.
    pub fn with_handshake_timeout(mut self, limit: Duration) -> Self {
        self.handshake_timeout = limit;
        self
    }

    /// Configured credentials, if any.
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Handshake deadline.
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Read the handshake up to and including the CONNECT request.
    ///
    /// On error the rejection (if the stage has one) has already been sent and
    /// the caller only needs to tear the connection down. A client that stalls
    /// past the handshake timeout gets the same rejection as a malformed
    /// request and `Error::HandshakeTimeout`.
    pub async fn negotiate<S>(&self, stream: &mut S) -> Result<SocksRequest>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let deadline = Instant::now() + self.handshake_timeout;
        match within(deadline, read_u8(stream)).await? {
            v5::VERSION => v5::negotiate(stream, self.credentials.as_ref(), deadline).await,
            v4::VERSION => {
                v4::negotiate(stream, self.credentials.as_ref(), &self.socks4_status, deadline)
                    .await
            }
            other => Err(Error::UnsupportedVersion(other)),
        }
    }

    /// Report a successful CONNECT. `bound` is the local address of the
    /// outbound leg, never the requested target.
    pub async fn reply_success<S>(
        &self,
        stream: &mut S,
        request: &SocksRequest,
        bound: SocketAddr,
    ) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        match request.version {
            SocksVersion::V5 => v5::send_reply(stream, v5::reply::SUCCEEDED, bound).await,
            SocksVersion::V4 | SocksVersion::V4a => {
                v4::send_reply(stream, v4::status::GRANTED, request.port, request.v4_dst_ip).await
            }
        }
    }

    /// Report a failed CONNECT using the reply code mapped from `error`.
    pub async fn reply_failure<S>(
        &self,
        stream: &mut S,
        request: &SocksRequest,
        error: &Error,
    ) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        match request.version {
            SocksVersion::V5 => v5::send_reply(stream, error.socks5_reply(), v5::UNSPECIFIED).await,
            SocksVersion::V4 | SocksVersion::V4a => {
                let status = self.socks4_status.for_error(error);
                v4::send_reply(stream, status, request.port, request.v4_dst_ip).await
            }
        }
    }
}

/// Run one handshake stage, failing with `HandshakeTimeout` at `deadline`.
pub(crate) async fn within<T, F>(deadline: Instant, stage: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    timeout_at(deadline, stage)
        .await
        .unwrap_or(Err(Error::HandshakeTimeout))
}

pub(crate) async fn read_u8<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u8> {
    stream.read_u8().await.map_err(Error::from_read)
}

pub(crate) async fn read_port<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u16> {
    stream.read_u16().await.map_err(Error::from_read)
}

pub(crate) async fn read_exact<S: AsyncRead + Unpin>(stream: &mut S, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.map_err(Error::from_read)?;
    Ok(buf)
}

pub(crate) async fn read_ipv4<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Ipv4Addr> {
    let mut octets = [0u8; 4];
    stream.read_exact(&mut octets).await.map_err(Error::from_read)?;
    Ok(Ipv4Addr::from(octets))
}
