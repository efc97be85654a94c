//! Error types for the TorK proxy.

use thiserror::Error;

use crate::socks::v5::reply as socks5_reply;

/// Result type alias for TorK operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating, dialing or relaying.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed handshake field
    #[error("SOCKS protocol error: {0}")]
    Protocol(String),

    /// First byte of the handshake is neither 4 nor 5
    #[error("unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    /// Only CONNECT is implemented
    #[error("unsupported SOCKS command: 0x{0:02x}")]
    UnsupportedCommand(u8),

    /// IPv6 and unknown address types
    #[error("unsupported address type: 0x{0:02x}")]
    UnsupportedAddressType(u8),

    /// Client offered no method we accept
    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    /// Username/password check failed
    #[error("authentication failed")]
    Authentication,

    /// Client did not finish the handshake before its deadline
    #[error("SOCKS handshake timed out")]
    HandshakeTimeout,

    /// Peer closed the connection (0 bytes read)
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Outbound connection could not be established
    #[error("failed to connect to {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Operation timeout
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// TLS setup or handshake error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new TLS error
    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Configuration-time errors stop the mode from starting; everything else
    /// is scoped to a single connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Tls(_))
    }

    /// Check if this error came from a malformed or rejected handshake
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::UnsupportedVersion(_)
                | Error::UnsupportedCommand(_)
                | Error::UnsupportedAddressType(_)
                | Error::NoAcceptableMethod
                | Error::Authentication
                | Error::HandshakeTimeout
        )
    }

    /// RFC 1928 reply code describing this failure.
    pub fn socks5_reply(&self) -> u8 {
        match self {
            Error::UnsupportedCommand(_) => socks5_reply::COMMAND_NOT_SUPPORTED,
            Error::UnsupportedAddressType(_) => socks5_reply::ADDRESS_TYPE_NOT_SUPPORTED,
            Error::Authentication => socks5_reply::NOT_ALLOWED,
            Error::Timeout(_) => socks5_reply::TTL_EXPIRED,
            Error::Dial { source, .. } => match source.kind() {
                std::io::ErrorKind::ConnectionRefused => socks5_reply::CONNECTION_REFUSED,
                std::io::ErrorKind::TimedOut => socks5_reply::TTL_EXPIRED,
                std::io::ErrorKind::NotFound => socks5_reply::HOST_UNREACHABLE,
                _ => socks5_reply::NETWORK_UNREACHABLE,
            },
            _ => socks5_reply::GENERAL_FAILURE,
        }
    }

    /// Map a read error to the handshake taxonomy: EOF means the peer went away.
    pub(crate) fn from_read(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::ConnectionClosed
        } else {
            Error::Network(e)
        }
    }
}
