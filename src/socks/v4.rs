//! SOCKS4 and SOCKS4a negotiation.
//!
//! ```text
//! request  +----+----+----+----+----+----+----+----+----+....+----+
//!          | VN | CD | DSTPORT |      DSTIP        | USERID  |NULL|
//!          +----+----+----+----+----+----+----+----+----+....+----+
//! 4a tail  | HOSTNAME ... |NULL|     (only when DSTIP = 0.0.0.x, x != 0)
//! reply    +----+----+----+----+----+----+----+----+
//!          | VN | CD | DSTPORT |      DSTIP        |
//!          +----+----+----+----+----+----+----+----+
//! ```

use std::net::Ipv4Addr;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use super::{within, read_ipv4, read_port, read_u8, AuthMethod, Credentials, Socks4Status, SocksRequest, SocksVersion, TargetAddr, MAX_FIELD_LEN};
use crate::error::{Error, Result};

/// Protocol version byte.
pub const VERSION: u8 = 0x04;

/// Version byte of every reply.
pub const REPLY_VERSION: u8 = 0x00;

/// CONNECT command code.
pub const CONNECT: u8 = 0x01;

/// Reply status bytes.
pub mod status {
    pub const GRANTED: u8 = 0x5A;
    pub const REJECTED: u8 = 0x5B;
    pub const NO_IDENTD: u8 = 0x5C;
    pub const IDENT_MISMATCH: u8 = 0x5D;
}

/// DSTIP of the form 0.0.0.x with x non-zero asks the proxy to resolve a
/// hostname that follows the user-id.
pub fn is_4a(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[..3] == [0, 0, 0] && octets[3] != 0
}

/// Negotiate a SOCKS4/4a session. The version byte has already been consumed.
pub(crate) async fn negotiate<S>(
    stream: &mut S,
    credentials: Option<&Credentials>,
    policy: &Socks4Status,
    deadline: Instant,
) -> Result<SocksRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut echo = (0u16, Ipv4Addr::UNSPECIFIED);

    match within(deadline, read_request(stream, credentials, &mut echo)).await {
        Ok(request) => Ok(request),
        Err(e) => {
            send_reply(stream, policy.for_error(&e), echo.0, echo.1).await.ok();
            Err(e)
        }
    }
}

async fn read_request<S>(
    stream: &mut S,
    credentials: Option<&Credentials>,
    echo: &mut (u16, Ipv4Addr),
) -> Result<SocksRequest>
where
    S: AsyncRead + Unpin,
{
    let cmd = read_u8(stream).await?;
    let port = read_port(stream).await?;
    let ip = read_ipv4(stream).await?;
    *echo = (port, ip);

    if cmd != CONNECT {
        return Err(Error::UnsupportedCommand(cmd));
    }

    let user_id = read_nstring(stream).await?;

    let (version, target) = if is_4a(ip) {
        let host = read_nstring(stream).await?;
        if host.is_empty() {
            return Err(Error::protocol("SOCKS4a request without hostname"));
        }
        let host = String::from_utf8(host)
            .map_err(|_| Error::protocol("SOCKS4a hostname is not valid UTF-8"))?;
        (SocksVersion::V4a, TargetAddr::Domain(host))
    } else {
        (SocksVersion::V4, TargetAddr::Ipv4(ip))
    };

    if let Some(creds) = credentials {
        if user_id != creds.username().as_bytes() {
            return Err(Error::Authentication);
        }
    }

    Ok(SocksRequest {
        version,
        method: AuthMethod::None,
        user: (!user_id.is_empty()).then(|| String::from_utf8_lossy(&user_id).into_owned()),
        target,
        port,
        v4_dst_ip: ip,
    })
}

/// Read a NUL-terminated field of at most `MAX_FIELD_LEN` bytes.
async fn read_nstring<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let mut field = Vec::new();
    loop {
        let byte = read_u8(stream).await?;
        if byte == 0 {
            return Ok(field);
        }
        if field.len() == MAX_FIELD_LEN {
            return Err(Error::protocol("SOCKS4 field exceeds 255 bytes"));
        }
        field.push(byte);
    }
}

/// Encode the fixed 8-byte reply.
pub fn encode_reply(status: u8, port: u16, ip: Ipv4Addr) -> [u8; 8] {
    let port = port.to_be_bytes();
    let ip = ip.octets();
    [REPLY_VERSION, status, port[0], port[1], ip[0], ip[1], ip[2], ip[3]]
}

pub(crate) async fn send_reply<S>(stream: &mut S, status: u8, port: u16, ip: Ipv4Addr) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&encode_reply(status, port, ip)).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks::SocksEngine;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    async fn reply_of(client: &mut tokio::io::DuplexStream) -> [u8; 8] {
        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[test]
    fn test_is_4a() {
        assert!(is_4a(Ipv4Addr::new(0, 0, 0, 1)));
        assert!(is_4a(Ipv4Addr::new(0, 0, 0, 255)));
        assert!(!is_4a(Ipv4Addr::new(0, 0, 0, 0)));
        assert!(!is_4a(Ipv4Addr::new(0, 0, 1, 1)));
        assert!(!is_4a(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[tokio::test]
    async fn test_socks4_connect() {
        let (mut client, mut server) = tokio::io::duplex(128);
        let engine = SocksEngine::new();

        client
            .write_all(&[0x04, 0x01, 0x00, 0x50, 93, 184, 216, 34, b'b', b'o', b'b', 0x00])
            .await
            .unwrap();

        let request = engine.negotiate(&mut server).await.unwrap();
        assert_eq!(request.version, SocksVersion::V4);
        assert_eq!(request.target, TargetAddr::Ipv4(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(request.port, 80);
        assert_eq!(request.user.as_deref(), Some("bob"));

        engine
            .reply_success(&mut server, &request, "127.0.0.1:5555".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(reply_of(&mut client).await, [0x00, 0x5A, 0x00, 0x50, 93, 184, 216, 34]);
    }

    #[tokio::test]
    async fn test_socks4a_uses_hostname() {
        let (mut client, mut server) = tokio::io::duplex(128);

        let mut req = vec![0x04, 0x01, 0x01, 0xBB, 0, 0, 0, 7, 0x00];
        req.extend_from_slice(b"bridge.example.net\0");
        client.write_all(&req).await.unwrap();

        let request = SocksEngine::new().negotiate(&mut server).await.unwrap();
        assert_eq!(request.version, SocksVersion::V4a);
        assert_eq!(request.target, TargetAddr::Domain("bridge.example.net".into()));
        assert_eq!(request.target_string(), "bridge.example.net:443");
        assert_eq!(request.user, None);
    }

    #[tokio::test]
    async fn test_socks4a_missing_hostname_rejected() {
        let (mut client, mut server) = tokio::io::duplex(128);

        client
            .write_all(&[0x04, 0x01, 0x00, 0x50, 0x00, 0x00, 0x00, 0x01, 0x00])
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let err = SocksEngine::new().negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert_eq!(reply_of(&mut client).await[1], status::REJECTED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_socks4a_stalled_hostname_rejected_at_deadline() {
        let (mut client, mut server) = tokio::io::duplex(128);
        let engine = SocksEngine::new().with_handshake_timeout(Duration::from_secs(10));

        // The client keeps its side open and waits for an answer.
        client
            .write_all(&[0x04, 0x01, 0x00, 0x50, 0x00, 0x00, 0x00, 0x01, 0x00])
            .await
            .unwrap();

        let err = engine.negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::HandshakeTimeout));
        assert_eq!(reply_of(&mut client).await, [0x00, 0x5B, 0x00, 0x50, 0, 0, 0, 1]);
    }

    #[tokio::test]
    async fn test_socks4a_empty_hostname_rejected() {
        let (mut client, mut server) = tokio::io::duplex(128);

        client
            .write_all(&[0x04, 0x01, 0x00, 0x50, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00])
            .await
            .unwrap();

        let err = SocksEngine::new().negotiate(&mut server).await.unwrap_err();
        assert!(err.is_protocol_error());
        assert_eq!(reply_of(&mut client).await, [0x00, 0x5B, 0x00, 0x50, 0, 0, 0, 1]);
    }

    #[tokio::test]
    async fn test_socks4_bind_rejected() {
        let (mut client, mut server) = tokio::io::duplex(128);

        client
            .write_all(&[0x04, 0x02, 0x00, 0x15, 10, 0, 0, 1, 0x00])
            .await
            .unwrap();

        let err = SocksEngine::new().negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedCommand(0x02)));
        assert_eq!(reply_of(&mut client).await, [0x00, 0x5B, 0x00, 0x15, 10, 0, 0, 1]);
    }

    #[tokio::test]
    async fn test_oversize_user_id_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let mut req = vec![0x04, 0x01, 0x00, 0x50, 10, 0, 0, 1];
        req.extend(std::iter::repeat(b'x').take(300));
        req.push(0);
        client.write_all(&req).await.unwrap();

        let err = SocksEngine::new().negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_user_id_must_match_username() {
        let (mut client, mut server) = tokio::io::duplex(128);
        let policy = Socks4Status {
            ident_mismatch: status::IDENT_MISMATCH,
            ..Default::default()
        };
        let engine = SocksEngine::new()
            .with_credentials(Credentials::new("tor", "pw"))
            .with_socks4_status(policy);

        client
            .write_all(&[0x04, 0x01, 0x00, 0x50, 10, 0, 0, 1, b'e', b'v', b'e', 0x00])
            .await
            .unwrap();

        let err = engine.negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::Authentication));
        assert_eq!(reply_of(&mut client).await[1], status::IDENT_MISMATCH);
    }

    #[tokio::test]
    async fn test_dial_failure_reply_policy() {
        let (mut client, mut server) = tokio::io::duplex(128);
        let policy = Socks4Status {
            unreachable: status::NO_IDENTD,
            ..Default::default()
        };
        let engine = SocksEngine::new().with_socks4_status(policy);

        client
            .write_all(&[0x04, 0x01, 0x00, 0x50, 10, 0, 0, 1, 0x00])
            .await
            .unwrap();
        let request = engine.negotiate(&mut server).await.unwrap();

        let err = Error::Dial {
            target: request.target_string(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        engine.reply_failure(&mut server, &request, &err).await.unwrap();
        assert_eq!(reply_of(&mut client).await, [0x00, 0x5C, 0x00, 0x50, 10, 0, 0, 1]);
    }
}
