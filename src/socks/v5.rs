//! SOCKS5 (RFC 1928) negotiation with RFC 1929 username/password.
//!
//! ```text
//! greeting  +----+----------+----------+
//!           |VER | NMETHODS | METHODS  |
//!           +----+----------+----------+
//! request   +----+-----+-------+------+----------+----------+
//!           |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
//!           +----+-----+-------+------+----------+----------+
//! reply     +----+-----+-------+------+----------+----------+
//!           |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
//!           +----+-----+-------+------+----------+----------+
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use super::{
    read_exact, read_ipv4, read_port, read_u8, within, AuthMethod, Credentials, SocksRequest,
    SocksVersion, TargetAddr,
};
use crate::error::{Error, Result};

/// Protocol version byte.
pub const VERSION: u8 = 0x05;

/// Username/password sub-negotiation version byte.
pub const USERPASS_VERSION: u8 = 0x01;

/// Placeholder bind address for failure replies.
pub const UNSPECIFIED: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// Authentication method identifiers.
pub mod method {
    pub const NO_AUTH: u8 = 0x00;
    pub const USERPASS: u8 = 0x02;
    pub const NO_ACCEPTABLE: u8 = 0xFF;
}

/// Command codes.
pub mod command {
    pub const CONNECT: u8 = 0x01;
    pub const BIND: u8 = 0x02;
    pub const UDP_ASSOCIATE: u8 = 0x03;
}

/// Address types.
pub mod atyp {
    pub const IPV4: u8 = 0x01;
    pub const DOMAIN: u8 = 0x03;
    pub const IPV6: u8 = 0x04;
}

/// Reply codes.
pub mod reply {
    pub const SUCCEEDED: u8 = 0x00;
    pub const GENERAL_FAILURE: u8 = 0x01;
    pub const NOT_ALLOWED: u8 = 0x02;
    pub const NETWORK_UNREACHABLE: u8 = 0x03;
    pub const HOST_UNREACHABLE: u8 = 0x04;
    pub const CONNECTION_REFUSED: u8 = 0x05;
    pub const TTL_EXPIRED: u8 = 0x06;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
    pub const ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}

/// Sub-negotiation status bytes.
pub mod auth_status {
    pub const SUCCESS: u8 = 0x00;
    pub const FAILURE: u8 = 0x01;
}

/// Negotiate a SOCKS5 session. The version byte has already been consumed.
pub(crate) async fn negotiate<S>(
    stream: &mut S,
    credentials: Option<&Credentials>,
    deadline: Instant,
) -> Result<SocksRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method = within(deadline, negotiate_method(stream, credentials)).await?;

    let user = match (method, credentials) {
        (AuthMethod::UserPass, Some(creds)) => Some(authenticate(stream, creds, deadline).await?),
        _ => None,
    };

    match within(deadline, read_request(stream)).await {
        Ok((target, port)) => Ok(SocksRequest {
            version: SocksVersion::V5,
            method,
            user,
            target,
            port,
            v4_dst_ip: Ipv4Addr::UNSPECIFIED,
        }),
        Err(e) => {
            // Best-effort: the client may already be gone.
            send_reply(stream, e.socks5_reply(), UNSPECIFIED).await.ok();
            Err(e)
        }
    }
}

/// Read the method list and answer with the selected method.
///
/// When credentials are configured only username/password is acceptable;
/// otherwise only "no authentication" is.
async fn negotiate_method<S>(stream: &mut S, credentials: Option<&Credentials>) -> Result<AuthMethod>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let count = read_u8(stream).await? as usize;
    let methods = read_exact(stream, count).await?;

    let wanted = if credentials.is_some() {
        method::USERPASS
    } else {
        method::NO_AUTH
    };

    if !methods.contains(&wanted) {
        stream.write_all(&[VERSION, method::NO_ACCEPTABLE]).await.ok();
        return Err(Error::NoAcceptableMethod);
    }

    stream.write_all(&[VERSION, wanted]).await?;

    Ok(if wanted == method::USERPASS {
        AuthMethod::UserPass
    } else {
        AuthMethod::None
    })
}

/// RFC 1929 sub-negotiation. Returns the authenticated username.
async fn authenticate<S>(stream: &mut S, credentials: &Credentials, deadline: Instant) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (version, username, password) = match within(deadline, read_userpass(stream)).await {
        Ok(fields) => fields,
        Err(Error::HandshakeTimeout) => {
            reject_auth(stream).await;
            return Err(Error::HandshakeTimeout);
        }
        Err(e) => return Err(e),
    };

    if version != USERPASS_VERSION || !credentials.matches(&username, &password) {
        reject_auth(stream).await;
        return Err(Error::Authentication);
    }

    stream
        .write_all(&[USERPASS_VERSION, auth_status::SUCCESS])
        .await?;

    Ok(String::from_utf8_lossy(&username).into_owned())
}

async fn read_userpass<S>(stream: &mut S) -> Result<(u8, Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let version = read_u8(stream).await?;
    let ulen = read_u8(stream).await? as usize;
    let username = read_exact(stream, ulen).await?;
    let plen = read_u8(stream).await? as usize;
    let password = read_exact(stream, plen).await?;
    Ok((version, username, password))
}

async fn reject_auth<S: AsyncWrite + Unpin>(stream: &mut S) {
    stream
        .write_all(&[USERPASS_VERSION, auth_status::FAILURE])
        .await
        .ok();
}

async fn read_request<S>(stream: &mut S) -> Result<(TargetAddr, u16)>
where
    S: AsyncRead + Unpin,
{
    let version = read_u8(stream).await?;
    if version != VERSION {
        return Err(Error::protocol(format!(
            "request version 0x{:02x}, expected 0x05",
            version
        )));
    }

    let cmd = read_u8(stream).await?;
    let _reserved = read_u8(stream).await?;
    let addr_type = read_u8(stream).await?;

    if cmd != command::CONNECT {
        return Err(Error::UnsupportedCommand(cmd));
    }

    let target = match addr_type {
        atyp::IPV4 => TargetAddr::Ipv4(read_ipv4(stream).await?),
        atyp::DOMAIN => {
            let len = read_u8(stream).await? as usize;
            if len == 0 {
                return Err(Error::protocol("empty domain name"));
            }
            let raw = read_exact(stream, len).await?;
            let domain = String::from_utf8(raw)
                .map_err(|_| Error::protocol("domain name is not valid UTF-8"))?;
            TargetAddr::Domain(domain)
        }
        other => return Err(Error::UnsupportedAddressType(other)),
    };

    let port = read_port(stream).await?;
    Ok((target, port))
}

/// Encode a reply carrying `bound` in the BND fields.
pub fn encode_reply(code: u8, bound: SocketAddr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(22);
    buf.push(VERSION);
    buf.push(code);
    buf.push(0x00);
    match bound.ip() {
        IpAddr::V4(ip) => {
            buf.push(atyp::IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(atyp::IPV6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&bound.port().to_be_bytes());
    buf
}

pub(crate) async fn send_reply<S>(stream: &mut S, code: u8, bound: SocketAddr) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&encode_reply(code, bound)).await?;
    stream.flush().await?;
    Ok(())
}
