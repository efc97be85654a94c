//! Plain and TLS-wrapped socket transports.
//!
//! Both variants expose the same non-blocking primitives. The TLS variant
//! drives a `rustls::Connection` directly over the socket's `try_read` /
//! `try_write`, so a TLS read first drains already-decrypted plaintext, then
//! pulls ciphertext only if the socket has some, and never parks the caller on
//! network I/O.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use socket2::SockRef;
use tokio::net::TcpStream;

use super::Transfer;
use crate::error::{Error, Result};

/// Largest plaintext slice handed to rustls per write call (one TLS record).
const MAX_TLS_PLAINTEXT: usize = 16 * 1024;

/// A connected socket, optionally protected by TLS.
pub enum Transport {
    /// Raw TCP
    Plain(TcpStream),
    /// TCP carrying an established TLS session
    Tls(TlsTransport),
}

/// Socket plus the TLS session bound to it.
pub struct TlsTransport {
    stream: TcpStream,
    session: TlsSession,
}

/// TLS session state. rustls sessions must not be driven from two tasks at
/// once, so every operation goes through [`TlsSession::lock`].
pub struct TlsSession {
    conn: Mutex<Connection>,
}

impl TlsSession {
    fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Acquire the scoped session guard for exactly one read, write or flush.
    ///
    /// The guard is not reentrant: never call `lock` again (on this session)
    /// while holding it, and never hold it across an `.await`.
    pub fn lock<'a>(&'a self, stream: &'a TcpStream) -> SessionGuard<'a> {
        SessionGuard {
            conn: self.conn.lock(),
            stream,
        }
    }
}

/// Exclusive access to one TLS session for the span of a single operation.
pub struct SessionGuard<'a> {
    conn: MutexGuard<'a, Connection>,
    stream: &'a TcpStream,
}

impl SessionGuard<'_> {
    /// Check for buffered plaintext, pull ciphertext if there is none, and
    /// consume whatever became available.
    pub fn read(&mut self, buf: &mut [u8]) -> Transfer {
        if buf.is_empty() {
            return Transfer::Bytes(0);
        }
        loop {
            match self.conn.reader().read(buf) {
                Ok(0) => return Transfer::Closed,
                Ok(n) => return Transfer::Bytes(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => return Transfer::Closed,
            }

            match self.conn.read_tls(&mut SocketIo(self.stream)) {
                Ok(0) => return Transfer::Closed,
                Ok(_) => {
                    if self.conn.process_new_packets().is_err() {
                        // Push the alert out if the socket takes it.
                        self.flush();
                        return Transfer::Closed;
                    }
                    if let Transfer::Closed = self.flush() {
                        return Transfer::Closed;
                    }
                }
                Err(e) if would_block(&e) => return Transfer::Pending,
                Err(_) => return Transfer::Closed,
            }
        }
    }

    /// Encrypt up to one record of `buf` and push as much ciphertext as the
    /// socket accepts. Nothing is consumed while older ciphertext is still
    /// waiting.
    pub fn write(&mut self, buf: &[u8]) -> Transfer {
        match self.flush() {
            Transfer::Bytes(_) => {}
            other => return other,
        }
        if buf.is_empty() {
            return Transfer::Bytes(0);
        }

        let len = buf.len().min(MAX_TLS_PLAINTEXT);
        let written = match self.conn.writer().write(&buf[..len]) {
            Ok(n) => n,
            Err(_) => return Transfer::Closed,
        };

        match self.flush() {
            Transfer::Closed => Transfer::Closed,
            _ => Transfer::Bytes(written),
        }
    }

    /// Write buffered ciphertext. `Bytes(0)` once nothing is left.
    pub fn flush(&mut self) -> Transfer {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut SocketIo(self.stream)) {
                Ok(0) => return Transfer::Closed,
                Ok(_) => {}
                Err(e) if would_block(&e) => return Transfer::Pending,
                Err(_) => return Transfer::Closed,
            }
        }
        Transfer::Bytes(0)
    }

    /// Queue close_notify and push it out if possible.
    pub fn close(&mut self) {
        self.conn.send_close_notify();
        self.flush();
    }
}

impl Transport {
    /// Run a TLS client handshake over `stream`.
    pub async fn connect_tls(
        stream: TcpStream,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<Self> {
        let conn = ClientConnection::new(config, server_name)
            .map_err(|e| Error::tls(format!("client session: {}", e)))?;
        Self::handshake(stream, Connection::Client(conn)).await
    }

    /// Run a TLS server handshake over an accepted `stream`.
    pub async fn accept_tls(stream: TcpStream, config: Arc<ServerConfig>) -> Result<Self> {
        let conn = ServerConnection::new(config)
            .map_err(|e| Error::tls(format!("server session: {}", e)))?;
        Self::handshake(stream, Connection::Server(conn)).await
    }

    async fn handshake(stream: TcpStream, mut conn: Connection) -> Result<Self> {
        loop {
            while conn.wants_write() {
                match conn.write_tls(&mut SocketIo(&stream)) {
                    Ok(_) => {}
                    Err(e) if would_block(&e) => stream.writable().await?,
                    Err(e) => return Err(Error::Network(e)),
                }
            }

            if !conn.is_handshaking() {
                break;
            }

            stream.readable().await?;
            match conn.read_tls(&mut SocketIo(&stream)) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(_) => {
                    if let Err(e) = conn.process_new_packets() {
                        let _ = conn.write_tls(&mut SocketIo(&stream));
                        return Err(Error::Network(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("TLS handshake failed: {}", e),
                        )));
                    }
                }
                Err(e) if would_block(&e) => {}
                Err(e) => return Err(Error::Network(e)),
            }
        }

        Ok(Transport::Tls(TlsTransport {
            stream,
            session: TlsSession::new(conn),
        }))
    }

    /// Underlying socket.
    pub fn stream(&self) -> &TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(tls) => &tls.stream,
        }
    }

    /// Whether this leg is TLS-protected.
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Local address of the socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream().local_addr()
    }

    /// Remote address of the socket.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream().peer_addr()
    }

    /// Non-blocking read.
    pub fn try_read(&self, buf: &mut [u8]) -> Transfer {
        match self {
            Transport::Plain(stream) => match stream.try_read(buf) {
                Ok(0) if !buf.is_empty() => Transfer::Closed,
                Ok(n) => Transfer::Bytes(n),
                Err(e) if would_block(&e) => Transfer::Pending,
                Err(_) => Transfer::Closed,
            },
            Transport::Tls(tls) => tls.session.lock(&tls.stream).read(buf),
        }
    }

    /// Non-blocking write. May accept fewer bytes than offered.
    pub fn try_write(&self, buf: &[u8]) -> Transfer {
        match self {
            Transport::Plain(stream) => match stream.try_write(buf) {
                Ok(0) if !buf.is_empty() => Transfer::Closed,
                Ok(n) => Transfer::Bytes(n),
                Err(e) if would_block(&e) => Transfer::Pending,
                Err(_) => Transfer::Closed,
            },
            Transport::Tls(tls) => tls.session.lock(&tls.stream).write(buf),
        }
    }

    /// Push out data buffered below the caller (TLS records).
    pub fn try_flush(&self) -> Transfer {
        match self {
            Transport::Plain(_) => Transfer::Bytes(0),
            Transport::Tls(tls) => tls.session.lock(&tls.stream).flush(),
        }
    }

    /// Wait until the socket may have data.
    pub async fn readable(&self) -> io::Result<()> {
        self.stream().readable().await
    }

    /// Wait until the socket may accept data.
    pub async fn writable(&self) -> io::Result<()> {
        self.stream().writable().await
    }

    /// Close both directions of the socket, sending close_notify first on TLS.
    pub fn shutdown(&self) {
        if let Transport::Tls(tls) = self {
            tls.session.lock(&tls.stream).close();
        }
        if let Err(e) = SockRef::from(self.stream()).shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                tracing::trace!("socket shutdown: {}", e);
            }
        }
    }
}

impl From<TcpStream> for Transport {
    fn from(stream: TcpStream) -> Self {
        Transport::Plain(stream)
    }
}

/// Blocking-style `Read`/`Write` view over a non-blocking tokio socket, for
/// rustls' `read_tls` / `write_tls`.
struct SocketIo<'a>(&'a TcpStream);

impl Read for SocketIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for SocketIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
