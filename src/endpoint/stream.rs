//! `AsyncRead`/`AsyncWrite` view of one endpoint leg.
//!
//! Handshakes (SOCKS negotiation, replies) are written as ordinary async
//! stream code; this adapter runs them over the same shared transport the
//! relay later drives through the tri-state primitives.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{Transfer, Transport};

/// Async stream over a shared transport. A closed leg reads as EOF and
/// fails writes with `BrokenPipe`.
pub struct LegStream {
    transport: Arc<Transport>,
}

impl LegStream {
    pub(crate) fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }
}

impl AsyncRead for LegStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            match self.transport.try_read(buf.initialize_unfilled()) {
                Transfer::Bytes(n) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Transfer::Closed => return Poll::Ready(Ok(())),
                Transfer::Pending => ready!(self.transport.stream().poll_read_ready(cx))?,
            }
        }
    }
}

impl AsyncWrite for LegStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            match self.transport.try_write(buf) {
                Transfer::Bytes(n) => return Poll::Ready(Ok(n)),
                Transfer::Closed => return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
                Transfer::Pending => ready!(self.transport.stream().poll_write_ready(cx))?,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            match self.transport.try_flush() {
                Transfer::Bytes(_) => return Poll::Ready(Ok(())),
                Transfer::Closed => return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
                Transfer::Pending => ready!(self.transport.stream().poll_write_ready(cx))?,
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}
