//! Chunking shaper for one leg of an endpoint.
//!
//! Outbound bytes on the shaped leg are cut into fixed-size chunks, at most
//! `max_chunks` per frame, and staged per endpoint until the socket takes
//! them. Inbound bytes are reassembled chunk by chunk before they reach the
//! relay. The other leg passes through untouched.

use std::time::Duration;

use bytes::{Buf, BytesMut};

use super::padding::ChunkCodec;
use super::timing::TimingShaper;
use super::TrafficShaper;
use crate::endpoint::{DuplexEndpoint, Side, Transfer};
use crate::error::Result;

/// Ciphertext-side read size while reassembling.
const READ_CHUNK: usize = 16 * 1024;

/// Per-endpoint staging buffers.
#[derive(Debug, Default)]
pub struct ChunkBuffers {
    /// Raw bytes read from the wire, not yet a whole chunk
    pub(crate) inbound: BytesMut,
    /// Reassembled payload waiting for the relay
    pub(crate) decoded: BytesMut,
    /// Encoded chunks not yet accepted by the socket
    pub(crate) outbound: BytesMut,
}

/// Shaper that chunks, pads and paces one side of every endpoint.
#[derive(Debug, Clone)]
pub struct ChunkShaper {
    side: Side,
    codec: ChunkCodec,
    max_chunks: usize,
    timing: TimingShaper,
}

impl ChunkShaper {
    /// Shape `side` with `chunk_size`-byte chunks, up to `max_chunks` per
    /// frame, pacing frames by `timing`.
    pub fn new(side: Side, chunk_size: usize, max_chunks: usize, timing: TimingShaper) -> Result<Self> {
        Ok(Self {
            side,
            codec: ChunkCodec::new(chunk_size)?,
            max_chunks: max_chunks.max(1),
            timing,
        })
    }

    /// Leg this shaper applies to.
    pub fn side(&self) -> Side {
        self.side
    }

    /// Payload bytes one frame can carry.
    pub fn frame_capacity(&self) -> usize {
        self.codec.capacity() * self.max_chunks
    }

    fn read_shaped(&self, ep: &DuplexEndpoint, buf: &mut [u8]) -> Transfer {
        let mut staged = ep.chunk_buffers();
        let mut scratch = [0u8; READ_CHUNK];

        loop {
            if !staged.decoded.is_empty() {
                let n = buf.len().min(staged.decoded.len());
                buf[..n].copy_from_slice(&staged.decoded[..n]);
                staged.decoded.advance(n);
                return Transfer::Bytes(n);
            }

            match ep.read(self.side, &mut scratch) {
                Transfer::Bytes(n) => {
                    let staged = &mut *staged;
                    staged.inbound.extend_from_slice(&scratch[..n]);
                    if let Err(e) = self.codec.decode(&mut staged.inbound, &mut staged.decoded) {
                        tracing::debug!(id = ep.id(), "dropping corrupt stream: {}", e);
                        return Transfer::Closed;
                    }
                }
                other => return other,
            }
        }
    }

    fn write_shaped(&self, ep: &DuplexEndpoint, buf: &[u8]) -> Transfer {
        let mut staged = ep.chunk_buffers();

        // A new frame is only cut once the previous one is on the wire.
        match drain(ep, self.side, &mut staged.outbound) {
            Transfer::Bytes(_) => {}
            other => return other,
        }
        if buf.is_empty() {
            return Transfer::Bytes(0);
        }

        let mut taken = 0;
        for _ in 0..self.max_chunks {
            if taken == buf.len() {
                break;
            }
            taken += self.codec.encode(&buf[taken..], &mut staged.outbound);
        }

        match drain(ep, self.side, &mut staged.outbound) {
            Transfer::Closed => Transfer::Closed,
            _ => Transfer::Bytes(taken),
        }
    }
}

/// Write staged bytes until empty. `Bytes(0)` once everything is out.
fn drain(ep: &DuplexEndpoint, side: Side, outbound: &mut BytesMut) -> Transfer {
    while !outbound.is_empty() {
        match ep.write(side, outbound) {
            Transfer::Bytes(0) => return Transfer::Pending,
            Transfer::Bytes(n) => outbound.advance(n),
            other => return other,
        }
    }
    Transfer::Bytes(0)
}

impl TrafficShaper for ChunkShaper {
    fn read_msg_client(&self, ep: &DuplexEndpoint, buf: &mut [u8]) -> Transfer {
        match self.side {
            Side::Client => self.read_shaped(ep, buf),
            Side::Bridge => ep.read(Side::Client, buf),
        }
    }

    fn write_msg_client(&self, ep: &DuplexEndpoint, buf: &[u8]) -> Transfer {
        match self.side {
            Side::Client => self.write_shaped(ep, buf),
            Side::Bridge => ep.write(Side::Client, buf),
        }
    }

    fn read_msg_bridge(&self, ep: &DuplexEndpoint, buf: &mut [u8]) -> Transfer {
        match self.side {
            Side::Bridge => self.read_shaped(ep, buf),
            Side::Client => ep.read(Side::Bridge, buf),
        }
    }

    fn write_msg_bridge(&self, ep: &DuplexEndpoint, buf: &[u8]) -> Transfer {
        match self.side {
            Side::Bridge => self.write_shaped(ep, buf),
            Side::Client => ep.write(Side::Bridge, buf),
        }
    }

    fn flush(&self, ep: &DuplexEndpoint, side: Side) -> Transfer {
        if side == self.side {
            let mut staged = ep.chunk_buffers();
            match drain(ep, side, &mut staged.outbound) {
                Transfer::Bytes(_) => {}
                other => return other,
            }
        }
        ep.flush(side)
    }

    fn write_chaff(&self, ep: &DuplexEndpoint, side: Side) -> Transfer {
        if side != self.side {
            return Transfer::Bytes(0);
        }
        let mut staged = ep.chunk_buffers();
        match drain(ep, side, &mut staged.outbound) {
            Transfer::Bytes(_) => {}
            other => return other,
        }
        for _ in 0..self.max_chunks {
            self.codec.encode_chaff(&mut staged.outbound);
        }
        match drain(ep, side, &mut staged.outbound) {
            Transfer::Closed => Transfer::Closed,
            _ => Transfer::Bytes(0),
        }
    }

    fn pacing_delay(&self, side: Side) -> Option<Duration> {
        (side == self.side && self.timing.is_enabled()).then(|| self.timing.next_delay())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    fn shaper(side: Side) -> ChunkShaper {
        ChunkShaper::new(side, 8, 2, TimingShaper::new(10, 20)).unwrap()
    }

    async fn read_ready(shaper: &ChunkShaper, ep: &DuplexEndpoint, buf: &mut [u8]) -> Transfer {
        for _ in 0..100 {
            ep.readable(Side::Bridge).await.unwrap();
            match shaper.read_msg_bridge(ep, buf) {
                Transfer::Pending => continue,
                other => return other,
            }
        }
        Transfer::Pending
    }

    #[tokio::test]
    async fn test_write_cuts_one_frame() {
        let (bridge, mut remote) = socket_pair().await;
        let ep = DuplexEndpoint::prewired(bridge.into());
        let shaper = shaper(Side::Bridge);

        // Two 6-byte chunks per frame; the rest waits for the next call.
        assert_eq!(shaper.write_msg_bridge(&ep, b"0123456789abcdef"), Transfer::Bytes(12));
        assert_eq!(shaper.flush(&ep, Side::Bridge), Transfer::Bytes(0));

        let mut wire = [0u8; 16];
        remote.read_exact(&mut wire).await.unwrap();
        assert_eq!(&wire[..2], &[0, 6]);
        assert_eq!(&wire[2..8], b"012345");
        assert_eq!(&wire[8..10], &[0, 6]);
        assert_eq!(&wire[10..16], b"6789ab");
    }

    #[tokio::test]
    async fn test_read_reassembles_and_drops_chaff() {
        let (bridge, mut remote) = socket_pair().await;
        let ep = DuplexEndpoint::prewired(bridge.into());
        let shaper = shaper(Side::Bridge);
        let codec = ChunkCodec::new(8).unwrap();

        let mut wire = BytesMut::new();
        codec.encode_chaff(&mut wire);
        codec.encode(b"hello", &mut wire);
        remote.write_all(&wire[..11]).await.unwrap();

        let mut buf = [0u8; 32];
        assert_eq!(shaper.read_msg_bridge(&ep, &mut buf), Transfer::Pending);

        remote.write_all(&wire[11..]).await.unwrap();
        assert_eq!(read_ready(&shaper, &ep, &mut buf).await, Transfer::Bytes(5));
        assert_eq!(&buf[..5], b"hello");
    }

    #[tokio::test]
    async fn test_unshaped_side_passes_through() {
        let (client, mut remote) = socket_pair().await;
        let ep = DuplexEndpoint::new(client.into());
        let shaper = shaper(Side::Bridge);

        assert_eq!(shaper.write_msg_client(&ep, b"raw"), Transfer::Bytes(3));
        let mut got = [0u8; 3];
        remote.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"raw");
        assert_eq!(shaper.pacing_delay(Side::Client), None);
        assert!(shaper.pacing_delay(Side::Bridge).is_some());
    }

    #[tokio::test]
    async fn test_chaff_frame() {
        let (bridge, mut remote) = socket_pair().await;
        let ep = DuplexEndpoint::prewired(bridge.into());
        let shaper = shaper(Side::Bridge);

        assert_eq!(shaper.write_chaff(&ep, Side::Bridge), Transfer::Bytes(0));
        let mut wire = [0u8; 16];
        remote.read_exact(&mut wire).await.unwrap();
        assert_eq!(&wire[..2], &[0, 0]);
        assert_eq!(&wire[8..10], &[0, 0]);
    }

    #[tokio::test]
    async fn test_corrupt_stream_closes() {
        let (bridge, mut remote) = socket_pair().await;
        let ep = DuplexEndpoint::prewired(bridge.into());
        let shaper = shaper(Side::Bridge);

        remote.write_all(&[0xFF, 0xFF, 0, 0, 0, 0, 0, 0]).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(read_ready(&shaper, &ep, &mut buf).await, Transfer::Closed);
    }

    #[tokio::test]
    async fn test_vacant_side_is_closed() {
        let (client, _remote) = socket_pair().await;
        let ep = DuplexEndpoint::new(client.into());
        let shaper = shaper(Side::Bridge);

        let mut buf = [0u8; 8];
        assert_eq!(shaper.read_msg_bridge(&ep, &mut buf), Transfer::Closed);
        assert_eq!(shaper.write_msg_bridge(&ep, b"x"), Transfer::Closed);
    }
}
