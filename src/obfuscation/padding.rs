//! Fixed-size chunk framing.
//!
//! Every chunk on the wire has exactly `chunk_size` bytes:
//!
//! ```text
//! +--------+--------+-----------------+---------------------+
//! | len hi | len lo | payload (len)   | random padding      |
//! +--------+--------+-----------------+---------------------+
//! |<------------------------ chunk_size ------------------->|
//! ```
//!
//! A chunk with `len == 0` carries no payload and is chaff.

use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;

use crate::error::{Error, Result};

/// Length prefix size.
pub const LEN_PREFIX: usize = 2;

/// Smallest usable chunk: the prefix plus one payload byte.
pub const MIN_CHUNK_SIZE: usize = LEN_PREFIX + 1;

/// Largest chunk whose payload length still fits the 16-bit prefix.
pub const MAX_CHUNK_SIZE: usize = u16::MAX as usize + LEN_PREFIX;

/// Encoder/decoder for fixed-size padded chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCodec {
    chunk_size: usize,
}

impl ChunkCodec {
    /// Codec for `chunk_size`-byte chunks. Sizes outside
    /// [`MIN_CHUNK_SIZE`]..=[`MAX_CHUNK_SIZE`] are rejected.
    pub fn new(chunk_size: usize) -> Result<Self> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            return Err(Error::config(format!(
                "chunk size {} outside {}..={}",
                chunk_size, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            )));
        }
        Ok(Self { chunk_size })
    }

    /// Bytes per chunk on the wire.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Payload bytes one chunk can carry.
    pub fn capacity(&self) -> usize {
        self.chunk_size - LEN_PREFIX
    }

    /// Append one chunk carrying up to `capacity()` bytes of `payload`.
    /// Returns the number of payload bytes taken.
    pub fn encode(&self, payload: &[u8], out: &mut BytesMut) -> usize {
        let len = payload.len().min(self.capacity());
        out.reserve(self.chunk_size);
        out.put_u16(len as u16);
        out.put_slice(&payload[..len]);

        let padding_len = self.capacity() - len;
        if padding_len > 0 {
            let start = out.len();
            out.resize(start + padding_len, 0);
            rand::thread_rng().fill_bytes(&mut out[start..]);
        }
        len
    }

    /// Append a chunk with no payload.
    pub fn encode_chaff(&self, out: &mut BytesMut) {
        self.encode(&[], out);
    }

    /// Move the payload of every complete chunk in `input` to `output`.
    ///
    /// Partial chunks stay in `input`. Chaff is dropped. Returns the number of
    /// payload bytes appended; a length prefix larger than the capacity means
    /// the stream is corrupt.
    pub fn decode(&self, input: &mut BytesMut, output: &mut BytesMut) -> Result<usize> {
        let mut decoded = 0;
        while input.len() >= self.chunk_size {
            let len = u16::from_be_bytes([input[0], input[1]]) as usize;
            if len > self.capacity() {
                return Err(Error::protocol(format!(
                    "chunk payload length {} exceeds capacity {}",
                    len,
                    self.capacity()
                )));
            }
            output.extend_from_slice(&input[LEN_PREFIX..LEN_PREFIX + len]);
            input.advance(self.chunk_size);
            decoded += len;
        }
        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_bounds() {
        assert!(ChunkCodec::new(2).is_err());
        assert!(ChunkCodec::new(MIN_CHUNK_SIZE).is_ok());
        assert!(ChunkCodec::new(MAX_CHUNK_SIZE).is_ok());
        assert!(ChunkCodec::new(MAX_CHUNK_SIZE + 1).is_err());
    }

    #[test]
    fn test_chunk_format() {
        let codec = ChunkCodec::new(16).unwrap();
        let mut out = BytesMut::new();

        assert_eq!(codec.encode(b"test", &mut out), 4);
        assert_eq!(out.len(), 16);
        assert_eq!(&out[..2], &[0x00, 0x04]);
        assert_eq!(&out[2..6], b"test");
    }

    #[test]
    fn test_encode_truncates_to_capacity() {
        let codec = ChunkCodec::new(8).unwrap();
        let mut out = BytesMut::new();

        assert_eq!(codec.encode(b"0123456789", &mut out), 6);
        assert_eq!(out.len(), 8);
        assert_eq!(&out[2..], b"012345");
    }

    #[test]
    fn test_decode_keeps_partial_chunk() {
        let codec = ChunkCodec::new(8).unwrap();
        let mut wire = BytesMut::new();
        codec.encode(b"abc", &mut wire);
        codec.encode(b"def", &mut wire);
        wire.truncate(12);

        let mut out = BytesMut::new();
        assert_eq!(codec.decode(&mut wire, &mut out).unwrap(), 3);
        assert_eq!(&out[..], b"abc");
        assert_eq!(wire.len(), 4);
    }

    #[test]
    fn test_decode_drops_chaff() {
        let codec = ChunkCodec::new(8).unwrap();
        let mut wire = BytesMut::new();
        codec.encode_chaff(&mut wire);
        codec.encode(b"xy", &mut wire);
        codec.encode_chaff(&mut wire);

        let mut out = BytesMut::new();
        assert_eq!(codec.decode(&mut wire, &mut out).unwrap(), 2);
        assert_eq!(&out[..], b"xy");
        assert!(wire.is_empty());
    }

    #[test]
    fn test_decode_rejects_oversize_length() {
        let codec = ChunkCodec::new(8).unwrap();
        let mut wire = BytesMut::from(&[0x00, 0x07, 0, 0, 0, 0, 0, 0][..]);
        let mut out = BytesMut::new();
        assert!(codec.decode(&mut wire, &mut out).is_err());
    }

    #[test]
    fn test_padding_is_random() {
        let codec = ChunkCodec::new(256).unwrap();
        let mut a = BytesMut::new();
        let mut b = BytesMut::new();
        codec.encode(b"same", &mut a);
        codec.encode(b"same", &mut b);
        assert_eq!(&a[..6], &b[..6]);
        assert_ne!(&a[6..], &b[6..]);
    }
}
