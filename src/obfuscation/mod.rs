//! Traffic-shaping boundary.
//!
//! The relay loop moves bytes only through a [`TrafficShaper`]. Every call
//! keeps the endpoint's tri-state [`Transfer`] contract, so the relay never
//! needs to know whether a leg is chunked, padded or paced.
//!
//! ```text
//!   client leg                                        bridge leg
//!  ┌──────────┐  read_msg_client   ┌───────┐  write_msg_bridge  ┌──────────┐
//!  │  Tor /   │ ─────────────────▶ │ relay │ ─────────────────▶ │  bridge  │
//!  │  app     │ ◀───────────────── │       │ ◀───────────────── │  (TLS)   │
//!  └──────────┘  write_msg_client  └───────┘  read_msg_bridge   └──────────┘
//! ```
//!
//! Two implementations ship: [`Passthrough`] and the chunking
//! [`ChunkShaper`].

mod chunk;
mod padding;
mod timing;

pub use chunk::{ChunkBuffers, ChunkShaper};
pub use padding::{ChunkCodec, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
pub use timing::TimingShaper;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::endpoint::{DuplexEndpoint, Side, Transfer};
use crate::error::{Error, Result};

/// Byte transfer surface used by the relay loop.
pub trait TrafficShaper: Send + Sync {
    /// Read decoded bytes from the client leg.
    fn read_msg_client(&self, ep: &DuplexEndpoint, buf: &mut [u8]) -> Transfer {
        ep.read(Side::Client, buf)
    }

    /// Write bytes to the client leg.
    fn write_msg_client(&self, ep: &DuplexEndpoint, buf: &[u8]) -> Transfer {
        ep.write(Side::Client, buf)
    }

    /// Read decoded bytes from the bridge leg.
    fn read_msg_bridge(&self, ep: &DuplexEndpoint, buf: &mut [u8]) -> Transfer {
        ep.read(Side::Bridge, buf)
    }

    /// Write bytes to the bridge leg.
    fn write_msg_bridge(&self, ep: &DuplexEndpoint, buf: &[u8]) -> Transfer {
        ep.write(Side::Bridge, buf)
    }

    /// Push out anything staged for `side`. `Bytes(0)` when fully drained.
    fn flush(&self, ep: &DuplexEndpoint, side: Side) -> Transfer {
        ep.flush(side)
    }

    /// Emit one frame of chaff on `side`, if this shaper produces any.
    fn write_chaff(&self, _ep: &DuplexEndpoint, _side: Side) -> Transfer {
        Transfer::Bytes(0)
    }

    /// Delay to observe after each frame written to `side`.
    fn pacing_delay(&self, _side: Side) -> Option<Duration> {
        None
    }

    /// Side-indexed read.
    fn read_msg(&self, ep: &DuplexEndpoint, side: Side, buf: &mut [u8]) -> Transfer {
        match side {
            Side::Client => self.read_msg_client(ep, buf),
            Side::Bridge => self.read_msg_bridge(ep, buf),
        }
    }

    /// Side-indexed write.
    fn write_msg(&self, ep: &DuplexEndpoint, side: Side, buf: &[u8]) -> Transfer {
        match side {
            Side::Client => self.write_msg_client(ep, buf),
            Side::Bridge => self.write_msg_bridge(ep, buf),
        }
    }
}

/// Moves bytes straight through to the endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl TrafficShaper for Passthrough {}

/// Shaping parameters (`[shaping]` in the config file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapingConfig {
    /// Chunk and pace the bridge link
    pub enabled: bool,
    /// Bytes per chunk on the wire, length prefix included
    pub chunk_size: usize,
    /// Chunks per frame
    pub max_chunks: usize,
    /// Lower pacing bound between frames (microseconds)
    pub ts_min_us: u64,
    /// Upper pacing bound between frames (microseconds, exclusive)
    pub ts_max_us: u64,
}

impl Default for ShapingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_size: 3125,
            max_chunks: 1,
            ts_min_us: 5_000,
            ts_max_us: 15_000,
        }
    }
}

impl ShapingConfig {
    /// Check parameter consistency.
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(Error::config(format!(
                "shaping.chunk_size must be within {}..={}",
                MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            )));
        }
        if self.max_chunks == 0 {
            return Err(Error::config("shaping.max_chunks must be at least 1"));
        }
        if self.ts_min_us > self.ts_max_us {
            return Err(Error::config("shaping.ts_min_us exceeds shaping.ts_max_us"));
        }
        Ok(())
    }

    /// Shaper for a frontend whose bridge link is `side`.
    pub fn build(&self, side: Side) -> Result<Arc<dyn TrafficShaper>> {
        if !self.enabled {
            return Ok(Arc::new(Passthrough));
        }
        self.validate()?;
        let timing = TimingShaper::new(self.ts_min_us, self.ts_max_us);
        Ok(Arc::new(ChunkShaper::new(side, self.chunk_size, self.max_chunks, timing)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ShapingConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.build(Side::Bridge).is_ok());
    }

    #[test]
    fn test_disabled_builds_passthrough() {
        let config = ShapingConfig {
            enabled: false,
            chunk_size: 0,
            ..Default::default()
        };
        let shaper = config.build(Side::Bridge).unwrap();
        assert_eq!(shaper.pacing_delay(Side::Bridge), None);
    }

    #[test]
    fn test_invalid_parameters() {
        let small = ShapingConfig {
            chunk_size: 2,
            ..Default::default()
        };
        assert!(matches!(small.validate(), Err(Error::Config(_))));

        let inverted = ShapingConfig {
            ts_min_us: 20,
            ts_max_us: 10,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());

        let empty_frame = ShapingConfig {
            max_chunks: 0,
            ..Default::default()
        };
        assert!(empty_frame.build(Side::Bridge).is_err());
    }
}
