//! Inter-frame pacing.
//!
//! After each frame the shaped side waits a delay drawn uniformly from
//! `[min_us, max_us)`, masking the timing of the carried stream.

use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;

/// Pacing delay source for one shaped leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingShaper {
    min_us: u64,
    max_us: u64,
}

impl TimingShaper {
    /// Delays in `[min_us, max_us)`. Bounds given in the wrong order are
    /// swapped; equal bounds give a constant delay.
    pub fn new(min_us: u64, max_us: u64) -> Self {
        Self {
            min_us: min_us.min(max_us),
            max_us: min_us.max(max_us),
        }
    }

    /// No pacing at all.
    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    /// Whether any delay is ever produced.
    pub fn is_enabled(&self) -> bool {
        self.max_us > 0
    }

    /// Next delay in microseconds.
    pub fn calculate_delay(&self) -> u64 {
        if self.max_us > self.min_us {
            rand::thread_rng().gen_range(self.min_us..self.max_us)
        } else {
            self.min_us
        }
    }

    /// Next delay as a `Duration`.
    pub fn next_delay(&self) -> Duration {
        Duration::from_micros(self.calculate_delay())
    }

    /// Sleep for the next delay.
    pub async fn delay(&self) {
        let delay_us = self.calculate_delay();
        if delay_us > 0 {
            sleep(Duration::from_micros(delay_us)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_delay_within_bounds() {
        let shaper = TimingShaper::new(5_000, 15_000);

        let mut delays = HashSet::new();
        for _ in 0..200 {
            let delay = shaper.calculate_delay();
            assert!((5_000..15_000).contains(&delay));
            delays.insert(delay);
        }
        assert!(delays.len() > 1);
    }

    #[test]
    fn test_constant_and_disabled() {
        assert_eq!(TimingShaper::new(700, 700).calculate_delay(), 700);
        assert_eq!(TimingShaper::disabled().calculate_delay(), 0);
        assert!(!TimingShaper::disabled().is_enabled());
    }

    #[test]
    fn test_swapped_bounds() {
        let shaper = TimingShaper::new(20, 10);
        for _ in 0..50 {
            assert!((10..20).contains(&shaper.calculate_delay()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_sleeps() {
        let shaper = TimingShaper::new(1_000, 1_000);
        let start = tokio::time::Instant::now();
        shaper.delay().await;
        assert_eq!(start.elapsed(), Duration::from_millis(1));
    }
}
