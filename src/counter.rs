//! Small rate/throughput bookkeeping shared by peer sessions, [`crate::torrent`]
//! and [`crate::session`].
//!
//! Nothing here is BitTorrent-specific: it's the same shape as the `Stats`
//! struct in [`crate::disk::io`] (a handful of running totals updated from
//! the hot path), generalized into a reusable type so the unchoke
//! comparator, the per-torrent activity-time accounting, and session-wide
//! stats don't each reinvent it.

/// Tracks a byte counter's lifetime total alongside a smoothed per-second
/// rate, updated once per tick.
///
/// The rate is an exponential moving average (EWMA) rather than an exact
/// sliding window: cheap to update (one multiply-add per tick), and stable
/// enough for unchoke ranking and progress reporting, which don't need
/// sub-second precision.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ThroughputCounter {
    /// Lifetime total, regardless of ticking.
    total: u64,
    /// Bytes accumulated since the last `tick`.
    pending: u64,
    /// Smoothed bytes/second.
    rate: f64,
}

/// Weight given to the most recent second's throughput when folding it into
/// the running average. Higher reacts faster to bursts; lower is steadier.
/// libtorrent-style clients commonly use something in this range for
/// transfer rate smoothing.
const EWMA_ALPHA: f64 = 0.3;

impl ThroughputCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `n` bytes transferred since the last tick.
    pub fn add(&mut self, n: usize) {
        self.pending += n as u64;
        self.total += n as u64;
    }

    /// Folds the bytes accumulated since the last call into the smoothed
    /// rate and resets the per-tick accumulator. Should be called at a
    /// steady cadence (the session's ~1 Hz tick).
    pub fn tick(&mut self) -> f64 {
        let sample = self.pending as f64;
        self.rate = EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * self.rate;
        self.pending = 0;
        self.rate
    }

    /// The most recently computed smoothed rate, in bytes/second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Lifetime total bytes recorded, independent of ticking.
    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_is_unaffected_by_ticking() {
        let mut counter = ThroughputCounter::new();
        counter.add(100);
        counter.tick();
        counter.add(50);
        assert_eq!(counter.total(), 150);
    }

    #[test]
    fn rate_converges_towards_steady_input() {
        let mut counter = ThroughputCounter::new();
        let mut rate = 0.0;
        for _ in 0..50 {
            counter.add(1000);
            rate = counter.tick();
        }
        assert!((rate - 1000.0).abs() < 1.0, "rate should converge near 1000, got {}", rate);
    }

    #[test]
    fn idle_tick_decays_rate_towards_zero() {
        let mut counter = ThroughputCounter::new();
        counter.add(1000);
        counter.tick();
        let before = counter.rate();
        let after = counter.tick();
        assert!(after < before);
    }
}
