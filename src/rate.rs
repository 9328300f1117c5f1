//! Per-direction byte counters and rate estimates.
//!
//! A [`RateTracker`] belongs to exactly one session direction. Times are
//! expressed as the elapsed [`Duration`] since the session became active, so
//! the tracker itself never reads a clock.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Weight of the newest sample in the rolling (EWMA) rate.
pub const EWMA_WEIGHT: f64 = 0.2;

/// Bits per second to megabits (2^20 bits) per second.
pub fn to_mbps(bits_per_sec: f64) -> f64 {
    bits_per_sec / 1024.0 / 1024.0
}

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Data direction relative to this end of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("READ"),
            Direction::Write => f.write_str("WRITE"),
        }
    }
}

// ---------------------------------------------------------------------------
// RateReport / DirectionTotals
// ---------------------------------------------------------------------------

/// Periodic rate sample for one direction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateReport {
    pub direction: Direction,
    /// Rate over the interval since the previous sample, bits/sec.
    pub current_bps: f64,
    /// EWMA of `current_bps`, bits/sec.
    pub rolling_bps: f64,
    /// Cumulative bytes over total elapsed time, bits/sec.
    pub all_time_bps: f64,
    /// Seconds since the session became active.
    pub elapsed_secs: f64,
}

/// Final totals for one direction, as printed in the close summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectionTotals {
    /// Cumulative bytes moved.
    pub bytes: u64,
    /// Session duration, floored to the minimum elapsed time.
    pub seconds: f64,
    /// Whole bytes per second, rounded down.
    pub bytes_per_sec: u64,
    /// Megabits (2^20 bits) per second.
    pub megabits_per_sec: f64,
}

// ---------------------------------------------------------------------------
// RateTracker
// ---------------------------------------------------------------------------

/// Byte counter and rate estimator for one direction of one session.
#[derive(Debug, Clone)]
pub struct RateTracker {
    direction: Direction,
    cumulative_bytes: u64,
    /// `cumulative_bytes` at the previous report.
    last_sample_bytes: u64,
    /// Elapsed time at the previous report.
    last_sample_at: Duration,
    rolling_bps: Option<f64>,
}

impl RateTracker {
    /// A tracker with nothing recorded.
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            cumulative_bytes: 0,
            last_sample_bytes: 0,
            last_sample_at: Duration::ZERO,
            rolling_bps: None,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Bytes recorded so far.
    pub fn cumulative_bytes(&self) -> u64 {
        self.cumulative_bytes
    }

    /// `None` until the first report has been produced.
    pub fn rolling_bps(&self) -> Option<f64> {
        self.rolling_bps
    }

    /// Add `n` bytes to the running total.
    pub fn record_bytes(&mut self, n: u64) {
        self.cumulative_bytes = self.cumulative_bytes.saturating_add(n);
    }

    /// Produce a report if `interval` is set and strictly more than
    /// `interval` has passed since the last sample.
    ///
    /// `elapsed` is the time since the session became active.
    pub fn maybe_report(
        &mut self,
        elapsed: Duration,
        interval: Option<Duration>,
    ) -> Option<RateReport> {
        let interval = interval?;
        let dt = elapsed.checked_sub(self.last_sample_at)?;
        if dt <= interval || dt.is_zero() {
            return None;
        }

        let delta = self.cumulative_bytes - self.last_sample_bytes;
        let current_bps = 8.0 * delta as f64 / dt.as_secs_f64();
        let rolling_bps = match self.rolling_bps {
            None => current_bps,
            Some(prev) => (1.0 - EWMA_WEIGHT) * prev + EWMA_WEIGHT * current_bps,
        };
        self.rolling_bps = Some(rolling_bps);
        self.last_sample_bytes = self.cumulative_bytes;
        self.last_sample_at = elapsed;

        Some(RateReport {
            direction: self.direction,
            current_bps,
            rolling_bps,
            all_time_bps: 8.0 * self.cumulative_bytes as f64 / elapsed.as_secs_f64(),
            elapsed_secs: elapsed.as_secs_f64(),
        })
    }

    /// Totals over `elapsed`, which must be non-zero.
    pub fn totals(&self, elapsed: Duration) -> DirectionTotals {
        let seconds = elapsed.as_secs_f64();
        let bytes_per_sec = self.cumulative_bytes as f64 / seconds;
        DirectionTotals {
            bytes: self.cumulative_bytes,
            seconds,
            bytes_per_sec: bytes_per_sec.floor() as u64,
            megabits_per_sec: to_mbps(bytes_per_sec * 8.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6 * b.abs().max(1.0)
    }

    #[test]
    fn test_record_bytes_accumulates() {
        let mut tracker = RateTracker::new(Direction::Read);
        for n in [10, 0, 65536, 3] {
            tracker.record_bytes(n);
        }
        assert_eq!(tracker.cumulative_bytes(), 65549);
        assert!(tracker.rolling_bps().is_none());
    }

    #[test]
    fn test_no_report_without_interval() {
        let mut tracker = RateTracker::new(Direction::Write);
        tracker.record_bytes(1_000_000);
        assert!(tracker.maybe_report(Duration::from_secs(100), None).is_none());
    }

    #[test]
    fn test_no_report_until_interval_exceeded() {
        let mut tracker = RateTracker::new(Direction::Read);
        tracker.record_bytes(1000);
        assert!(tracker.maybe_report(Duration::from_millis(500), Some(SEC)).is_none());
        // Exactly the interval is not enough.
        assert!(tracker.maybe_report(SEC, Some(SEC)).is_none());
        assert!(tracker.rolling_bps().is_none());

        let report = tracker
            .maybe_report(Duration::from_millis(1001), Some(SEC))
            .expect("interval exceeded");
        assert_eq!(report.direction, Direction::Read);
        assert!(approx(report.elapsed_secs, 1.001));
    }

    #[test]
    fn test_sample_time_advances_after_report() {
        let mut tracker = RateTracker::new(Direction::Read);
        tracker.record_bytes(1000);
        assert!(tracker.maybe_report(Duration::from_secs(2), Some(SEC)).is_some());
        // Only 0.5s since the last sample.
        assert!(tracker.maybe_report(Duration::from_millis(2500), Some(SEC)).is_none());
        assert!(tracker.maybe_report(Duration::from_millis(3100), Some(SEC)).is_some());
    }

    #[test]
    fn test_first_report_seeds_rolling_rate() {
        let mut tracker = RateTracker::new(Direction::Write);
        tracker.record_bytes(250_000);
        let report = tracker.maybe_report(Duration::from_secs(2), Some(SEC)).unwrap();
        // 250_000 bytes over 2s = 1_000_000 bits/s.
        assert!(approx(report.current_bps, 1_000_000.0));
        assert!(approx(report.rolling_bps, 1_000_000.0));
        assert!(approx(report.all_time_bps, 1_000_000.0));
    }

    #[test]
    fn test_ewma_update_law() {
        let mut tracker = RateTracker::new(Direction::Read);

        // Sample 1: 125_000 bytes in 2s -> 500_000 bps.
        tracker.record_bytes(125_000);
        let first = tracker.maybe_report(Duration::from_secs(2), Some(SEC)).unwrap();
        assert!(approx(first.current_bps, 500_000.0));

        // Sample 2: 500_000 bytes in the next 2s -> 2_000_000 bps.
        tracker.record_bytes(500_000);
        let second = tracker.maybe_report(Duration::from_secs(4), Some(SEC)).unwrap();
        assert!(approx(second.current_bps, 2_000_000.0));
        assert!(approx(second.rolling_bps, 0.8 * 500_000.0 + 0.2 * 2_000_000.0));
        // 625_000 bytes over 4s.
        assert!(approx(second.all_time_bps, 1_250_000.0));
        assert_eq!(tracker.rolling_bps(), Some(second.rolling_bps));
    }

    #[test]
    fn test_idle_interval_reports_zero_current_rate() {
        let mut tracker = RateTracker::new(Direction::Read);
        tracker.record_bytes(1_000);
        tracker.maybe_report(Duration::from_secs(2), Some(SEC)).unwrap();
        let idle = tracker.maybe_report(Duration::from_secs(4), Some(SEC)).unwrap();
        assert_eq!(idle.current_bps, 0.0);
        assert!(idle.rolling_bps > 0.0);
    }

    #[test]
    fn test_totals() {
        let mut tracker = RateTracker::new(Direction::Read);
        tracker.record_bytes(3 * 1024 * 1024);
        let totals = tracker.totals(Duration::from_secs(2));
        assert_eq!(totals.bytes, 3 * 1024 * 1024);
        assert_eq!(totals.bytes_per_sec, 3 * 512 * 1024);
        assert!(approx(totals.megabits_per_sec, 12.0));
        assert!(approx(totals.seconds, 2.0));
    }

    #[test]
    fn test_to_mbps() {
        assert!(approx(to_mbps(1024.0 * 1024.0), 1.0));
    }
}
