use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use super::mbps;

/// One aggregate reading across all streams of a direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateSample {
    pub elapsed_secs: f64,
    pub total_bytes: u64,
    pub mbps: f64,
}

/// Turns cumulative byte counts into a throughput reading.
///
/// Readings taken before the settling window has elapsed are suppressed:
/// with elapsed time near zero the division blows up.
#[derive(Debug, Clone, Copy)]
pub struct RateSampler {
    start: Instant,
    settling: Duration,
}

impl RateSampler {
    pub fn new(start: Instant, settling: Duration) -> Self {
        Self { start, settling }
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.start)
    }

    /// Returns `None` until `now - start` strictly exceeds the settling window.
    pub fn sample(&self, total_bytes: u64, now: Instant) -> Option<AggregateSample> {
        let elapsed = self.elapsed(now);
        if elapsed <= self.settling {
            return None;
        }

        let secs = elapsed.as_secs_f64();
        Some(AggregateSample {
            elapsed_secs: secs,
            total_bytes,
            mbps: mbps(total_bytes, secs),
        })
    }

    /// Whole-run reading, not gated by the settling window.
    pub fn finish(&self, total_bytes: u64, now: Instant) -> AggregateSample {
        let secs = self.elapsed(now).as_secs_f64();
        AggregateSample {
            elapsed_secs: secs,
            total_bytes,
            mbps: mbps(total_bytes, secs),
        }
    }
}

/// Sliding window of recent mbps values for the live chart.
///
/// Length never changes: every push drops the oldest slot.
#[derive(Debug, Clone, PartialEq)]
pub struct RateSeries {
    values: VecDeque<f64>,
}

impl RateSeries {
    pub fn new(len: usize) -> Self {
        Self {
            values: std::iter::repeat(0.0).take(len.max(1)).collect(),
        }
    }

    pub fn push(&mut self, mbps: f64) {
        self.values.pop_front();
        self.values.push_back(mbps);
    }

    pub fn reset(&mut self) {
        self.values.iter_mut().for_each(|v| *v = 0.0);
    }

    pub fn latest(&self) -> f64 {
        self.values.back().copied().unwrap_or(0.0)
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }
}
