pub mod calibrate;
pub mod coordinator;
pub mod error;
pub mod ping;
pub mod planner;
pub mod sampler;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

use std::fmt;

pub use error::{Result, SpeedTestError};

/// Final values handed to the UI once a run reaches `Complete`.
///
/// Latency fields are `None` when no probe survived; the UI renders a
/// sentinel for them instead of a number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestSummary {
    pub ping_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub download_peak_mbps: f64,
    pub upload_peak_mbps: f64,
    pub download_bytes: u64,
    pub upload_bytes: u64,
    pub estimated_mbps: f64,
    pub band: Option<planner::Band>,
}

/// Session state machine. `Idle`, `Complete` and `Error` are the only
/// states a new run may start from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPhase {
    Idle,
    Ping,
    Calibrate,
    Download,
    Upload,
    Complete,
    Error,
}

impl TestPhase {
    pub fn is_in_flight(self) -> bool {
        !matches!(self, TestPhase::Idle | TestPhase::Complete | TestPhase::Error)
    }

    pub fn label(self) -> &'static str {
        match self {
            TestPhase::Idle => "IDLE",
            TestPhase::Ping => "PING",
            TestPhase::Calibrate => "CALIBRATE",
            TestPhase::Download => "DOWNLOAD",
            TestPhase::Upload => "UPLOAD",
            TestPhase::Complete => "COMPLETE",
            TestPhase::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => f.write_str("download"),
            Direction::Upload => f.write_str("upload"),
        }
    }
}

/// Throughput in megabits per second for `bytes` moved over `secs`.
pub fn mbps(bytes: u64, secs: f64) -> f64 {
    if secs <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / secs / 1_000_000.0
}
