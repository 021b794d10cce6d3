//! Error taxonomy for the measurement engine.

use thiserror::Error;

use super::{Direction, TestPhase};

#[derive(Error, Debug)]
pub enum SpeedTestError {
    /// A single latency probe was lost. Never fatal, the sample is dropped.
    #[error("latency probe failed: {0}")]
    Probe(String),

    /// Calibration transfer failed. The estimator falls back to a default.
    #[error("calibration transfer failed: {0}")]
    Calibration(String),

    #[error("stream {stream} transport failure: {reason}")]
    StreamTransport { stream: usize, reason: String },

    #[error("stream {stream} timed out")]
    StreamTimeout { stream: usize },

    #[error("{direction} endpoint unreachable")]
    EndpointUnreachable { direction: Direction },

    #[error("test cancelled")]
    Cancelled,

    #[error("a test is already running (phase: {phase:?})")]
    Busy { phase: TestPhase },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, SpeedTestError>;
