//! Adaptive multi-stream internet speed test.
//!
//! The [`speedtest`] module holds the measurement engine: latency probing,
//! a calibration transfer that picks a payload/parallelism plan, and a
//! coordinator that drives parallel transfers while aggregating their
//! progress into one live throughput reading. A front end consumes it
//! through [`speedtest::session::SessionObserver`].

pub mod settings;
pub mod speedtest;
