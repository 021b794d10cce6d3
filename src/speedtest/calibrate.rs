use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::coordinator::StreamReporter;
use super::error::{Result, SpeedTestError};
use super::mbps;
use super::transport::Transport;

/// One small fixed-size download whose only purpose is to pick a plan.
/// The number it produces is never shown as a result.
pub struct CalibrationEstimator {
    bytes: u64,
    fallback_mbps: f64,
    timeout: Duration,
}

impl CalibrationEstimator {
    pub fn new(bytes: u64, fallback_mbps: f64, timeout: Duration) -> Self {
        Self {
            bytes,
            fallback_mbps,
            timeout,
        }
    }

    /// Rough link speed in Mbps. Transport failures and timeouts yield the
    /// fallback estimate; only cancellation is returned as an error.
    pub async fn estimate(&self, transport: &dyn Transport, cancel: &CancellationToken) -> Result<f64> {
        let start = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SpeedTestError::Cancelled),
            outcome = tokio::time::timeout(
                self.timeout,
                transport.download(self.bytes, StreamReporter::detached()),
            ) => outcome,
        };
        let elapsed = start.elapsed().as_secs_f64();

        let estimate = match outcome {
            Ok(Ok(received)) if received > 0 && elapsed > 0.0 => mbps(received, elapsed),
            Ok(Ok(_)) => {
                warn!("calibration returned no data, using fallback");
                self.fallback_mbps
            }
            Ok(Err(e)) => {
                let err = SpeedTestError::Calibration(e.to_string());
                warn!(error = %err, "using fallback estimate");
                self.fallback_mbps
            }
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "calibration timed out, using fallback");
                self.fallback_mbps
            }
        };

        info!(estimated_mbps = estimate, "calibration finished");
        Ok(estimate)
    }
}
