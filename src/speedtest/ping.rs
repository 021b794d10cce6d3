use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{Result, SpeedTestError};
use super::transport::Transport;

/// Sequential round-trip prober.
///
/// Probes never overlap: with more than one outstanding request the timing
/// would no longer describe a single round trip.
pub struct LatencyProbe {
    samples: Vec<f64>,
    ping_count: usize,
    ceiling: Duration,
}

impl LatencyProbe {
    pub fn new(ping_count: usize, ceiling: Duration) -> Self {
        Self {
            samples: Vec::with_capacity(ping_count),
            ping_count,
            ceiling,
        }
    }

    /// Runs `ping_count` probes. Lost or over-ceiling probes are dropped;
    /// `on_sample` sees every surviving sample in order.
    pub async fn measure<F>(
        &mut self,
        transport: &dyn Transport,
        cancel: &CancellationToken,
        mut on_sample: F,
    ) -> Result<PingResult>
    where
        F: FnMut(f64) + Send,
    {
        self.samples.clear();

        for i in 0..self.ping_count {
            if cancel.is_cancelled() {
                return Err(SpeedTestError::Cancelled);
            }

            let nonce: u64 = rand::random();
            let start = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SpeedTestError::Cancelled),
                outcome = transport.probe(nonce) => outcome,
            };
            let elapsed = start.elapsed();

            match outcome {
                Ok(()) if elapsed > self.ceiling => {
                    debug!(probe = i, elapsed_ms = elapsed.as_millis() as u64, "probe over ceiling, dropped");
                }
                Ok(()) => {
                    let ms = elapsed.as_secs_f64() * 1000.0;
                    self.samples.push(ms);
                    on_sample(ms);
                }
                Err(e) => warn!(probe = i, error = %e, "latency probe lost"),
            }
        }

        Ok(PingResult::from_samples(&self.samples))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PingResult {
    /// `None` when no probe survived.
    pub minimum_ms: Option<f64>,
    pub jitter_ms: f64,
    pub samples: Vec<f64>,
}

impl PingResult {
    /// Jitter is the mean absolute difference between chronologically
    /// adjacent samples, zero for fewer than two.
    pub fn from_samples(samples: &[f64]) -> Self {
        let minimum_ms = samples.iter().copied().reduce(f64::min);

        let jitter_ms = if samples.len() > 1 {
            let deltas: f64 = samples.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
            deltas / (samples.len() - 1) as f64
        } else {
            0.0
        };

        Self {
            minimum_ms,
            jitter_ms,
            samples: samples.to_vec(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.minimum_ms.is_some()
    }
}
