//! Fan-out/fan-in of parallel transfers for one direction.
//!
//! Every stream runs as its own task and publishes [`StreamEvent`]s onto a
//! shared channel. The aggregator is the only reader; it keeps one counter
//! per stream and only ever updates a slot from that stream's own events.

use bytes::Bytes;
use rand::{RngCore, SeedableRng};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{Result, SpeedTestError};
use super::planner::TransferPlan;
use super::sampler::{AggregateSample, RateSampler};
use super::transport::Transport;
use super::Direction;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Cumulative bytes moved by `stream` so far.
    Progress { stream: usize, bytes: u64 },
    Finished { stream: usize, outcome: StreamOutcome },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed,
    /// Stopped by the transfer cap. Counts as a successful completion.
    Capped,
    Failed(String),
    TimedOut,
    Cancelled,
}

impl StreamOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StreamOutcome::Completed | StreamOutcome::Capped)
    }
}

impl fmt::Display for StreamOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamOutcome::Completed => f.write_str("completed"),
            StreamOutcome::Capped => f.write_str("stopped at transfer cap"),
            StreamOutcome::Failed(reason) => write!(f, "failed: {reason}"),
            StreamOutcome::TimedOut => f.write_str("timed out"),
            StreamOutcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Handle a transport uses to publish progress for exactly one stream.
#[derive(Debug, Clone)]
pub struct StreamReporter {
    stream: usize,
    tx: Option<mpsc::UnboundedSender<StreamEvent>>,
}

impl StreamReporter {
    pub fn new(stream: usize, tx: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self { stream, tx: Some(tx) }
    }

    /// A reporter nobody listens to, used for the calibration transfer.
    pub fn detached() -> Self {
        Self { stream: 0, tx: None }
    }

    pub fn stream(&self) -> usize {
        self.stream
    }

    pub fn is_detached(&self) -> bool {
        self.tx.is_none()
    }

    pub fn report(&self, cumulative: u64) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(StreamEvent::Progress {
                stream: self.stream,
                bytes: cumulative,
            });
        }
    }

    pub fn failure(&self, reason: impl fmt::Display) -> SpeedTestError {
        SpeedTestError::StreamTransport {
            stream: self.stream,
            reason: reason.to_string(),
        }
    }

    fn finish(&self, outcome: StreamOutcome) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(StreamEvent::Finished {
                stream: self.stream,
                outcome,
            });
        }
    }
}

/// What one direction's run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferReport {
    pub direction: Direction,
    /// Whole-run average over all streams.
    pub final_sample: AggregateSample,
    pub peak_mbps: f64,
    pub stream_bytes: Vec<u64>,
    pub completed: usize,
    pub failed: usize,
}

impl TransferReport {
    pub fn all_failed(&self) -> bool {
        self.completed == 0
    }

    /// No stream completed and not a single byte moved.
    pub fn is_unreachable(&self) -> bool {
        self.all_failed() && self.final_sample.total_bytes == 0
    }
}

pub struct StreamCoordinator {
    transport: Arc<dyn Transport>,
    settling: Duration,
    stream_timeout: Duration,
    transfer_cap: Option<Duration>,
}

impl StreamCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        settling: Duration,
        stream_timeout: Duration,
        transfer_cap: Option<Duration>,
    ) -> Self {
        Self {
            transport,
            settling,
            stream_timeout,
            transfer_cap,
        }
    }

    /// Runs `plan.stream_count` transfers in parallel and resolves once every
    /// stream has finished, failed, timed out or been capped.
    ///
    /// `on_rate` receives an aggregate sample on every progress event past
    /// the settling window, then one closing sample with `mbps == 0`.
    pub async fn run<F>(
        &self,
        direction: Direction,
        plan: &TransferPlan,
        cancel: &CancellationToken,
        mut on_rate: F,
    ) -> Result<TransferReport>
    where
        F: FnMut(AggregateSample) + Send,
    {
        let stream_count = plan.stream_count.max(1);
        let payload_bytes = plan.payload_bytes(direction);
        let payload = match direction {
            Direction::Upload => {
                let len = payload_bytes as usize;
                Some(tokio::task::spawn_blocking(move || generate_payload(len)).await?)
            }
            Direction::Download => None,
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let start = Instant::now();
        let sampler = RateSampler::new(start, self.settling);
        let deadline = self.transfer_cap.map(|cap| start + cap);

        info!(%direction, streams = stream_count, payload_bytes, "starting transfer");

        let mut tasks = JoinSet::new();
        for stream in 0..stream_count {
            let transport = Arc::clone(&self.transport);
            let reporter = StreamReporter::new(stream, tx.clone());
            let cancel = cancel.clone();
            let payload = payload.clone();
            let timeout = self.stream_timeout;

            tasks.spawn(async move {
                let transfer = async {
                    match payload {
                        Some(body) => transport.upload(body, reporter.clone()).await,
                        None => transport.download(payload_bytes, reporter.clone()).await,
                    }
                };

                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => StreamOutcome::Cancelled,
                    _ = wait_for_deadline(deadline) => StreamOutcome::Capped,
                    result = tokio::time::timeout(timeout, transfer) => {
                        match result.unwrap_or_else(|_| Err(SpeedTestError::StreamTimeout { stream })) {
                            Ok(_) => StreamOutcome::Completed,
                            Err(SpeedTestError::StreamTimeout { .. }) => StreamOutcome::TimedOut,
                            Err(e) => StreamOutcome::Failed(e.to_string()),
                        }
                    }
                };
                reporter.finish(outcome);
            });
        }
        drop(tx);

        let mut counters = vec![0u64; stream_count];
        let mut finished = vec![false; stream_count];
        let mut finished_count = 0;
        let mut completed = 0;
        let mut failed = 0;
        let mut cancelled = false;
        let mut peak_mbps: f64 = 0.0;

        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Progress { stream, bytes } => {
                    if finished.get(stream).copied().unwrap_or(true) {
                        continue;
                    }
                    if bytes <= counters[stream] {
                        continue;
                    }
                    counters[stream] = bytes;

                    let total: u64 = counters.iter().sum();
                    if let Some(sample) = sampler.sample(total, Instant::now()) {
                        peak_mbps = peak_mbps.max(sample.mbps);
                        on_rate(sample);
                    }
                }
                StreamEvent::Finished { stream, outcome } => {
                    if finished.get(stream).copied().unwrap_or(true) {
                        continue;
                    }
                    finished[stream] = true;
                    finished_count += 1;

                    if outcome.is_success() {
                        debug!(%direction, stream, bytes = counters[stream], %outcome, "stream done");
                        completed += 1;
                    } else if outcome == StreamOutcome::Cancelled {
                        cancelled = true;
                    } else {
                        warn!(%direction, stream, bytes = counters[stream], %outcome, "stream stopped early");
                        failed += 1;
                    }

                    if finished_count == stream_count {
                        break;
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(%direction, error = %e, "stream task aborted");
            }
        }
        // A stream task that died without reporting is a failed stream.
        failed += stream_count - finished_count;

        if cancelled {
            return Err(SpeedTestError::Cancelled);
        }

        let total: u64 = counters.iter().sum();
        let mut final_sample = sampler.finish(total, Instant::now());
        // With no surviving stream there is no rate to report, only the
        // bytes that made it before the failures.
        if completed == 0 {
            final_sample.mbps = 0.0;
            peak_mbps = 0.0;
        }
        on_rate(AggregateSample {
            mbps: 0.0,
            ..final_sample
        });

        info!(
            %direction,
            total_bytes = total,
            mbps = final_sample.mbps,
            peak_mbps,
            completed,
            failed,
            "transfer finished"
        );

        Ok(TransferReport {
            direction,
            final_sample,
            peak_mbps,
            stream_bytes: counters,
            completed,
            failed,
        })
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Random upload body, generated once per run and shared by all streams.
pub fn generate_payload(len: usize) -> Bytes {
    let mut rng = rand::rngs::StdRng::from_entropy();
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    Bytes::from(data)
}
