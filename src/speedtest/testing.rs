//! In-process [`Transport`] that replays scripted timings.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use super::coordinator::StreamReporter;
use super::error::{Result, SpeedTestError};
use super::transport::Transport;

#[derive(Debug, Clone, Copy)]
enum ScriptEnd {
    Complete,
    Fail,
    Hang,
}

/// `(at_ms, cumulative_bytes)` reports, times measured from the call.
#[derive(Debug, Clone)]
pub(crate) struct StreamScript {
    steps: Vec<(u64, u64)>,
    end: ScriptEnd,
}

impl StreamScript {
    pub(crate) fn steps(steps: &[(u64, u64)]) -> Self {
        Self {
            steps: steps.to_vec(),
            end: ScriptEnd::Complete,
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            steps: Vec::new(),
            end: ScriptEnd::Fail,
        }
    }

    pub(crate) fn hanging() -> Self {
        Self {
            steps: Vec::new(),
            end: ScriptEnd::Hang,
        }
    }

    pub(crate) fn then_fail(mut self) -> Self {
        self.end = ScriptEnd::Fail;
        self
    }

    pub(crate) fn then_hang(mut self) -> Self {
        self.end = ScriptEnd::Hang;
        self
    }

    async fn play(&self, reporter: &StreamReporter) -> Result<u64> {
        let start = Instant::now();
        let mut last = 0;
        for &(at_ms, bytes) in &self.steps {
            tokio::time::sleep_until(start + Duration::from_millis(at_ms)).await;
            reporter.report(bytes);
            last = bytes;
        }
        match self.end {
            ScriptEnd::Complete => Ok(last),
            ScriptEnd::Fail => Err(reporter.failure("scripted failure")),
            ScriptEnd::Hang => std::future::pending().await,
        }
    }
}

#[derive(Default)]
pub(crate) struct ScriptedTransport {
    probes: Mutex<VecDeque<Option<u64>>>,
    calibration: Option<StreamScript>,
    downloads: HashMap<usize, StreamScript>,
    uploads: HashMap<usize, StreamScript>,
    warm_up_fails: bool,
    warm_up_delay: Duration,
    pub(crate) download_requests: Mutex<Vec<u64>>,
    pub(crate) upload_requests: Mutex<Vec<usize>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Probe round-trip times in ms; `None` is a lost probe.
    pub(crate) fn probes(self, probes: &[Option<u64>]) -> Self {
        *self.probes.lock() = probes.iter().copied().collect();
        self
    }

    pub(crate) fn calibration(mut self, script: StreamScript) -> Self {
        self.calibration = Some(script);
        self
    }

    pub(crate) fn download(mut self, stream: usize, script: StreamScript) -> Self {
        self.downloads.insert(stream, script);
        self
    }

    pub(crate) fn upload(mut self, stream: usize, script: StreamScript) -> Self {
        self.uploads.insert(stream, script);
        self
    }

    pub(crate) fn warm_up_fails(mut self) -> Self {
        self.warm_up_fails = true;
        self
    }

    /// A cold server: the wake call answers only after `delay`.
    pub(crate) fn slow_warm_up(mut self, delay: Duration) -> Self {
        self.warm_up_delay = delay;
        self
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn probe(&self, _nonce: u64) -> Result<()> {
        let next = self.probes.lock().pop_front();
        match next {
            Some(Some(ms)) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(())
            }
            Some(None) | None => Err(SpeedTestError::Probe("scripted loss".into())),
        }
    }

    async fn download(&self, bytes: u64, reporter: StreamReporter) -> Result<u64> {
        let script = if reporter.is_detached() {
            self.calibration.clone()
        } else {
            self.download_requests.lock().push(bytes);
            self.downloads.get(&reporter.stream()).cloned()
        };
        script.unwrap_or_else(StreamScript::failing).play(&reporter).await
    }

    async fn upload(&self, payload: Bytes, reporter: StreamReporter) -> Result<u64> {
        self.upload_requests.lock().push(payload.len());
        let script = self.uploads.get(&reporter.stream()).cloned();
        script.unwrap_or_else(StreamScript::failing).play(&reporter).await
    }

    async fn warm_up(&self) -> Result<()> {
        tokio::time::sleep(self.warm_up_delay).await;
        if self.warm_up_fails {
            Err(SpeedTestError::Probe("scripted warm-up failure".into()))
        } else {
            Ok(())
        }
    }
}
