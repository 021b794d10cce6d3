//! End-to-end sequencing of one speed test run.
//!
//! `Idle -> Ping -> Calibrate -> Download -> Upload -> Complete`, with
//! `Error` reachable from any in-flight phase. The orchestrator never
//! touches a rendering surface; everything it has to say goes through a
//! [`SessionObserver`].

use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::calibrate::CalibrationEstimator;
use super::coordinator::{StreamCoordinator, TransferReport};
use super::error::{Result, SpeedTestError};
use super::ping::{LatencyProbe, PingResult};
use super::planner::{AdaptivePlanner, TransferPlan};
use super::transport::Transport;
use super::{Direction, TestPhase, TestSummary};
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Waking,
    Online,
    /// Warm-up failed; the server may still be starting.
    Unconfirmed,
}

pub trait SessionObserver: Send + Sync {
    fn on_phase_change(&self, phase: TestPhase);

    fn on_rate_sample(&self, direction: Direction, mbps: f64);

    fn on_summary(&self, summary: &TestSummary);

    fn on_latency_sample(&self, _ms: f64) {}

    fn on_ping_result(&self, _result: &PingResult) {}

    fn on_plan(&self, _estimated_mbps: f64, _plan: &TransferPlan) {}

    fn on_server_status(&self, _status: ServerStatus) {}

    fn on_error(&self, _error: &SpeedTestError) {}
}

pub struct SessionOrchestrator {
    transport: Arc<dyn Transport>,
    settings: Settings,
    planner: AdaptivePlanner,
    phase: Mutex<TestPhase>,
}

impl SessionOrchestrator {
    pub fn new(transport: Arc<dyn Transport>, settings: Settings) -> Result<Self> {
        settings.validate()?;
        let planner = settings.planner()?;
        Ok(Self {
            transport,
            settings,
            planner,
            phase: Mutex::new(TestPhase::Idle),
        })
    }

    pub fn phase(&self) -> TestPhase {
        *self.phase.lock()
    }

    /// Wakes a possibly cold server. Never fails; the outcome is only a
    /// readiness indicator. Called once when the front end starts, never
    /// from inside a run.
    pub async fn warm_up(&self, observer: &dyn SessionObserver) -> ServerStatus {
        observer.on_server_status(ServerStatus::Waking);
        let status = match self.transport.warm_up().await {
            Ok(()) => ServerStatus::Online,
            Err(e) => {
                warn!(error = %e, "warm-up call failed");
                ServerStatus::Unconfirmed
            }
        };
        observer.on_server_status(status);
        status
    }

    /// Runs one full test. Only one run may be in flight at a time.
    ///
    /// A cancelled run returns to `Idle` without a summary; any other error
    /// leaves the session in `Error`.
    pub async fn run(
        &self,
        observer: &dyn SessionObserver,
        cancel: &CancellationToken,
    ) -> Result<TestSummary> {
        self.begin()?;
        observer.on_phase_change(TestPhase::Ping);

        let result = self.execute(observer, cancel).await;
        match &result {
            Ok(summary) => {
                observer.on_summary(summary);
                self.transition(observer, TestPhase::Complete);
                info!(?summary, "speed test complete");
            }
            Err(SpeedTestError::Cancelled) => {
                info!("speed test cancelled");
                self.transition(observer, TestPhase::Idle);
            }
            Err(e) => {
                warn!(error = %e, "speed test failed");
                observer.on_error(e);
                self.transition(observer, TestPhase::Error);
            }
        }
        result
    }

    fn begin(&self) -> Result<()> {
        let mut phase = self.phase.lock();
        if phase.is_in_flight() {
            return Err(SpeedTestError::Busy { phase: *phase });
        }
        *phase = TestPhase::Ping;
        Ok(())
    }

    fn transition(&self, observer: &dyn SessionObserver, next: TestPhase) {
        *self.phase.lock() = next;
        observer.on_phase_change(next);
    }

    fn checkpoint(cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            Err(SpeedTestError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn execute(
        &self,
        observer: &dyn SessionObserver,
        cancel: &CancellationToken,
    ) -> Result<TestSummary> {
        let settings = &self.settings;

        let mut probe = LatencyProbe::new(settings.ping_count, settings.ping_ceiling);
        let ping = probe
            .measure(self.transport.as_ref(), cancel, |ms| observer.on_latency_sample(ms))
            .await?;
        if !ping.is_available() {
            warn!("no latency probe survived, ping unavailable");
        }
        observer.on_ping_result(&ping);
        Self::checkpoint(cancel)?;

        self.transition(observer, TestPhase::Calibrate);
        let estimator = CalibrationEstimator::new(
            settings.calibration_bytes,
            settings.fallback_mbps,
            settings.stream_timeout,
        );
        let estimated_mbps = estimator.estimate(self.transport.as_ref(), cancel).await?;
        let plan = self.planner.plan(estimated_mbps);
        info!(estimated_mbps, band = %plan.band, streams = plan.stream_count, "plan selected");
        observer.on_plan(estimated_mbps, &plan);
        Self::checkpoint(cancel)?;

        let coordinator = StreamCoordinator::new(
            Arc::clone(&self.transport),
            settings.settling_window,
            settings.stream_timeout,
            settings.transfer_cap,
        );

        self.transition(observer, TestPhase::Download);
        let download = self
            .transfer(&coordinator, Direction::Download, &plan, observer, cancel)
            .await?;
        Self::checkpoint(cancel)?;

        self.transition(observer, TestPhase::Upload);
        let upload = self
            .transfer(&coordinator, Direction::Upload, &plan, observer, cancel)
            .await?;

        Ok(TestSummary {
            ping_ms: ping.minimum_ms,
            jitter_ms: ping.minimum_ms.map(|_| ping.jitter_ms),
            download_mbps: download.final_sample.mbps,
            upload_mbps: upload.final_sample.mbps,
            download_peak_mbps: download.peak_mbps,
            upload_peak_mbps: upload.peak_mbps,
            download_bytes: download.final_sample.total_bytes,
            upload_bytes: upload.final_sample.total_bytes,
            estimated_mbps,
            band: Some(plan.band),
        })
    }

    async fn transfer(
        &self,
        coordinator: &StreamCoordinator,
        direction: Direction,
        plan: &TransferPlan,
        observer: &dyn SessionObserver,
        cancel: &CancellationToken,
    ) -> Result<TransferReport> {
        let report = coordinator
            .run(direction, plan, cancel, |sample| {
                observer.on_rate_sample(direction, sample.mbps)
            })
            .await?;

        if report.is_unreachable() {
            return Err(SpeedTestError::EndpointUnreachable { direction });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speedtest::planner::Band;
    use crate::speedtest::testing::{ScriptedTransport, StreamScript};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        phases: Mutex<Vec<TestPhase>>,
        rates: Mutex<Vec<(Direction, f64)>>,
        summaries: Mutex<Vec<TestSummary>>,
        statuses: Mutex<Vec<ServerStatus>>,
        errors: Mutex<Vec<String>>,
    }

    impl SessionObserver for Recorder {
        fn on_phase_change(&self, phase: TestPhase) {
            self.phases.lock().push(phase);
        }

        fn on_rate_sample(&self, direction: Direction, mbps: f64) {
            self.rates.lock().push((direction, mbps));
        }

        fn on_summary(&self, summary: &TestSummary) {
            self.summaries.lock().push(summary.clone());
        }

        fn on_server_status(&self, status: ServerStatus) {
            self.statuses.lock().push(status);
        }

        fn on_error(&self, error: &SpeedTestError) {
            self.errors.lock().push(error.to_string());
        }
    }

    fn healthy_transport() -> ScriptedTransport {
        let mut transport = ScriptedTransport::new()
            .probes(&[Some(40), Some(42), Some(41), Some(39), Some(200)])
            .calibration(StreamScript::steps(&[(400, 2_000_000)]));
        for stream in 0..3 {
            transport = transport
                .download(stream, StreamScript::steps(&[(250, 5_000_000), (500, 20_000_000)]))
                .upload(stream, StreamScript::steps(&[(300, 5_000_000), (1_000, 10_000_000)]));
        }
        transport
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_run_produces_summary() {
        let transport = Arc::new(healthy_transport());
        let session = SessionOrchestrator::new(transport.clone(), Settings::default()).unwrap();
        let recorder = Recorder::default();

        let summary = session.run(&recorder, &CancellationToken::new()).await.unwrap();

        assert_eq!(
            *recorder.phases.lock(),
            vec![
                TestPhase::Ping,
                TestPhase::Calibrate,
                TestPhase::Download,
                TestPhase::Upload,
                TestPhase::Complete,
            ]
        );
        assert_eq!(session.phase(), TestPhase::Complete);
        assert_eq!(recorder.summaries.lock().as_slice(), &[summary.clone()]);
        assert!(recorder.statuses.lock().is_empty());

        assert!((summary.ping_ms.unwrap() - 39.0).abs() < 1e-6);
        assert!((summary.jitter_ms.unwrap() - 41.5).abs() < 1e-6);
        assert!((summary.estimated_mbps - 40.0).abs() < 1e-6);
        assert_eq!(summary.band, Some(Band::Medium));
        assert_eq!(summary.download_bytes, 60_000_000);
        assert_eq!(summary.upload_bytes, 30_000_000);
        assert!(summary.download_mbps > 0.0);
        assert!(summary.download_peak_mbps >= summary.download_mbps);

        assert_eq!(*transport.download_requests.lock(), vec![20_000_000; 3]);
        assert_eq!(*transport.upload_requests.lock(), vec![10_000_000; 3]);

        let rates = recorder.rates.lock();
        let last_download = rates.iter().rev().find(|(d, _)| *d == Direction::Download).unwrap();
        assert_eq!(last_download.1, 0.0);
        assert_eq!(rates.last().unwrap(), &(Direction::Upload, 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_upload_is_an_error() {
        let mut transport = ScriptedTransport::new()
            .probes(&[Some(20)])
            .calibration(StreamScript::steps(&[(100, 2_000_000)]));
        for stream in 0..3 {
            transport = transport
                .download(stream, StreamScript::steps(&[(300, 1_000)]))
                .upload(stream, StreamScript::failing());
        }
        let settings = Settings {
            ping_count: 1,
            ..Settings::default()
        };
        let session = SessionOrchestrator::new(Arc::new(transport), settings).unwrap();
        let recorder = Recorder::default();

        let err = session.run(&recorder, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(
            err,
            SpeedTestError::EndpointUnreachable { direction: Direction::Upload }
        ));
        assert_eq!(session.phase(), TestPhase::Error);
        assert_eq!(recorder.phases.lock().last(), Some(&TestPhase::Error));
        assert!(recorder.summaries.lock().is_empty());
        assert_eq!(recorder.errors.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_ping_and_calibration_still_complete() {
        let mut transport = ScriptedTransport::new()
            .probes(&[None, None])
            .calibration(StreamScript::failing());
        for stream in 0..3 {
            transport = transport
                .download(stream, StreamScript::steps(&[(300, 1_000)]))
                .upload(stream, StreamScript::steps(&[(300, 400)]).then_fail());
        }
        let settings = Settings {
            ping_count: 2,
            ..Settings::default()
        };
        let transport = Arc::new(transport);
        let session = SessionOrchestrator::new(transport.clone(), settings).unwrap();
        let recorder = Recorder::default();

        let summary = session.run(&recorder, &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.ping_ms, None);
        assert_eq!(summary.estimated_mbps, 10.0);
        assert_eq!(*transport.download_requests.lock(), vec![20_000_000; 3]);

        // Every upload stream failed after moving data: bytes are kept, the
        // rate is zero.
        assert_eq!(summary.upload_bytes, 1_200);
        assert_eq!(summary.upload_mbps, 0.0);
        assert_eq!(summary.upload_peak_mbps, 0.0);
        assert!(summary.download_mbps > 0.0);
        assert_eq!(session.phase(), TestPhase::Complete);
        assert!(recorder.errors.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_up_reports_readiness() {
        let session = SessionOrchestrator::new(Arc::new(ScriptedTransport::new()), Settings::default()).unwrap();
        let recorder = Recorder::default();
        assert_eq!(session.warm_up(&recorder).await, ServerStatus::Online);
        assert_eq!(
            *recorder.statuses.lock(),
            vec![ServerStatus::Waking, ServerStatus::Online]
        );

        let cold = ScriptedTransport::new()
            .slow_warm_up(Duration::from_secs(29))
            .warm_up_fails();
        let session = SessionOrchestrator::new(Arc::new(cold), Settings::default()).unwrap();
        let recorder = Recorder::default();
        assert_eq!(session.warm_up(&recorder).await, ServerStatus::Unconfirmed);
        assert_eq!(
            *recorder.statuses.lock(),
            vec![ServerStatus::Waking, ServerStatus::Unconfirmed]
        );
        assert_eq!(session.phase(), TestPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_server_does_not_delay_run() {
        let transport = healthy_transport()
            .slow_warm_up(Duration::from_secs(29))
            .warm_up_fails();
        let session = SessionOrchestrator::new(Arc::new(transport), Settings::default()).unwrap();
        let recorder = Recorder::default();

        let started = tokio::time::Instant::now();
        session.run(&recorder, &CancellationToken::new()).await.unwrap();

        // Probes, calibration and both transfers take under 3s of script time.
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
        assert!(recorder.statuses.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ping_yields_sentinel_summary() {
        let mut transport = ScriptedTransport::new()
            .probes(&[None])
            .calibration(StreamScript::failing());
        for stream in 0..3 {
            transport = transport
                .download(stream, StreamScript::steps(&[(300, 1_000)]))
                .upload(stream, StreamScript::steps(&[(300, 1_000)]));
        }
        let settings = Settings {
            ping_count: 1,
            ..Settings::default()
        };
        let session = SessionOrchestrator::new(Arc::new(transport), settings).unwrap();

        let summary = session
            .run(&Recorder::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.ping_ms, None);
        assert_eq!(summary.jitter_ms, None);
        assert_eq!(summary.estimated_mbps, 10.0);
        assert_eq!(summary.band, Some(Band::Medium));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_rejected_while_in_flight() {
        let mut transport = ScriptedTransport::new()
            .probes(&[Some(10)])
            .calibration(StreamScript::steps(&[(100, 2_000_000)]));
        for stream in 0..3 {
            transport = transport.download(stream, StreamScript::hanging());
        }
        let settings = Settings {
            ping_count: 1,
            ..Settings::default()
        };
        let session = Arc::new(SessionOrchestrator::new(Arc::new(transport), settings).unwrap());
        let cancel = CancellationToken::new();

        let running = {
            let session = Arc::clone(&session);
            let cancel = cancel.clone();
            tokio::spawn(async move { session.run(&Recorder::default(), &cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(session.phase(), TestPhase::Download);

        let err = session
            .run(&Recorder::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SpeedTestError::Busy { phase: TestPhase::Download }));

        cancel.cancel();
        let first = running.await.unwrap();
        assert!(matches!(first, Err(SpeedTestError::Cancelled)));
        assert_eq!(session.phase(), TestPhase::Idle);
    }
}
