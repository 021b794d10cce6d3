use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use speedgauge::settings::{Settings, SettingsField};
use speedgauge::speedtest::{
    ping::PingResult,
    planner::{Band, TransferPlan},
    sampler::RateSeries,
    session::{ServerStatus, SessionObserver, SessionOrchestrator},
    transport::HttpTransport,
    Direction, SpeedTestError, TestPhase, TestSummary,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const MAX_STREAMS: usize = 8;
const MAX_PING_COUNT: usize = 20;
const TRANSFER_CAP_STEP: u64 = 5;
const MAX_TRANSFER_CAP_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppView {
    Main,
    Settings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Panel {
    Download,
    Upload,
    Ping,
}

impl Panel {
    pub fn next(self) -> Self {
        match self {
            Panel::Download => Panel::Upload,
            Panel::Upload => Panel::Ping,
            Panel::Ping => Panel::Download,
        }
    }

    pub fn prev(self) -> Self {
        match self {
            Panel::Download => Panel::Ping,
            Panel::Upload => Panel::Download,
            Panel::Ping => Panel::Upload,
        }
    }
}

pub struct App {
    pub phase: TestPhase,
    pub summary: Option<TestSummary>,
    pub should_quit: bool,

    // UI state
    pub view: AppView,
    pub selected_panel: Panel,
    pub expanded: bool,

    // Settings
    pub settings: Settings,
    pub selected_setting: SettingsField,

    // Live readings
    pub ping: Option<PingResult>,
    pub ping_samples: Vec<f64>,
    pub download_series: RateSeries,
    pub upload_series: RateSeries,
    pub download_live: f64,
    pub upload_live: f64,
    pub estimate: Option<(f64, Band, usize)>,
    pub server_status: ServerStatus,
    pub error: Option<String>,

    session: Option<Arc<SessionOrchestrator>>,
    cancel: Option<CancellationToken>,
}

impl App {
    pub fn new(settings: Settings) -> Self {
        let series_len = settings.series_len;
        Self {
            phase: TestPhase::Idle,
            summary: None,
            should_quit: false,
            view: AppView::Main,
            selected_panel: Panel::Download,
            expanded: false,
            settings,
            selected_setting: SettingsField::PingCount,
            ping: None,
            ping_samples: Vec::new(),
            download_series: RateSeries::new(series_len),
            upload_series: RateSeries::new(series_len),
            download_live: 0.0,
            upload_live: 0.0,
            estimate: None,
            server_status: ServerStatus::Waking,
            error: None,
            session: None,
            cancel: None,
        }
    }

    pub fn handle_key_event(&mut self, key: event::KeyEvent) -> Option<AppAction> {
        if key.kind != KeyEventKind::Press {
            return None;
        }

        match self.view {
            AppView::Main => self.handle_main_key(key),
            AppView::Settings => self.handle_settings_key(key),
        }
    }

    fn handle_main_key(&mut self, key: event::KeyEvent) -> Option<AppAction> {
        match key.code {
            KeyCode::Char('q') => {
                self.should_quit = true;
                Some(AppAction::Quit)
            }
            KeyCode::Char('s') => {
                if !self.phase.is_in_flight() {
                    self.view = AppView::Settings;
                }
                None
            }
            KeyCode::Enter => {
                if self.expanded {
                    self.expanded = false;
                    None
                } else if !self.phase.is_in_flight() {
                    Some(AppAction::StartTest)
                } else {
                    self.expanded = true;
                    None
                }
            }
            KeyCode::Esc => {
                if self.expanded {
                    self.expanded = false;
                    None
                } else if self.phase.is_in_flight() {
                    Some(AppAction::CancelTest)
                } else {
                    None
                }
            }
            KeyCode::Tab | KeyCode::Right | KeyCode::Char('j') => {
                if !self.expanded {
                    self.selected_panel = self.selected_panel.next();
                }
                None
            }
            KeyCode::BackTab | KeyCode::Left | KeyCode::Char('k') => {
                if !self.expanded {
                    self.selected_panel = self.selected_panel.prev();
                }
                None
            }
            KeyCode::Char(' ') => {
                self.expanded = !self.expanded;
                None
            }
            _ => None,
        }
    }

    fn handle_settings_key(&mut self, key: event::KeyEvent) -> Option<AppAction> {
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc | KeyCode::Enter => {
                self.view = AppView::Main;
                None
            }
            KeyCode::Up | KeyCode::Char('k') => {
                self.selected_setting = self.selected_setting.prev();
                None
            }
            KeyCode::Down | KeyCode::Char('j') | KeyCode::Tab => {
                self.selected_setting = self.selected_setting.next();
                None
            }
            KeyCode::Left | KeyCode::Char('h') => {
                self.adjust_setting(false);
                None
            }
            KeyCode::Right | KeyCode::Char('l') => {
                self.adjust_setting(true);
                None
            }
            _ => None,
        }
    }

    fn adjust_setting(&mut self, up: bool) {
        let settings = &mut self.settings;
        match self.selected_setting {
            SettingsField::PingCount => {
                settings.ping_count = if up {
                    (settings.ping_count + 1).min(MAX_PING_COUNT)
                } else {
                    settings.ping_count.saturating_sub(1).max(1)
                };
            }
            SettingsField::StreamCount => {
                settings.stream_count = if up {
                    (settings.stream_count + 1).min(MAX_STREAMS)
                } else {
                    settings.stream_count.saturating_sub(1).max(1)
                };
            }
            SettingsField::TransferCap => {
                let secs = settings.transfer_cap.map_or(0, |cap| cap.as_secs());
                let secs = if up {
                    (secs + TRANSFER_CAP_STEP).min(MAX_TRANSFER_CAP_SECS)
                } else {
                    secs.saturating_sub(TRANSFER_CAP_STEP)
                };
                settings.transfer_cap = (secs > 0).then(|| Duration::from_secs(secs));
            }
        }
        // Rebuilt with the new settings on the next start.
        self.session = None;
    }

    /// The orchestrator for the current settings, built on first use.
    pub fn session(&mut self) -> Result<Arc<SessionOrchestrator>> {
        if let Some(session) = &self.session {
            return Ok(Arc::clone(session));
        }
        let transport = Arc::new(HttpTransport::new(&self.settings)?);
        let session = Arc::new(SessionOrchestrator::new(transport, self.settings.clone())?);
        self.session = Some(Arc::clone(&session));
        Ok(session)
    }

    pub fn reset_for_new_test(&mut self) {
        self.phase = TestPhase::Idle;
        self.summary = None;
        self.ping = None;
        self.ping_samples.clear();
        self.download_series.reset();
        self.upload_series.reset();
        self.download_live = 0.0;
        self.upload_live = 0.0;
        self.estimate = None;
        self.error = None;
        self.expanded = false;
    }

    pub fn set_cancel(&mut self, cancel: CancellationToken) {
        self.cancel = Some(cancel);
    }

    /// Signals the running test to stop. The phase stays in flight until the
    /// session itself reports `Idle`, so a new start cannot race the old run.
    pub fn cancel_test(&mut self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }

    pub fn is_cancelling(&self) -> bool {
        self.phase.is_in_flight() && self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    pub fn apply(&mut self, update: TestUpdate) {
        match update {
            TestUpdate::Phase(phase) => {
                self.phase = phase;
                if phase == TestPhase::Upload {
                    self.selected_panel = Panel::Upload;
                }
                if !phase.is_in_flight() {
                    self.cancel = None;
                }
            }
            TestUpdate::Latency(ms) => {
                self.ping_samples.push(ms);
                if self.ping_samples.len() > 100 {
                    self.ping_samples.remove(0);
                }
            }
            TestUpdate::Ping(result) => self.ping = Some(result),
            TestUpdate::Plan { estimated_mbps, band, streams } => {
                self.estimate = Some((estimated_mbps, band, streams));
            }
            TestUpdate::Rate { direction, mbps } => match direction {
                Direction::Download => {
                    self.download_series.push(mbps);
                    self.download_live = mbps;
                }
                Direction::Upload => {
                    self.upload_series.push(mbps);
                    self.upload_live = mbps;
                }
            },
            TestUpdate::Server(status) => self.server_status = status,
            TestUpdate::Summary(summary) => self.summary = Some(summary),
            TestUpdate::Error(message) => self.error = Some(message),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum AppAction {
    Quit,
    StartTest,
    CancelTest,
}

#[derive(Debug, Clone)]
pub enum TestUpdate {
    Phase(TestPhase),
    Latency(f64),
    Ping(PingResult),
    Plan { estimated_mbps: f64, band: Band, streams: usize },
    Rate { direction: Direction, mbps: f64 },
    Server(ServerStatus),
    Summary(TestSummary),
    Error(String),
}

/// Forwards session callbacks to the render loop.
#[derive(Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<TestUpdate>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::UnboundedSender<TestUpdate>) -> Self {
        Self { tx }
    }

    fn send(&self, update: TestUpdate) {
        let _ = self.tx.send(update);
    }
}

impl SessionObserver for ChannelObserver {
    fn on_phase_change(&self, phase: TestPhase) {
        self.send(TestUpdate::Phase(phase));
    }

    fn on_rate_sample(&self, direction: Direction, mbps: f64) {
        self.send(TestUpdate::Rate { direction, mbps });
    }

    fn on_summary(&self, summary: &TestSummary) {
        self.send(TestUpdate::Summary(summary.clone()));
    }

    fn on_latency_sample(&self, ms: f64) {
        self.send(TestUpdate::Latency(ms));
    }

    fn on_ping_result(&self, result: &PingResult) {
        self.send(TestUpdate::Ping(result.clone()));
    }

    fn on_plan(&self, estimated_mbps: f64, plan: &TransferPlan) {
        self.send(TestUpdate::Plan {
            estimated_mbps,
            band: plan.band,
            streams: plan.stream_count,
        });
    }

    fn on_server_status(&self, status: ServerStatus) {
        self.send(TestUpdate::Server(status));
    }

    fn on_error(&self, error: &SpeedTestError) {
        self.send(TestUpdate::Error(error.to_string()));
    }
}

pub async fn run_speed_test(
    session: Arc<SessionOrchestrator>,
    observer: ChannelObserver,
    cancel: CancellationToken,
) {
    match session.run(&observer, &cancel).await {
        Ok(_) | Err(SpeedTestError::Cancelled) => {}
        Err(e @ SpeedTestError::Busy { .. }) => {
            warn!(error = %e, "start ignored");
            observer.on_error(&e);
        }
        // Already reported through the observer.
        Err(_) => {}
    }
}

pub async fn warm_up(session: Arc<SessionOrchestrator>, observer: ChannelObserver) {
    session.warm_up(&observer).await;
}

pub fn poll_event(timeout: Duration) -> Result<Option<Event>> {
    if event::poll(timeout)? {
        Ok(Some(event::read()?))
    } else {
        Ok(None)
    }
}
