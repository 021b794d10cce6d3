mod app;
mod ui;

use anyhow::{Context, Result};
use app::{poll_event, run_speed_test, warm_up, App, AppAction, ChannelObserver, TestUpdate};
use crossterm::event::Event;
use ratatui::DefaultTerminal;
use speedgauge::settings::Settings;
use speedgauge::speedtest::TestPhase;
use std::fs::File;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use ui::draw_ui;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let settings = Settings::from_env().context("reading SPEEDGAUGE_* settings")?;

    let mut terminal = ratatui::init();
    terminal.clear()?;

    let result = run_app(&mut terminal, settings).await;

    ratatui::restore();
    result
}

/// Logs go to the file named by `SPEEDGAUGE_LOG`, never to the terminal the
/// UI is drawing on.
fn init_logging() -> Result<()> {
    let Ok(path) = std::env::var("SPEEDGAUGE_LOG") else {
        return Ok(());
    };
    let file = File::create(&path).with_context(|| format!("creating log file {path}"))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("speedgauge=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

async fn run_app(terminal: &mut DefaultTerminal, settings: Settings) -> Result<()> {
    let mut app = App::new(settings);
    let (update_tx, mut update_rx) = mpsc::unbounded_channel::<TestUpdate>();
    let observer = ChannelObserver::new(update_tx);

    match app.session() {
        Ok(session) => {
            tokio::spawn(warm_up(session, observer.clone()));
        }
        Err(e) => app.error = Some(e.to_string()),
    }

    loop {
        terminal.draw(|frame| draw_ui(frame, &app))?;

        while let Ok(update) = update_rx.try_recv() {
            app.apply(update);
        }

        if let Some(Event::Key(key)) = poll_event(Duration::from_millis(30))? {
            if let Some(action) = app.handle_key_event(key) {
                match action {
                    AppAction::Quit => break,
                    AppAction::StartTest => {
                        app.reset_for_new_test();
                        match app.session() {
                            Ok(session) => {
                                app.phase = TestPhase::Ping;
                                let cancel = CancellationToken::new();
                                app.set_cancel(cancel.clone());
                                tokio::spawn(run_speed_test(session, observer.clone(), cancel));
                            }
                            Err(e) => {
                                app.phase = TestPhase::Error;
                                app.error = Some(e.to_string());
                            }
                        }
                    }
                    AppAction::CancelTest => app.cancel_test(),
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    app.cancel_test();
    Ok(())
}
