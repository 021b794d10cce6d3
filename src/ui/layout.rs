use crate::app::{App, AppView, Panel};
use ratatui::{
    layout::{Alignment, Constraint, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Paragraph},
    Frame,
};
use speedgauge::settings::SettingsField;
use speedgauge::speedtest::{session::ServerStatus, TestPhase};

const ACCENT: Color = Color::Rgb(100, 149, 237);
const DOWNLOAD: Color = Color::Rgb(0, 255, 204);
const DOWNLOAD_DIM: Color = Color::Rgb(40, 110, 95);
const UPLOAD: Color = Color::Rgb(0, 136, 255);
const UPLOAD_DIM: Color = Color::Rgb(40, 80, 130);
const WARN: Color = Color::Rgb(220, 180, 130);
const ERROR: Color = Color::Rgb(230, 110, 110);
const TEXT_PRIMARY: Color = Color::Rgb(230, 230, 230);
const TEXT_SECONDARY: Color = Color::Rgb(160, 160, 160);
const TEXT_MUTED: Color = Color::Rgb(100, 100, 100);
const BORDER: Color = Color::Rgb(60, 60, 65);
const BORDER_ACTIVE: Color = Color::Rgb(100, 100, 110);

/// Full-scale reading of the speed gauge.
const GAUGE_MAX_MBPS: f64 = 1000.0;
const SENTINEL: &str = "--";

pub fn draw_ui(frame: &mut Frame, app: &App) {
    let area = frame.area();

    match app.view {
        AppView::Main => {
            let chunks = Layout::vertical([
                Constraint::Length(3),
                Constraint::Min(8),
                Constraint::Length(1),
                Constraint::Length(1),
            ])
            .split(area);

            draw_header(frame, chunks[0], app);
            if app.expanded {
                draw_expanded(frame, chunks[1], app);
            } else {
                draw_panels(frame, chunks[1], app);
            }
            draw_status_line(frame, chunks[2], app);
            draw_help(frame, chunks[3], app);
        }
        AppView::Settings => draw_settings_view(frame, area, app),
    }
}

fn draw_header(frame: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .borders(Borders::BOTTOM)
        .border_style(Style::default().fg(BORDER));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::horizontal([
        Constraint::Length(22),
        Constraint::Min(10),
        Constraint::Length(28),
    ])
    .split(inner);

    let (server, server_color) = match app.server_status {
        ServerStatus::Waking => ("waking server", WARN),
        ServerStatus::Online => ("server online", DOWNLOAD),
        ServerStatus::Unconfirmed => ("ready (server cold?)", TEXT_MUTED),
    };
    let title = Line::from(vec![
        Span::styled("speedgauge ", Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD)),
        Span::styled("●", Style::default().fg(server_color)),
    ]);
    frame.render_widget(Paragraph::new(title), chunks[0]);

    let (status, color) = match app.phase {
        TestPhase::Idle => (server, TEXT_MUTED),
        TestPhase::Ping => ("Measuring latency...", WARN),
        TestPhase::Calibrate => ("Estimating link speed...", ACCENT),
        TestPhase::Download => ("Testing download...", DOWNLOAD),
        TestPhase::Upload => ("Testing upload...", UPLOAD),
        TestPhase::Complete => ("Complete", ACCENT),
        TestPhase::Error => ("ERROR", ERROR),
    };
    frame.render_widget(
        Paragraph::new(status)
            .style(Style::default().fg(color))
            .alignment(Alignment::Center),
        chunks[1],
    );

    frame.render_widget(
        Paragraph::new(phase_line(app.phase)).alignment(Alignment::Right),
        chunks[2],
    );
}

fn phase_line(phase: TestPhase) -> Line<'static> {
    const STEPS: [(TestPhase, &str); 4] = [
        (TestPhase::Ping, "ping"),
        (TestPhase::Calibrate, "cal"),
        (TestPhase::Download, "down"),
        (TestPhase::Upload, "up"),
    ];
    let position = |p: TestPhase| STEPS.iter().position(|(s, _)| *s == p);

    let mut spans = Vec::new();
    for (i, (step, label)) in STEPS.iter().enumerate() {
        let done = match phase {
            TestPhase::Complete => true,
            current => position(current).is_some_and(|at| i < at),
        };

        let style = if phase == *step {
            Style::default().fg(ACCENT).add_modifier(Modifier::BOLD)
        } else if done {
            Style::default().fg(TEXT_SECONDARY)
        } else {
            Style::default().fg(TEXT_MUTED)
        };
        spans.push(Span::styled(*label, style));

        if i < STEPS.len() - 1 {
            spans.push(Span::styled(" / ", Style::default().fg(TEXT_MUTED)));
        }
    }
    Line::from(spans)
}

fn draw_panels(frame: &mut Frame, area: Rect, app: &App) {
    let panels = Layout::horizontal([
        Constraint::Ratio(1, 3),
        Constraint::Ratio(1, 3),
        Constraint::Ratio(1, 3),
    ])
    .split(area);

    for (panel, rect) in [Panel::Download, Panel::Upload, Panel::Ping].into_iter().zip(panels.iter()) {
        let selected = app.selected_panel == panel;
        match panel {
            Panel::Ping => draw_ping_panel(frame, *rect, app, selected, false),
            _ => draw_rate_panel(frame, *rect, app, panel, selected, false),
        }
    }
}

fn draw_expanded(frame: &mut Frame, area: Rect, app: &App) {
    match app.selected_panel {
        Panel::Ping => draw_ping_panel(frame, area, app, true, true),
        panel => draw_rate_panel(frame, area, app, panel, true, true),
    }
}

fn panel_block(title: &str, color: Color, selected: bool) -> Block<'static> {
    Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(if selected { BORDER_ACTIVE } else { BORDER }))
        .title(Span::styled(
            format!(" {title} "),
            Style::default().fg(if selected { color } else { TEXT_SECONDARY }),
        ))
}

fn draw_rate_panel(frame: &mut Frame, area: Rect, app: &App, panel: Panel, selected: bool, detailed: bool) {
    let (title, color, dim, series, live, active) = match panel {
        Panel::Upload => (
            "Upload",
            UPLOAD,
            UPLOAD_DIM,
            &app.upload_series,
            app.upload_live,
            app.phase == TestPhase::Upload,
        ),
        _ => (
            "Download",
            DOWNLOAD,
            DOWNLOAD_DIM,
            &app.download_series,
            app.download_live,
            app.phase == TestPhase::Download,
        ),
    };
    let result = app.summary.as_ref().map(|s| match panel {
        Panel::Upload => (s.upload_mbps, s.upload_peak_mbps),
        _ => (s.download_mbps, s.download_peak_mbps),
    });

    let block = panel_block(title, color, selected);
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::vertical([
        Constraint::Length(2),
        Constraint::Length(1),
        Constraint::Min(3),
    ])
    .split(inner);

    let headline = match result {
        Some((avg, peak)) if detailed => Line::from(vec![
            Span::styled(format_speed(avg), Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD)),
            Span::styled("  ·  ", Style::default().fg(TEXT_MUTED)),
            Span::styled(format!("peak {}", format_speed(peak)), Style::default().fg(TEXT_MUTED)),
        ]),
        Some((avg, _)) => Line::styled(format_speed(avg), Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD)),
        None if active || live > 0.0 => Line::styled(format_speed(live), Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD)),
        None => Line::styled(SENTINEL, Style::default().fg(TEXT_MUTED)),
    };
    frame.render_widget(Paragraph::new(headline).alignment(Alignment::Center), chunks[0]);

    let reading = result.map_or(live, |(avg, _)| avg);
    draw_gauge(frame, chunks[1], reading / GAUGE_MAX_MBPS, color, dim);

    let samples = series.to_vec();
    if detailed {
        draw_detailed_chart(frame, chunks[2], &samples, color, "Mbps");
    } else {
        draw_sparkline(frame, chunks[2], &samples, color);
    }
}

fn draw_ping_panel(frame: &mut Frame, area: Rect, app: &App, selected: bool, detailed: bool) {
    let block = panel_block("Latency", WARN, selected);
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::vertical([
        Constraint::Length(2),
        Constraint::Length(1),
        Constraint::Min(3),
    ])
    .split(inner);

    let minimum = app.ping.as_ref().and_then(|p| p.minimum_ms);
    let value = match (minimum, app.ping_samples.last()) {
        (Some(ms), _) => format!("{ms:.0} ms"),
        (None, Some(latest)) if app.ping.is_none() => format!("{latest:.0} ms"),
        _ => SENTINEL.to_string(),
    };
    frame.render_widget(
        Paragraph::new(value)
            .style(Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD))
            .alignment(Alignment::Center),
        chunks[0],
    );

    let jitter = match app.ping.as_ref().filter(|p| p.is_available()) {
        Some(p) => format!("jitter {:.1} ms", p.jitter_ms),
        None => format!("jitter {SENTINEL}"),
    };
    let estimate = app
        .estimate
        .map(|(mbps, band, streams)| format!("  ·  est {} · {band} × {streams}", format_speed(mbps)))
        .unwrap_or_default();
    frame.render_widget(
        Paragraph::new(format!("{jitter}{estimate}"))
            .style(Style::default().fg(TEXT_MUTED))
            .alignment(Alignment::Center),
        chunks[1],
    );

    if detailed {
        draw_detailed_chart(frame, chunks[2], &app.ping_samples, WARN, "ms");
    } else {
        draw_sparkline(frame, chunks[2], &app.ping_samples, WARN);
    }
}

fn draw_gauge(frame: &mut Frame, area: Rect, ratio: f64, color: Color, dim_color: Color) {
    if area.width < 4 {
        return;
    }

    let width = (area.width - 2) as usize;
    let filled = ((ratio.clamp(0.0, 1.0) * width as f64) as usize).min(width);
    let empty = width.saturating_sub(filled);

    let bar = Line::from(vec![
        Span::raw(" "),
        Span::styled("━".repeat(filled), Style::default().fg(color)),
        Span::styled("━".repeat(empty), Style::default().fg(dim_color)),
        Span::raw(" "),
    ]);

    frame.render_widget(Paragraph::new(bar), area);
}

fn draw_sparkline(frame: &mut Frame, area: Rect, data: &[f64], color: Color) {
    if data.is_empty() || area.width < 4 || area.height < 2 {
        return;
    }

    let max_val = data.iter().copied().fold(0.0, f64::max).max(1.0);
    let points = to_points(data);

    let dataset = Dataset::default()
        .marker(symbols::Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(color))
        .data(&points);

    let chart = Chart::new(vec![dataset])
        .x_axis(Axis::default().bounds([0.0, data.len() as f64]))
        .y_axis(Axis::default().bounds([0.0, max_val * 1.1]));

    frame.render_widget(chart, area);
}

fn draw_detailed_chart(frame: &mut Frame, area: Rect, data: &[f64], color: Color, unit: &str) {
    if data.is_empty() || area.width < 10 || area.height < 3 {
        return;
    }

    let y_max = data.iter().copied().fold(0.0, f64::max).max(1.0) * 1.1;
    let points = to_points(data);

    let y_labels = vec![
        Span::styled("0", Style::default().fg(TEXT_MUTED)),
        Span::styled(format!("{y_max:.0} {unit}"), Style::default().fg(TEXT_MUTED)),
    ];

    let chart = Chart::new(vec![Dataset::default()
        .marker(symbols::Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(color))
        .data(&points)])
    .x_axis(
        Axis::default()
            .style(Style::default().fg(BORDER))
            .bounds([0.0, data.len() as f64]),
    )
    .y_axis(
        Axis::default()
            .style(Style::default().fg(BORDER))
            .bounds([0.0, y_max])
            .labels(y_labels),
    );

    frame.render_widget(chart, area);
}

fn to_points(data: &[f64]) -> Vec<(f64, f64)> {
    data.iter().enumerate().map(|(i, &v)| (i as f64, v)).collect()
}

fn draw_status_line(frame: &mut Frame, area: Rect, app: &App) {
    let Some(error) = &app.error else {
        return;
    };
    frame.render_widget(
        Paragraph::new(format!("{error} · enter to retry"))
            .style(Style::default().fg(ERROR))
            .alignment(Alignment::Center),
        area,
    );
}

fn draw_settings_view(frame: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::vertical([
        Constraint::Length(3),
        Constraint::Min(10),
        Constraint::Length(1),
    ])
    .split(area);

    let header_block = Block::default()
        .borders(Borders::BOTTOM)
        .border_style(Style::default().fg(BORDER));
    let header_inner = header_block.inner(chunks[0]);
    frame.render_widget(header_block, chunks[0]);
    frame.render_widget(
        Paragraph::new("Settings")
            .style(Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD)),
        header_inner,
    );

    let content_area = Layout::horizontal([
        Constraint::Length(2),
        Constraint::Min(30),
        Constraint::Length(2),
    ])
    .split(chunks[1])[1];

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(BORDER));
    let inner = block.inner(content_area);
    frame.render_widget(block, content_area);

    let rows = Layout::vertical([
        Constraint::Length(3),
        Constraint::Length(3),
        Constraint::Length(3),
        Constraint::Min(0),
    ])
    .split(inner);

    let settings = &app.settings;
    let cap = settings
        .transfer_cap
        .map_or_else(|| "off".to_string(), |cap| format!("{} s", cap.as_secs()));

    let fields = [
        (SettingsField::PingCount, "Ping samples", settings.ping_count.to_string()),
        (SettingsField::StreamCount, "Streams", settings.stream_count.to_string()),
        (SettingsField::TransferCap, "Transfer cap", cap),
    ];
    for ((field, label, value), row) in fields.iter().zip(rows.iter()) {
        draw_setting_row(frame, *row, label, value, app.selected_setting == *field);
    }

    frame.render_widget(
        Paragraph::new("↑↓ select · ←→ adjust · enter done")
            .style(Style::default().fg(TEXT_MUTED))
            .alignment(Alignment::Center),
        chunks[2],
    );
}

fn draw_setting_row(frame: &mut Frame, area: Rect, label: &str, value: &str, selected: bool) {
    let chunks = Layout::horizontal([
        Constraint::Length(16),
        Constraint::Min(10),
    ])
    .split(area);

    let label_style = if selected {
        Style::default().fg(ACCENT)
    } else {
        Style::default().fg(TEXT_SECONDARY)
    };
    frame.render_widget(Paragraph::new(format!(" {label}")).style(label_style), chunks[0]);

    let (value_text, value_style) = if selected {
        (format!("< {value} >"), Style::default().fg(TEXT_PRIMARY))
    } else {
        (value.to_string(), Style::default().fg(TEXT_MUTED))
    };
    frame.render_widget(Paragraph::new(value_text).style(value_style), chunks[1]);
}

fn draw_help(frame: &mut Frame, area: Rect, app: &App) {
    let help = if app.expanded {
        "esc close · q quit"
    } else if app.is_cancelling() {
        "cancelling · q quit"
    } else if app.phase.is_in_flight() {
        "tab select · space expand · esc cancel · q quit"
    } else {
        "enter start · s settings · tab select · space expand · q quit"
    };

    frame.render_widget(
        Paragraph::new(help)
            .style(Style::default().fg(TEXT_MUTED))
            .alignment(Alignment::Center),
        area,
    );
}

fn format_speed(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.1} Gbps", mbps / 1000.0)
    } else if mbps >= 10.0 {
        format!("{:.0} Mbps", mbps)
    } else if mbps > 0.0 {
        format!("{:.2} Mbps", mbps)
    } else {
        "0 Mbps".to_string()
    }
}
