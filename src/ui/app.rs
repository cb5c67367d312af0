use crate::models::Mode;
use crate::service::{CodeView, ConsoleView};
use chrono::{DateTime, Local, Utc};
use crossterm::event::{KeyCode, KeyModifiers};
use ratatui::style::Color;

#[derive(Debug, Clone)]
pub enum DashboardView {
    Code(CodeView),
    Console(ConsoleView),
}

impl DashboardView {
    pub fn empty(mode: Mode) -> Self {
        match mode {
            Mode::Code => DashboardView::Code(CodeView::default()),
            Mode::Console => DashboardView::Console(ConsoleView::default()),
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            DashboardView::Code(view) => view.error.as_deref(),
            DashboardView::Console(view) => view.error.as_deref(),
        }
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        match self {
            DashboardView::Code(view) => view.last_update,
            DashboardView::Console(view) => view.last_update,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    None,
    Refresh,
    Quit,
}

pub fn key_action(code: KeyCode, modifiers: KeyModifiers) -> KeyAction {
    if modifiers.contains(KeyModifiers::CONTROL) && code == KeyCode::Char('c') {
        return KeyAction::Quit;
    }
    match code {
        KeyCode::Char('q') | KeyCode::Esc => KeyAction::Quit,
        KeyCode::Char('r') => KeyAction::Refresh,
        _ => KeyAction::None,
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub running: bool,
    pub mode: Mode,
    pub status: String,
    pub view: DashboardView,
}

impl AppState {
    pub fn new(mode: Mode) -> Self {
        Self {
            running: true,
            mode,
            status: "starting".into(),
            view: DashboardView::empty(mode),
        }
    }
}

pub fn format_last_update(ts: Option<DateTime<Utc>>) -> String {
    match ts {
        Some(ts) => ts.with_timezone(&Local).format("%H:%M:%S").to_string(),
        None => "never".into(),
    }
}

/// `3h 25m`, `45m`, or `now` once the boundary has passed.
pub fn format_duration_hours(hours: f64) -> String {
    if !hours.is_finite() || hours <= 0.0 {
        return "now".into();
    }
    let total_minutes = (hours * 60.0).round() as i64;
    let (days, rem) = (total_minutes / (24 * 60), total_minutes % (24 * 60));
    let (h, m) = (rem / 60, rem % 60);
    match (days, h) {
        (0, 0) => format!("{m}m"),
        (0, _) => format!("{h}h {m}m"),
        _ => format!("{days}d {h}h"),
    }
}

pub fn format_tokens(count: u64) -> String {
    match count {
        c if c >= 1_000_000 => format!("{:.1}M", c as f64 / 1_000_000.0),
        c if c >= 1_000 => format!("{:.1}K", c as f64 / 1_000.0),
        c => c.to_string(),
    }
}

pub fn gauge_ratio(percent: f64) -> f64 {
    if percent.is_finite() {
        (percent / 100.0).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub fn usage_color(percent: f64) -> Color {
    if percent >= 90.0 {
        Color::Red
    } else if percent >= 70.0 {
        Color::Yellow
    } else {
        Color::Green
    }
}
