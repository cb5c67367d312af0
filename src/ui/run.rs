use crate::analytics::parse_reset_timestamp;
use crate::auth::CredentialSources;
use crate::config::{db_path, AppConfig};
use crate::error::AppError;
use crate::models::{Mode, Projection, UsageWindow};
use crate::pacemaker::PaceMakerReader;
use crate::providers::build_client;
use crate::providers::console::{system_username, ConsoleClient};
use crate::providers::oauth::OAuthClient;
use crate::service::{CodeMonitor, CodeView, ConsoleMonitor, ConsoleView};
use crate::storage::SnapshotStore;
use crate::ui::app::{
    format_duration_hours, format_last_update, format_tokens, gauge_ratio, key_action, usage_color,
    AppState, DashboardView, KeyAction,
};
use chrono::Utc;
use crossterm::event::{self, Event, KeyEventKind};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Gauge, Paragraph, Row, Table, Wrap};
use ratatui::Terminal;
use std::io;
use std::time::{Duration as StdDuration, Instant};

const COLOR_ACCENT: Color = Color::Cyan;
const COLOR_INFO: Color = Color::Green;
const COLOR_MUTED: Color = Color::DarkGray;
const COLOR_HEADER: Color = Color::White;

enum Monitor {
    Code(CodeMonitor<OAuthClient>),
    Console(ConsoleMonitor<ConsoleClient>),
}

impl Monitor {
    fn build(cfg: &AppConfig, mode: Mode, sources: &CredentialSources) -> Result<Self, AppError> {
        let store = SnapshotStore::open_or_disabled(&db_path()?, cfg.retention());
        let client = build_client()?;

        match mode {
            Mode::Code => Ok(Monitor::Code(CodeMonitor::new(
                OAuthClient::new(client, cfg.api_base_url.clone()),
                store,
                cfg.credentials_path()?,
                PaceMakerReader::new(cfg.pacemaker_dir()?),
            ))),
            Mode::Console => {
                let (key, source) = sources.validated_admin_key()?;
                tracing::info!(source = source.as_label(), "using admin API key");
                let api = ConsoleClient::new(client, cfg.api_base_url.clone(), &key)?;
                Ok(Monitor::Console(ConsoleMonitor::new(api, store, system_username())))
            }
        }
    }

    async fn refresh(&mut self, state: &mut AppState) {
        let ok = match self {
            Monitor::Code(monitor) => {
                let ok = monitor.poll().await;
                state.view = DashboardView::Code(monitor.view().clone());
                ok
            }
            Monitor::Console(monitor) => {
                let ok = monitor.poll().await;
                state.view = DashboardView::Console(monitor.view().clone());
                ok
            }
        };
        state.status = if ok { "ok".into() } else { "refresh failed".into() };
    }
}

pub async fn run_tui(cfg: &AppConfig, mode: Mode, sources: &CredentialSources) -> Result<(), AppError> {
    let mut monitor = Monitor::build(cfg, mode, sources)?;
    let poll_seconds = match mode {
        Mode::Code => cfg.code_poll_seconds,
        Mode::Console => cfg.console_poll_seconds,
    };
    tracing::info!(mode = mode.as_label(), poll_seconds, "starting dashboard");

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    stdout.execute(EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let loop_result = run_loop(
        &mut terminal,
        &mut monitor,
        mode,
        StdDuration::from_secs(poll_seconds),
    )
    .await;

    disable_raw_mode()?;
    terminal.backend_mut().execute(LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    tracing::info!("dashboard closed");
    loop_result
}

async fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    monitor: &mut Monitor,
    mode: Mode,
    tick_rate: StdDuration,
) -> Result<(), AppError> {
    let mut state = AppState::new(mode);
    state.status = "refreshing...".into();
    terminal.draw(|f| render(f, &state))?;

    monitor.refresh(&mut state).await;
    let mut last_tick = Instant::now();

    while state.running {
        terminal.draw(|f| render(f, &state))?;

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| StdDuration::from_millis(0));

        let mut refresh_now = false;
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key_action(key.code, key.modifiers) {
                        KeyAction::Quit => state.running = false,
                        KeyAction::Refresh => refresh_now = true,
                        KeyAction::None => {}
                    }
                }
            }
        }

        if state.running && (refresh_now || last_tick.elapsed() >= tick_rate) {
            state.status = "refreshing...".into();
            terminal.draw(|f| render(f, &state))?;
            monitor.refresh(&mut state).await;
            last_tick = Instant::now();
        }
    }

    Ok(())
}

fn render(f: &mut ratatui::Frame, state: &AppState) {
    let error_height = if state.view.error().is_some() { 3 } else { 0 };
    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(error_height),
            Constraint::Length(3),
        ])
        .split(f.area());

    let title = match &state.view {
        DashboardView::Code(view) => code_title(view),
        DashboardView::Console(view) => console_title(view),
    };
    let header = Paragraph::new(format!(
        " claude-usage  ·  {}  ·  {}  ·  updated {} ",
        title,
        state.status,
        format_last_update(state.view.last_update())
    ))
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" {} mode ", state.mode.as_label())),
    )
    .style(Style::default().fg(COLOR_HEADER));
    f.render_widget(header, root[0]);

    match &state.view {
        DashboardView::Code(view) => render_code(f, root[1], view),
        DashboardView::Console(view) => render_console(f, root[1], view),
    }

    if let Some(err) = state.view.error() {
        let error = Paragraph::new(err.to_string())
            .block(Block::default().borders(Borders::ALL).title(" Error "))
            .style(Style::default().fg(Color::Red))
            .wrap(Wrap { trim: true });
        f.render_widget(error, root[2]);
    }

    let footer = Paragraph::new("r refresh | q/Esc/Ctrl+C quit")
        .block(Block::default().borders(Borders::ALL))
        .style(Style::default().fg(COLOR_MUTED));
    f.render_widget(footer, root[3]);
}

fn code_title(view: &CodeView) -> String {
    let Some(profile) = &view.profile else {
        return "Claude Code".into();
    };
    let plan = if profile.account.has_claude_max {
        "Max"
    } else if profile.account.has_claude_pro {
        "Pro"
    } else {
        "Free"
    };
    match &profile.account.email {
        Some(email) => format!("{email} ({plan})"),
        None => format!("Claude Code ({plan})"),
    }
}

fn console_title(view: &ConsoleView) -> String {
    let org = view
        .organization
        .as_ref()
        .map(|o| o.name.clone())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "Anthropic Console".into());
    match view.cost.as_ref().map(|c| c.period_label.as_str()) {
        Some(period) if !period.is_empty() => format!("{org}  ·  {period}"),
        _ => org,
    }
}

fn window_gauge(title: &str, window: &UsageWindow) -> Gauge<'static> {
    let now = Utc::now();
    let reset = window
        .resets_at
        .as_deref()
        .and_then(parse_reset_timestamp)
        .map(|ts| {
            let hours = (ts - now).num_seconds() as f64 / 3600.0;
            format!("  ·  resets in {}", format_duration_hours(hours))
        })
        .unwrap_or_default();

    Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(format!(" {title} ")))
        .gauge_style(Style::default().fg(usage_color(window.utilization)))
        .ratio(gauge_ratio(window.utilization))
        .label(format!("{:.1}%{reset}", window.utilization))
}

fn projection_line(label: &str, projection: &Projection, unit: Unit) -> Line<'static> {
    let value_style = match unit {
        Unit::Percent if projection.projected_value >= 100.0 => Style::default().fg(Color::Red),
        _ => Style::default().fg(COLOR_ACCENT),
    };
    Line::from(vec![
        Span::raw(format!("{label}: ")),
        Span::styled(
            unit.format(projection.projected_value),
            value_style.add_modifier(Modifier::BOLD),
        ),
        Span::styled(
            format!(
                "  (+{}/h, {} left)",
                unit.format(projection.rate_per_hour),
                format_duration_hours(projection.hours_until_boundary)
            ),
            Style::default().fg(COLOR_MUTED),
        ),
    ])
}

#[derive(Clone, Copy)]
enum Unit {
    Percent,
    Credits,
    Dollars,
}

impl Unit {
    fn format(self, value: f64) -> String {
        match self {
            Unit::Percent => format!("{value:.1}%"),
            Unit::Credits => format!("{value:.0}"),
            Unit::Dollars => format!("${value:.2}"),
        }
    }
}

fn render_code(f: &mut ratatui::Frame, area: Rect, view: &CodeView) {
    let Some(usage) = &view.usage else {
        let waiting = Paragraph::new("Waiting for usage data...")
            .block(Block::default().borders(Borders::ALL).title(" Usage "));
        f.render_widget(waiting, area);
        return;
    };

    let windows: Vec<(&str, &UsageWindow)> = [
        ("5-hour", usage.five_hour.as_ref()),
        ("7-day", usage.seven_day.as_ref()),
        ("7-day Sonnet", usage.seven_day_sonnet.as_ref()),
        ("7-day Opus", usage.seven_day_opus.as_ref()),
    ]
    .into_iter()
    .filter_map(|(title, window)| window.map(|w| (title, w)))
    .collect();

    let mut constraints: Vec<Constraint> = windows.iter().map(|_| Constraint::Length(3)).collect();
    constraints.push(Constraint::Length(5));
    constraints.push(Constraint::Min(4));
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints(constraints)
        .split(area);

    for (idx, (title, window)) in windows.iter().enumerate() {
        f.render_widget(window_gauge(title, window), rows[idx]);
    }

    let mut lines = Vec::new();
    if let Some(extra) = usage.extra_usage.as_ref().filter(|e| e.is_enabled) {
        let used = extra.used_credits.unwrap_or(0.0);
        let limit = extra
            .monthly_limit
            .map(|l| format!(" of {l:.0}"))
            .unwrap_or_default();
        lines.push(Line::from(format!("Extra usage credits: {used:.0}{limit}")));
    }
    if let Some(p) = &view.utilization_projection {
        lines.push(projection_line("5-hour at reset", p, Unit::Percent));
    }
    if let Some(p) = &view.credits_projection {
        lines.push(projection_line("Credits at reset", p, Unit::Credits));
    }
    if lines.is_empty() {
        lines.push(Line::styled("Collecting history for projections...", Style::default().fg(COLOR_MUTED)));
    }
    let projections = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(" Projection "));
    f.render_widget(projections, rows[windows.len()]);

    render_pacemaker(f, rows[windows.len() + 1], view);
}

fn render_pacemaker(f: &mut ratatui::Frame, area: Rect, view: &CodeView) {
    let Some(status) = &view.pacemaker else {
        let absent = Paragraph::new("Pace-maker not installed")
            .block(Block::default().borders(Borders::ALL).title(" Pace-maker "))
            .style(Style::default().fg(COLOR_MUTED));
        f.render_widget(absent, area);
        return;
    };

    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
        .split(area);

    let mut left = vec![Line::from(vec![
        Span::raw("Status: "),
        if status.enabled {
            Span::styled("enabled", Style::default().fg(COLOR_INFO))
        } else {
            Span::styled("disabled", Style::default().fg(COLOR_MUTED))
        },
    ])];
    match &status.latest {
        Some(latest) => {
            if let Some(util) = latest.five_hour_util {
                left.push(Line::from(format!("5-hour: {util:.1}%")));
            }
            if let Some(util) = latest.seven_day_util {
                left.push(Line::from(format!("7-day: {util:.1}%")));
            }
            left.push(Line::styled(
                format!("Last sample: {}", format_last_update(Some(latest.timestamp))),
                Style::default().fg(COLOR_MUTED),
            ));
        }
        None => left.push(Line::styled("No usage samples", Style::default().fg(COLOR_MUTED))),
    }
    let status_panel = Paragraph::new(left)
        .block(Block::default().borders(Borders::ALL).title(" Pace-maker "));
    f.render_widget(status_panel, cols[0]);

    let rows = view
        .blockages
        .as_ref()
        .map(|stats| stats.rows())
        .unwrap_or_default()
        .into_iter()
        .map(|(label, count)| Row::new(vec![Cell::from(label), Cell::from(count.to_string())]))
        .collect::<Vec<_>>();
    let table = Table::new(rows, [Constraint::Percentage(70), Constraint::Percentage(30)])
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(" Blockages (last hour) "),
        );
    f.render_widget(table, cols[1]);
}

fn render_console(f: &mut ratatui::Frame, area: Rect, view: &ConsoleView) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(6), Constraint::Length(3), Constraint::Min(4)])
        .split(area);

    let mut cost_lines = Vec::new();
    match (&view.user_email, view.user_cost) {
        (Some(email), Some(cost)) => cost_lines.push(Line::from(vec![
            Span::raw("Your Claude Code spend: "),
            Span::styled(
                format!("${cost:.2}"),
                Style::default().fg(COLOR_ACCENT).add_modifier(Modifier::BOLD),
            ),
            Span::styled(format!("  ({email})"), Style::default().fg(COLOR_MUTED)),
        ])),
        _ => cost_lines.push(Line::styled(
            "Current user not identified; tracking organization total",
            Style::default().fg(COLOR_MUTED),
        )),
    }
    if let Some(cost) = &view.cost {
        cost_lines.push(Line::from(format!(
            "Organization month-to-date: ${:.2}",
            cost.total_cost_usd
        )));
    }
    cost_lines.push(Line::from(format!("Workspaces: {}", view.workspaces.len())));
    let costs = Paragraph::new(cost_lines)
        .block(Block::default().borders(Borders::ALL).title(" Cost "));
    f.render_widget(costs, rows[0]);

    let projection = match &view.projection {
        Some(p) => projection_line("End of month", p, Unit::Dollars),
        None => Line::styled("Collecting history for projections...", Style::default().fg(COLOR_MUTED)),
    };
    let projection = Paragraph::new(projection)
        .block(Block::default().borders(Borders::ALL).title(" Projection "));
    f.render_widget(projection, rows[1]);

    let model_rows = view
        .usage
        .as_ref()
        .map(|usage| {
            usage
                .by_model
                .iter()
                .map(|(model, tokens)| {
                    Row::new(vec![
                        Cell::from(model.clone()),
                        Cell::from(format_tokens(tokens.input_tokens)),
                        Cell::from(format_tokens(tokens.output_tokens)),
                        Cell::from(format_tokens(
                            tokens.cache_creation_input_tokens + tokens.cache_read_input_tokens,
                        )),
                    ])
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let table = Table::new(
        model_rows,
        [
            Constraint::Percentage(46),
            Constraint::Percentage(18),
            Constraint::Percentage(18),
            Constraint::Percentage(18),
        ],
    )
    .header(
        Row::new(vec!["Model", "Input", "Output", "Cache"]).style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ),
    )
    .block(Block::default().borders(Borders::ALL).title(" Tokens By Model "));
    f.render_widget(table, rows[2]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Organization, Profile, ProfileAccount};

    #[test]
    fn code_title_shows_plan() {
        let view = CodeView {
            profile: Some(Profile {
                account: ProfileAccount {
                    email: Some("dev@example.com".into()),
                    has_claude_max: true,
                    ..ProfileAccount::default()
                },
                ..Profile::default()
            }),
            ..CodeView::default()
        };
        assert_eq!(code_title(&view), "dev@example.com (Max)");
        assert_eq!(code_title(&CodeView::default()), "Claude Code");
    }

    #[test]
    fn console_title_includes_period() {
        let mut view = ConsoleView {
            organization: Some(Organization {
                id: None,
                name: "Acme".into(),
            }),
            ..ConsoleView::default()
        };
        assert_eq!(console_title(&view), "Acme");
        view.cost = Some(crate::models::CostSummary {
            total_cost_usd: 1.0,
            period_label: "November 2025".into(),
        });
        assert_eq!(console_title(&view), "Acme  ·  November 2025");
    }

    #[test]
    fn units_format_values() {
        assert_eq!(Unit::Percent.format(61.26), "61.3%");
        assert_eq!(Unit::Credits.format(599.6), "600");
        assert_eq!(Unit::Dollars.format(3.5), "$3.50");
    }
}
