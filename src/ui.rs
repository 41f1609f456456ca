use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use firm_map::{
    LayerTree, MapSession, MarkerHandle, NoticeLevel, PasswordGate, Popup, RowSource,
    SessionSettings, SyncEngine, SyncTasks, ViewState,
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{
        canvas::{Canvas, Map, MapResolution, Points},
        Block, Borders, Cell, Paragraph, Row, Table, TableState, Wrap,
    },
    Frame, Terminal,
};
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

const TICK: Duration = Duration::from_millis(250);

/// Logged-in state: the engine owns the session, the tasks keep it fresh
struct LiveSession {
    engine: SyncEngine<LayerTree>,
    tasks: SyncTasks,
}

pub struct App {
    runtime: Handle,
    source: Arc<dyn RowSource>,
    settings: SessionSettings,
    refresh_every: Duration,
    gate: PasswordGate,
    password_input: String,
    login_error: Option<&'static str>,
    live: Option<LiveSession>,
    layer_state: TableState,
}

impl App {
    pub fn new(
        runtime: Handle,
        source: Arc<dyn RowSource>,
        settings: SessionSettings,
        refresh_every: Duration,
        gate: PasswordGate,
    ) -> Self {
        Self {
            runtime,
            source,
            settings,
            refresh_every,
            gate,
            password_input: String::new(),
            login_error: None,
            live: None,
            layer_state: TableState::default(),
        }
    }

    // ========================================================================
    // Login / logout
    // ========================================================================

    fn submit_password(&mut self) {
        if !self.gate.check(&self.password_input) {
            self.login_error = Some(PasswordGate::REJECTED);
            self.password_input.clear();
            return;
        }

        self.password_input.clear();
        self.login_error = None;

        let session = MapSession::open(self.settings.clone(), LayerTree::new());
        let engine = SyncEngine::new(Arc::clone(&self.source), session);
        let tasks = self.runtime.block_on(engine.start(self.refresh_every));

        self.layer_state.select(Some(0));
        self.live = Some(LiveSession { engine, tasks });
        info!("viewer logged in");
    }

    fn logout(&mut self) {
        if let Some(live) = self.live.take() {
            live.engine.close(live.tasks);
            info!("viewer logged out");
        }
        self.layer_state.select(None);
    }

    // ========================================================================
    // Map controls
    // ========================================================================

    fn refresh(&self) {
        if let Some(live) = &self.live {
            let engine = live.engine.clone();
            self.runtime.spawn(async move {
                engine.refresh_now().await;
            });
        }
    }

    fn selected_layer(&self, session: &MapSession<LayerTree>) -> Option<(String, bool)> {
        let controls = session.layer_controls();
        let index = self.layer_state.selected()?;
        controls
            .get(index)
            .map(|control| (control.category.clone(), control.visible))
    }

    fn toggle_selected_layer(&mut self) {
        let Some(live) = &self.live else { return };
        let mut session = live.engine.session();
        if let Some((category, visible)) = self.selected_layer(&session) {
            session.toggle_layer(&category, !visible);
        }
    }

    fn move_layer_cursor(&mut self, forward: bool) {
        let Some(live) = &self.live else { return };
        let count = live.engine.session().layer_controls().len();
        if count == 0 {
            return;
        }
        let current = self.layer_state.selected().unwrap_or(0);
        let next = if forward {
            (current + 1) % count
        } else {
            (current + count - 1) % count
        };
        self.layer_state.select(Some(next));
    }

    /// Step the selection through markers currently on screen
    fn step_marker(&mut self, forward: bool) {
        let Some(live) = &self.live else { return };
        let mut session = live.engine.session();

        let handles: Vec<MarkerHandle> = session
            .surface()
            .visible_markers()
            .iter()
            .map(|marker| marker.handle)
            .collect();
        if let Some(handle) = step(&handles, session.selected(), forward) {
            session.select_marker(handle);
        }
    }

    fn with_session(&self, action: impl FnOnce(&mut MapSession<LayerTree>)) {
        if let Some(live) = &self.live {
            action(&mut live.engine.session());
        }
    }
}

/// Next (or previous) handle after `current`, wrapping around
fn step(handles: &[MarkerHandle], current: Option<MarkerHandle>, forward: bool) -> Option<MarkerHandle> {
    if handles.is_empty() {
        return None;
    }
    let position = current.and_then(|handle| handles.iter().position(|h| *h == handle));
    let index = match (position, forward) {
        (None, true) => 0,
        (None, false) => handles.len() - 1,
        (Some(i), true) => (i + 1) % handles.len(),
        (Some(i), false) => (i + handles.len() - 1) % handles.len(),
    };
    handles.get(index).copied()
}

// ============================================================================
// TERMINAL LOOP
// ============================================================================

pub fn run_ui(app: &mut App) -> Result<()> {
    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, app);

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    app.logout();
    res
}

fn run_app<B: ratatui::backend::Backend>(terminal: &mut Terminal<B>, app: &mut App) -> Result<()> {
    loop {
        app.with_session(|session| session.prune_notices());
        terminal.draw(|f| ui(f, app))?;

        // Redraw on every tick so background refreshes show up
        if !event::poll(TICK)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        if app.live.is_none() {
            match key.code {
                KeyCode::Esc => return Ok(()),
                KeyCode::Enter => app.submit_password(),
                KeyCode::Backspace => {
                    app.password_input.pop();
                }
                KeyCode::Char(c) => app.password_input.push(c),
                _ => {}
            }
            continue;
        }

        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
            KeyCode::Char('l') => app.logout(),
            KeyCode::Char('r') => app.refresh(),
            KeyCode::Char(' ') => app.toggle_selected_layer(),
            KeyCode::Char('a') => app.with_session(|s| s.select_all_layers()),
            KeyCode::Char('c') => app.with_session(|s| s.clear_all_layers()),
            KeyCode::Char('j') | KeyCode::Tab => app.move_layer_cursor(true),
            KeyCode::Char('k') | KeyCode::BackTab => app.move_layer_cursor(false),
            KeyCode::Char('n') => app.step_marker(true),
            KeyCode::Char('p') => app.step_marker(false),
            KeyCode::Up => app.with_session(|s| s.pan(1.0, 0.0)),
            KeyCode::Down => app.with_session(|s| s.pan(-1.0, 0.0)),
            KeyCode::Left => app.with_session(|s| s.pan(0.0, -1.0)),
            KeyCode::Right => app.with_session(|s| s.pan(0.0, 1.0)),
            KeyCode::Char('+') | KeyCode::Char('=') => app.with_session(|s| s.zoom_in()),
            KeyCode::Char('-') => app.with_session(|s| s.zoom_out()),
            KeyCode::Char('0') => app.with_session(|s| s.reset_view()),
            KeyCode::Char('f') => app.with_session(|s| s.toggle_fullscreen()),
            _ => {}
        }
    }
}

// ============================================================================
// RENDERING
// ============================================================================

fn ui(f: &mut Frame, app: &mut App) {
    let area = f.size();
    let Some(live) = &app.live else {
        render_login(f, area, app);
        return;
    };
    let engine = live.engine.clone();
    let session = engine.session();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(0),    // Map + panels
            Constraint::Length(3), // Status bar
        ])
        .split(area);

    if session.view().fullscreen {
        render_map(f, chunks[0], &session);
    } else {
        let content = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Min(40), Constraint::Length(36)])
            .split(chunks[0]);
        let side = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(content[1]);

        render_map(f, content[0], &session);
        render_layers(f, side[0], &session, &mut app.layer_state);
        render_details(f, side[1], &session);
    }

    render_status_bar(f, chunks[1], &session, engine.is_refreshing());
}

fn render_login(f: &mut Frame, area: Rect, app: &App) {
    let masked = "•".repeat(app.password_input.chars().count());

    let mut content = vec![
        Line::from(""),
        Line::from(Span::styled(
            "Firm Locations Map",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        )),
        Line::from(""),
        Line::from(vec![
            Span::styled("Password: ", Style::default().fg(Color::Yellow)),
            Span::raw(masked),
        ]),
        Line::from(""),
    ];
    if let Some(error) = app.login_error {
        content.push(Line::from(Span::styled(error, Style::default().fg(Color::Red))));
    }
    content.push(Line::from(Span::styled(
        "Enter to sign in, Esc to quit",
        Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
    )));

    let form = Paragraph::new(content).alignment(Alignment::Center).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Cyan))
            .title(" Sign in "),
    );

    f.render_widget(form, centered(area, 50, 11));
}

fn render_map(f: &mut Frame, area: Rect, session: &MapSession<LayerTree>) {
    let (x_bounds, y_bounds) = map_bounds(session.view());
    let surface = session.surface();

    // One point set per attached layer, in that layer's colour
    let mut layers: BTreeMap<&str, (Color, Vec<(f64, f64)>)> = BTreeMap::new();
    let visible = surface.visible_markers();
    for marker in &visible {
        let position = marker.spec.position;
        layers
            .entry(marker.category.as_str())
            .or_insert_with(|| (hex_color(&marker.spec.style.color), Vec::new()))
            .1
            .push((position.lng, position.lat));
    }

    let selected = session
        .selected()
        .and_then(|handle| surface.marker(handle))
        .filter(|marker| surface.is_attached(&marker.category))
        .map(|marker| marker.spec.position);

    let title = format!(" Firm Map ({} shown / {} firms) ", visible.len(), session.snapshot().len());
    let canvas = Canvas::default()
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::White))
                .title(title),
        )
        .marker(symbols::Marker::Braille)
        .x_bounds(x_bounds)
        .y_bounds(y_bounds)
        .paint(|ctx| {
            ctx.draw(&Map {
                resolution: MapResolution::High,
                color: Color::DarkGray,
            });
            ctx.layer();
            for (color, coords) in layers.values() {
                ctx.draw(&Points {
                    coords,
                    color: *color,
                });
            }
            if let Some(position) = selected {
                ctx.print(
                    position.lng,
                    position.lat,
                    Span::styled("◆", Style::default().fg(Color::White).add_modifier(Modifier::BOLD)),
                );
            }
        });

    f.render_widget(canvas, area);
}

fn render_layers(f: &mut Frame, area: Rect, session: &MapSession<LayerTree>, state: &mut TableState) {
    let classifier = session.classifier();

    let rows = session.layer_controls().into_iter().map(|control| {
        let checkbox = if control.checked { "[x]" } else { "[ ]" };
        let name_style = if control.visible {
            Style::default().fg(hex_color(classifier.color_for(&control.category)))
        } else {
            Style::default().fg(Color::DarkGray)
        };

        Row::new(vec![
            Cell::from(checkbox),
            Cell::from(truncate(&control.category, 18)).style(name_style),
            Cell::from(control.count.to_string()),
        ])
    });

    let table = Table::new(
        rows,
        [Constraint::Length(3), Constraint::Min(10), Constraint::Length(5)],
    )
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::White))
            .title(" Layers "),
    )
    .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD))
    .highlight_symbol("→ ");

    f.render_stateful_widget(table, area, state);
}

fn render_details(f: &mut Frame, area: Rect, session: &MapSession<LayerTree>) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow))
        .title(" Firm Details ");

    let Some(record) = session.selected_record() else {
        let hint = Paragraph::new("No firm selected\n\nn/p steps through markers").block(block);
        f.render_widget(hint, area);
        return;
    };

    let label = Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD);
    let popup = Popup::for_record(record);

    let mut content = vec![
        Line::from(Span::styled(
            popup.title.clone(),
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        )),
        Line::from(vec![Span::styled("Category: ", label), Span::raw(record.category.clone())]),
    ];
    for (name, value) in popup.lines.iter().skip(1) {
        if !value.is_empty() {
            content.push(Line::from(vec![
                Span::styled(format!("{}: ", name), label),
                Span::raw(value.clone()),
            ]));
        }
    }
    content.push(Line::from(""));
    content.push(Line::from(Span::styled(
        popup.description.clone(),
        Style::default().fg(Color::Gray).add_modifier(Modifier::ITALIC),
    )));
    if let Some(website) = &popup.website {
        content.push(Line::from(""));
        content.push(Line::from(Span::styled(
            website.clone(),
            Style::default().fg(Color::Blue).add_modifier(Modifier::UNDERLINED),
        )));
    }

    let details = Paragraph::new(content).wrap(Wrap { trim: true }).block(block);
    f.render_widget(details, area);
}

fn render_status_bar(f: &mut Frame, area: Rect, session: &MapSession<LayerTree>, refreshing: bool) {
    let mut status_spans = Vec::new();

    match session.active_notices().last() {
        Some(notice) => {
            let color = match notice.level {
                NoticeLevel::Info => Color::Cyan,
                NoticeLevel::Success => Color::Green,
                NoticeLevel::Error => Color::Red,
            };
            status_spans.push(Span::styled(format!(" {} ", notice.message), Style::default().fg(color)));
        }
        None => status_spans.push(Span::styled(
            format!(" {} ", session.last_updated()),
            Style::default().fg(Color::DarkGray),
        )),
    }

    if refreshing {
        status_spans.push(Span::styled("| Refreshing... ", Style::default().fg(Color::Yellow)));
    }

    for (key, action) in [
        ("r", "Refresh"),
        ("space", "Layer"),
        ("a/c", "All/None"),
        ("←↑↓→ +/-", "Pan/Zoom"),
        ("0", "Reset"),
        ("n/p", "Firm"),
        ("f", "Full"),
        ("l", "Logout"),
    ] {
        status_spans.push(Span::raw("| "));
        status_spans.push(Span::styled(key, Style::default().fg(Color::Yellow)));
        status_spans.push(Span::raw(format!(" {} ", action)));
    }
    status_spans.push(Span::raw("| "));
    status_spans.push(Span::styled("q", Style::default().fg(Color::Red)));
    status_spans.push(Span::raw(" Quit"));

    let status_bar = Paragraph::new(Line::from(status_spans)).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::White)),
    );

    f.render_widget(status_bar, area);
}

// ============================================================================
// HELPERS
// ============================================================================

/// Canvas bounds for the current view; terminal cells are about twice as
/// tall as they are wide, so the latitude span is halved
fn map_bounds(view: &ViewState) -> ([f64; 2], [f64; 2]) {
    let half_lng = view.span_degrees() / 2.0;
    let half_lat = half_lng / 2.0;
    (
        [view.center.lng - half_lng, view.center.lng + half_lng],
        [view.center.lat - half_lat, view.center.lat + half_lat],
    )
}

/// `#rrggbb` to a terminal colour
fn hex_color(hex: &str) -> Color {
    let digits = hex.trim_start_matches('#');
    if digits.len() != 6 {
        return Color::Gray;
    }
    let channel = |range: std::ops::Range<usize>| {
        digits
            .get(range)
            .and_then(|part| u8::from_str_radix(part, 16).ok())
    };
    match (channel(0..2), channel(2..4), channel(4..6)) {
        (Some(r), Some(g), Some(b)) => Color::Rgb(r, g, b),
        _ => Color::Gray,
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(1)).collect();
        format!("{}…", kept)
    }
}

fn centered(area: Rect, width: u16, height: u16) -> Rect {
    let width = width.min(area.width);
    let height = height.min(area.height);
    Rect {
        x: area.x + (area.width - width) / 2,
        y: area.y + (area.height - height) / 2,
        width,
        height,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use firm_map::{LatLng, DEFAULT_CENTER, DEFAULT_ZOOM};

    #[test]
    fn test_hex_color() {
        assert_eq!(hex_color("#1f4e79"), Color::Rgb(0x1f, 0x4e, 0x79));
        assert_eq!(hex_color("#zzzzzz"), Color::Gray);
        assert_eq!(hex_color("red"), Color::Gray);
    }

    #[test]
    fn test_map_bounds_centered_on_view() {
        let view = ViewState::new(DEFAULT_CENTER, DEFAULT_ZOOM);
        let (x, y) = map_bounds(&view);

        assert!(((x[0] + x[1]) / 2.0 - DEFAULT_CENTER.lng).abs() < 1e-9);
        assert!(((y[0] + y[1]) / 2.0 - DEFAULT_CENTER.lat).abs() < 1e-9);
        assert!(x[1] - x[0] > y[1] - y[0]);

        let zoomed = ViewState::new(LatLng::new(0.0, 0.0), DEFAULT_ZOOM + 1);
        let (zx, _) = map_bounds(&zoomed);
        assert!(zx[1] - zx[0] < x[1] - x[0]);
    }

    #[test]
    fn test_step_wraps() {
        let handles = [MarkerHandle(1), MarkerHandle(4), MarkerHandle(9)];

        assert_eq!(step(&handles, None, true), Some(MarkerHandle(1)));
        assert_eq!(step(&handles, Some(MarkerHandle(9)), true), Some(MarkerHandle(1)));
        assert_eq!(step(&handles, Some(MarkerHandle(1)), false), Some(MarkerHandle(9)));
        assert_eq!(step(&[], None, true), None);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("Bain", 18), "Bain");
        assert_eq!(truncate("Oliver Wyman Group", 8), "Oliver …");
    }
}
