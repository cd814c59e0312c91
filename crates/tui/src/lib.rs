use std::io::{self, Stdout};
use std::time::{Duration, Instant};

use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
    KeyModifiers,
};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use quack_adapters::duckdb_engine::DuckDbEngine;
use quack_core::engine::{Engine, EngineError};
use quack_core::fields::{FileFieldsStore, PersistedFields};
use quack_core::records::Record;
use quack_core::session::{SessionController, SessionPhase, SessionSnapshot};
use quack_core::settings::Settings;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use thiserror::Error;
use tokio::sync::watch;
use tracing::warn;

const TICK_RATE: Duration = Duration::from_millis(120);
const CELL_WIDTH: usize = 24;

#[derive(Debug, Error)]
pub enum TuiError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pane {
    Source,
    Query,
    Results,
}

impl Pane {
    fn next(self) -> Self {
        match self {
            Self::Source => Self::Query,
            Self::Query => Self::Results,
            Self::Results => Self::Source,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Source => "Source",
            Self::Query => "Query",
            Self::Results => "Results",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectionKey {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Msg {
    Quit,
    ToggleHelp,
    NextPane,
    Submit,
    LoadExample,
    Reload,
    Clear,
    Input(char),
    Backspace,
    Navigate(DirectionKey),
    Tick,
}

struct TuiApp<E: Engine> {
    session: SessionController<E>,
    updates: watch::Receiver<SessionSnapshot>,
    snapshot: SessionSnapshot,
    fields: Option<FileFieldsStore>,
    example_source: String,
    pane: Pane,
    source_input: String,
    query_input: String,
    results_cursor: usize,
    show_help: bool,
    should_quit: bool,
    status_line: String,
}

impl<E: Engine> TuiApp<E> {
    fn new(
        session: SessionController<E>,
        example_source: String,
        fields: Option<FileFieldsStore>,
    ) -> Self {
        let updates = session.subscribe();
        let snapshot = session.snapshot();
        Self {
            session,
            updates,
            snapshot,
            fields,
            example_source,
            pane: Pane::Source,
            source_input: String::new(),
            query_input: String::new(),
            results_cursor: 0,
            show_help: false,
            should_quit: false,
            status_line: "Enter a Parquet URL and press Enter to load it".to_string(),
        }
    }

    // The query goes first so the restored text wins over the default one.
    fn restore(&mut self) {
        let Some(persisted) = self.fields.as_ref().map(|store| store.fields().clone()) else {
            return;
        };

        self.query_input.clone_from(&persisted.query);
        self.source_input.clone_from(&persisted.source);
        if !persisted.query.is_empty() {
            let _ = self.session.set_query(persisted.query);
        }
        if !persisted.source.is_empty() {
            self.session.set_source(persisted.source);
            self.status_line = "Restored previous dataset".to_string();
        }
    }

    fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Quit => self.should_quit = true,
            Msg::ToggleHelp => self.show_help = !self.show_help,
            Msg::NextPane => {
                self.pane = self.pane.next();
                self.status_line = format!("Switched pane to {}", self.pane.name());
            }
            Msg::Submit => self.submit(),
            Msg::LoadExample => {
                self.source_input.clone_from(&self.example_source);
                self.session.set_source(self.example_source.clone());
                self.status_line = "Loading example dataset".to_string();
            }
            Msg::Reload => {
                self.session.load_dataset();
                self.status_line = "Reloading dataset".to_string();
            }
            Msg::Clear => {
                self.source_input.clear();
                self.query_input.clear();
                self.results_cursor = 0;
                self.session.clear_dataset();
                self.status_line = "Cleared".to_string();
            }
            Msg::Input(ch) => {
                if let Some(input) = self.focused_input() {
                    input.push(ch);
                }
            }
            Msg::Backspace => {
                if let Some(input) = self.focused_input() {
                    input.pop();
                }
            }
            Msg::Navigate(direction) => self.navigate_results(direction),
            Msg::Tick => self.on_tick(),
        }
    }

    fn focused_input(&mut self) -> Option<&mut String> {
        match self.pane {
            Pane::Source => Some(&mut self.source_input),
            Pane::Query => Some(&mut self.query_input),
            Pane::Results => None,
        }
    }

    fn submit(&mut self) {
        match self.pane {
            Pane::Source => {
                let source = self.source_input.trim().to_string();
                if source.is_empty() {
                    self.handle(Msg::Clear);
                    return;
                }
                self.results_cursor = 0;
                self.status_line = format!("Loading {source}");
                self.session.set_source(source);
            }
            Pane::Query => {
                let ran = self.session.set_query(self.query_input.clone()).is_some();
                self.results_cursor = 0;
                self.status_line = if ran {
                    "Running query".to_string()
                } else if self.session.snapshot().table_loaded {
                    "Query is empty".to_string()
                } else {
                    "Query saved; it runs once a dataset is loaded".to_string()
                };
            }
            Pane::Results => {
                self.status_line = "Nothing to submit in this view".to_string();
            }
        }
    }

    fn on_tick(&mut self) {
        if !self.updates.has_changed().unwrap_or(false) {
            return;
        }

        let snapshot = self.updates.borrow_and_update().clone();
        if snapshot.query != self.snapshot.query {
            self.query_input.clone_from(&snapshot.query);
        }
        if snapshot.dataset != self.snapshot.dataset {
            self.results_cursor = 0;
        }
        self.snapshot = snapshot;
        self.persist_fields();
    }

    fn persist_fields(&mut self) {
        let Some(store) = self.fields.as_mut() else {
            return;
        };
        if !store.update(PersistedFields::from_snapshot(&self.snapshot)) {
            return;
        }
        if let Err(error) = store.persist() {
            warn!(%error, "failed to persist fields");
            self.status_line = format!("Could not save fields: {error}");
        }
    }

    fn navigate_results(&mut self, direction: DirectionKey) {
        let row_count = self.snapshot.dataset.as_deref().map_or(0, <[Record]>::len);
        if row_count == 0 {
            self.status_line = "No rows to scroll".to_string();
            return;
        }

        match direction {
            DirectionKey::Up => self.results_cursor = self.results_cursor.saturating_sub(1),
            DirectionKey::Down => {
                self.results_cursor = (self.results_cursor + 1).min(row_count - 1);
            }
        }
        self.status_line = format!("Row {} / {}", self.results_cursor + 1, row_count);
    }

    async fn shutdown(self) -> Result<(), EngineError> {
        self.session.shutdown().await
    }
}

pub fn run(settings: &Settings, fields: Option<FileFieldsStore>) -> Result<(), TuiError> {
    let engine = DuckDbEngine::open_in_memory()?;
    run_with_engine(engine, settings, fields)
}

pub fn run_with_engine<E: Engine>(
    engine: E,
    settings: &Settings,
    fields: Option<FileFieldsStore>,
) -> Result<(), TuiError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let _entered = runtime.enter();

    let session = SessionController::new(engine, settings.load_plan());
    let mut app = TuiApp::new(session, settings.example_source.clone(), fields);
    app.restore();

    let mut terminal = setup_terminal()?;
    let run_result = run_loop(&mut terminal, &mut app);
    let restore_result = restore_terminal(&mut terminal);
    let shutdown_result = runtime.block_on(app.shutdown());

    run_result?;
    restore_result?;
    shutdown_result?;
    Ok(())
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>, TuiError> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;
    Ok(terminal)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<(), TuiError> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

fn run_loop<E: Engine>(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut TuiApp<E>,
) -> Result<(), TuiError> {
    let mut last_tick = Instant::now();

    loop {
        terminal.draw(|frame| render(frame, app))?;

        let timeout = TICK_RATE
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    if let Some(message) = map_key_event(key) {
                        app.handle(message);
                    }
                }
            }
        }

        if last_tick.elapsed() >= TICK_RATE {
            app.handle(Msg::Tick);
            last_tick = Instant::now();
        }

        if app.should_quit {
            break;
        }
    }

    Ok(())
}

fn render<E: Engine>(frame: &mut Frame<'_>, app: &TuiApp<E>) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(4),
            Constraint::Min(8),
            Constraint::Length(4),
        ])
        .split(frame.area());

    frame.render_widget(
        input_box("Dataset URL", &app.source_input, app.pane == Pane::Source),
        chunks[0],
    );
    frame.render_widget(
        input_box("Query", &app.query_input, app.pane == Pane::Query),
        chunks[1],
    );

    let mut lines = Vec::new();
    if app.snapshot.loading {
        lines.push(Line::from(Span::styled(
            "Loading...",
            Style::default().add_modifier(Modifier::BOLD),
        )));
    }
    if app.snapshot.querying {
        lines.push(Line::from("Querying..."));
    }
    if let Some(error) = &app.snapshot.error {
        lines.push(Line::from(Span::styled(
            error.clone(),
            Style::default().fg(Color::Red),
        )));
    }
    if let Some(rows) = app.snapshot.dataset.as_deref() {
        let visible_limit = usize::from(chunks[2].height.saturating_sub(3)).max(1);
        let window_start = app.results_cursor.saturating_sub(visible_limit / 2);
        lines.extend(
            table_lines(rows, window_start, visible_limit)
                .into_iter()
                .map(Line::from),
        );
    }
    let results = Paragraph::new(lines)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(results_title(&app.snapshot))
                .border_style(focus_style(app.pane == Pane::Results)),
        )
        .alignment(Alignment::Left);
    frame.render_widget(results, chunks[2]);

    let footer = Paragraph::new(vec![
        Line::from("Enter: submit | Tab: next pane | Ctrl+E: example | Ctrl+R: reload | Ctrl+L: clear | F1: help | Esc: quit"),
        Line::from(format!("Status: {}", app.status_line)),
    ])
    .block(Block::default().borders(Borders::ALL).title("quack"));
    frame.render_widget(footer, chunks[3]);

    if app.show_help {
        render_help_popup(frame);
    }
}

fn input_box<'a>(title: &'a str, value: &'a str, focused: bool) -> Paragraph<'a> {
    Paragraph::new(value)
        .wrap(Wrap { trim: false })
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(title)
                .border_style(focus_style(focused)),
        )
}

fn focus_style(focused: bool) -> Style {
    if focused {
        Style::default().fg(Color::Yellow)
    } else {
        Style::default()
    }
}

fn results_title(snapshot: &SessionSnapshot) -> String {
    let phase = match snapshot.phase() {
        SessionPhase::Idle => "idle",
        SessionPhase::LoadingSource => "loading",
        SessionPhase::SourceLoaded => "loaded",
        SessionPhase::Querying => "querying",
        SessionPhase::Ready => "ready",
        SessionPhase::Failed => "failed",
    };
    match snapshot.dataset.as_deref() {
        Some(rows) => format!("Results ({phase}, {} rows)", rows.len()),
        None => format!("Results ({phase})"),
    }
}

fn table_lines(rows: &[Record], start: usize, limit: usize) -> Vec<String> {
    let Some(first) = rows.first() else {
        return vec!["No rows".to_string()];
    };

    let headers = first.columns().map(str::to_string).collect::<Vec<_>>();
    let mut lines = vec![headers
        .iter()
        .map(|header| fit_cell(header))
        .collect::<Vec<_>>()
        .join(" | ")];
    for row in rows.iter().skip(start).take(limit) {
        lines.push(
            headers
                .iter()
                .map(|header| {
                    row.get(header)
                        .map_or_else(String::new, |value| fit_cell(&value.to_string()))
                })
                .collect::<Vec<_>>()
                .join(" | "),
        );
    }
    lines
}

fn fit_cell(text: &str) -> String {
    let single_line = text.replace(['\n', '\r'], " ");
    if single_line.chars().count() <= CELL_WIDTH {
        return single_line;
    }
    let mut truncated = single_line
        .chars()
        .take(CELL_WIDTH.saturating_sub(1))
        .collect::<String>();
    truncated.push('…');
    truncated
}

fn render_help_popup(frame: &mut Frame<'_>) {
    let area = centered_rect(70, 60, frame.area());
    frame.render_widget(Clear, area);
    let help = Paragraph::new(vec![
        Line::from("Keymap"),
        Line::from("Esc / Ctrl+C: quit"),
        Line::from("F1: toggle help"),
        Line::from("Tab: cycle panes"),
        Line::from("Enter: load the URL or run the query (by pane)"),
        Line::from("Ctrl+E: load the example dataset"),
        Line::from("Ctrl+R: reload the current dataset"),
        Line::from("Ctrl+L: clear everything"),
        Line::from("Up / Down: scroll results"),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    frame.render_widget(help, area);
}

fn centered_rect(width_percent: u16, height_percent: u16, area: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100_u16 - height_percent) / 2),
            Constraint::Percentage(height_percent),
            Constraint::Percentage((100_u16 - height_percent) / 2),
        ])
        .split(area);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100_u16 - width_percent) / 2),
            Constraint::Percentage(width_percent),
            Constraint::Percentage((100_u16 - width_percent) / 2),
        ])
        .split(vertical[1])[1]
}

fn map_key_event(key: KeyEvent) -> Option<Msg> {
    match (key.modifiers, key.code) {
        (_, KeyCode::Esc) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => Some(Msg::Quit),
        (KeyModifiers::CONTROL, KeyCode::Char('e')) => Some(Msg::LoadExample),
        (KeyModifiers::CONTROL, KeyCode::Char('r')) => Some(Msg::Reload),
        (KeyModifiers::CONTROL, KeyCode::Char('l')) => Some(Msg::Clear),
        (_, KeyCode::F(1)) => Some(Msg::ToggleHelp),
        (_, KeyCode::Tab) => Some(Msg::NextPane),
        (_, KeyCode::Enter) => Some(Msg::Submit),
        (_, KeyCode::Backspace) => Some(Msg::Backspace),
        (_, KeyCode::Up) => Some(Msg::Navigate(DirectionKey::Up)),
        (_, KeyCode::Down) => Some(Msg::Navigate(DirectionKey::Down)),
        (KeyModifiers::NONE | KeyModifiers::SHIFT, KeyCode::Char(ch)) => Some(Msg::Input(ch)),
        _ => None,
    }
}
