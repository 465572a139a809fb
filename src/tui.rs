//! Interactive session list (`devx` with no arguments).

use std::io::{self, Stdout};
use std::time::{Duration, Instant};

use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::backend::{Backend, CrosstermBackend};
use ratatui::layout::{Constraint, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, BorderType, Borders, Cell, Paragraph, Row, Table, TableState};
use ratatui::{Frame, Terminal};

use crate::context::Context;
use crate::error::Result;
use crate::lifecycle::{self, AttachOptions, CreateOptions, SessionStatus};
use crate::naming::validate_session_name;

const REFRESH_EVERY: Duration = Duration::from_secs(2);
const POLL_EVERY: Duration = Duration::from_millis(100);
const MESSAGE_FOR: Duration = Duration::from_secs(3);
const FLAG_REASON: &str = "flagged from devx";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Browse,
    NewSession(String),
    ConfirmDelete(String),
}

/// Verbs that need the real terminal and therefore leave the TUI first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handoff {
    Quit,
    Attach(String),
    Create(String),
}

struct App {
    sessions: Vec<SessionStatus>,
    table: TableState,
    mode: Mode,
    message: Option<(String, Instant)>,
    last_refresh: Instant,
}

impl App {
    fn new(ctx: &Context) -> Self {
        let mut app = Self {
            sessions: Vec::new(),
            table: TableState::default(),
            mode: Mode::Browse,
            message: None,
            last_refresh: Instant::now(),
        };
        app.reload(ctx);
        app
    }

    fn reload(&mut self, ctx: &Context) {
        match lifecycle::list(ctx) {
            Ok(sessions) => self.sessions = sessions,
            Err(err) => self.set_message(format!("error: {err}")),
        }
        self.last_refresh = Instant::now();
        if self.sessions.is_empty() {
            self.table.select(None);
        } else {
            let selected = self.table.selected().unwrap_or(0);
            self.table
                .select(Some(selected.min(self.sessions.len() - 1)));
        }
    }

    fn tick(&mut self, ctx: &Context) {
        if self.last_refresh.elapsed() >= REFRESH_EVERY && self.mode == Mode::Browse {
            self.reload(ctx);
        }
        if self
            .message
            .as_ref()
            .is_some_and(|(_, at)| at.elapsed() >= MESSAGE_FOR)
        {
            self.message = None;
        }
    }

    fn set_message(&mut self, message: String) {
        self.message = Some((message, Instant::now()));
    }

    fn selected(&self) -> Option<&SessionStatus> {
        self.table.selected().and_then(|i| self.sessions.get(i))
    }

    fn select_next(&mut self) {
        if let Some(i) = self.table.selected() {
            if i + 1 < self.sessions.len() {
                self.table.select(Some(i + 1));
            }
        }
    }

    fn select_previous(&mut self) {
        if let Some(i) = self.table.selected() {
            self.table.select(Some(i.saturating_sub(1)));
        }
    }

    fn toggle_flag(&mut self, ctx: &Context) {
        let Some(status) = self.selected() else {
            return;
        };
        let name = status.record.name.clone();
        let result = if status.record.attention_flag {
            lifecycle::clear_flag(ctx, &name).map(|_| format!("cleared flag on {name}"))
        } else {
            lifecycle::flag(ctx, &name, FLAG_REASON, true).map(|_| format!("flagged {name}"))
        };
        match result {
            Ok(message) => self.set_message(message),
            Err(err) => self.set_message(format!("error: {err}")),
        }
        self.reload(ctx);
    }

    fn delete(&mut self, ctx: &Context, name: &str) {
        match lifecycle::remove(ctx, name) {
            Ok(report) => match report.warnings.first() {
                Some(warning) => self.set_message(format!("removed {name} (warning: {warning})")),
                None => self.set_message(format!("removed {name}")),
            },
            Err(err) => self.set_message(format!("error: {err}")),
        }
        self.reload(ctx);
    }

    fn handle_key(&mut self, ctx: &Context, code: KeyCode) -> Option<Handoff> {
        match std::mem::replace(&mut self.mode, Mode::Browse) {
            Mode::NewSession(mut input) => {
                match code {
                    KeyCode::Esc => {}
                    KeyCode::Enter => {
                        let name = input.trim().to_string();
                        match validate_session_name(&name) {
                            Ok(()) => return Some(Handoff::Create(name)),
                            Err(err) => {
                                self.set_message(err.to_string());
                                self.mode = Mode::NewSession(input);
                            }
                        }
                    }
                    KeyCode::Backspace => {
                        input.pop();
                        self.mode = Mode::NewSession(input);
                    }
                    KeyCode::Char(c) => {
                        input.push(c);
                        self.mode = Mode::NewSession(input);
                    }
                    _ => self.mode = Mode::NewSession(input),
                }
                None
            }
            Mode::ConfirmDelete(name) => {
                if matches!(code, KeyCode::Char('y') | KeyCode::Char('Y')) {
                    self.delete(ctx, &name);
                } else {
                    self.set_message("delete cancelled".to_string());
                }
                None
            }
            Mode::Browse => match code {
                KeyCode::Char('q') | KeyCode::Esc => Some(Handoff::Quit),
                KeyCode::Down | KeyCode::Char('j') => {
                    self.select_next();
                    None
                }
                KeyCode::Up | KeyCode::Char('k') => {
                    self.select_previous();
                    None
                }
                KeyCode::Enter => self
                    .selected()
                    .map(|s| Handoff::Attach(s.record.name.clone())),
                KeyCode::Char('n') => {
                    self.mode = Mode::NewSession(String::new());
                    None
                }
                KeyCode::Char('f') => {
                    self.toggle_flag(ctx);
                    None
                }
                KeyCode::Char('d') => {
                    if let Some(name) = self.selected().map(|s| s.record.name.clone()) {
                        self.mode = Mode::ConfirmDelete(name);
                    }
                    None
                }
                KeyCode::Char('r') => {
                    self.reload(ctx);
                    self.set_message("refreshed".to_string());
                    None
                }
                _ => None,
            },
        }
    }
}

fn session_row(status: &SessionStatus) -> Row<'static> {
    let record = &status.record;
    let ports = record
        .ports
        .iter()
        .map(|(service, port)| format!("{service}:{port}"))
        .collect::<Vec<_>>()
        .join(" ");
    let hosts = record.routes.values().cloned().collect::<Vec<_>>().join(" ");
    let flags_style = if record.attention_flag {
        Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(Color::Green)
    };
    Row::new(vec![
        Cell::from(Span::styled(status.flags(), flags_style)),
        Cell::from(record.name.clone()),
        Cell::from(record.branch.clone()),
        Cell::from(ports),
        Cell::from(hosts),
    ])
}

fn footer(app: &App) -> Line<'static> {
    let dim = Style::default().fg(Color::DarkGray);
    match &app.mode {
        Mode::NewSession(input) => Line::from(vec![
            Span::styled("new session name: ", Style::default().fg(Color::Cyan)),
            Span::raw(format!("{input}_")),
            Span::styled("  (enter create, esc cancel)", dim),
        ]),
        Mode::ConfirmDelete(name) => Line::from(Span::styled(
            format!("remove session '{name}' and its worktree? (y/N)"),
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )),
        Mode::Browse => match &app.message {
            Some((message, _)) => Line::from(Span::raw(message.clone())),
            None => Line::from(Span::styled(
                "j/k move  enter attach  n new  f flag  d delete  r refresh  q quit",
                dim,
            )),
        },
    }
}

fn ui(f: &mut Frame, app: &mut App) {
    let [body, foot] = Layout::vertical([Constraint::Min(3), Constraint::Length(1)]).areas(f.area());

    let block = Block::default()
        .title(Line::from(vec![
            Span::styled(" devx ", Style::default().add_modifier(Modifier::BOLD)),
            Span::styled(
                format!("({} sessions) ", app.sessions.len()),
                Style::default().fg(Color::DarkGray),
            ),
        ]))
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(Style::default().fg(Color::DarkGray));

    if app.sessions.is_empty() {
        let empty = Paragraph::new("No sessions yet. Press n to create one.")
            .style(Style::default().fg(Color::DarkGray))
            .block(block);
        f.render_widget(empty, body);
    } else {
        let header = Row::new(vec!["", "SESSION", "BRANCH", "PORTS", "HOSTNAMES"])
            .style(Style::default().add_modifier(Modifier::BOLD));
        let rows: Vec<Row> = app.sessions.iter().map(session_row).collect();
        let table = Table::new(
            rows,
            [
                Constraint::Length(4),
                Constraint::Percentage(22),
                Constraint::Percentage(18),
                Constraint::Percentage(25),
                Constraint::Fill(1),
            ],
        )
        .header(header)
        .block(block)
        .row_highlight_style(Style::default().bg(Color::DarkGray))
        .highlight_symbol("> ");
        f.render_stateful_widget(table, body, &mut app.table);
    }
    f.render_widget(Paragraph::new(footer(app)), foot);
}

fn run_app<B: Backend>(terminal: &mut Terminal<B>, app: &mut App, ctx: &Context) -> io::Result<Handoff> {
    loop {
        app.tick(ctx);
        terminal.draw(|f| ui(f, app))?;
        if event::poll(POLL_EVERY)? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                if let Some(handoff) = app.handle_key(ctx, key.code) {
                    return Ok(handoff);
                }
            }
        }
    }
}

struct TuiGuard {
    stdout: Stdout,
}

impl TuiGuard {
    fn enter() -> io::Result<Self> {
        let mut stdout = io::stdout();
        terminal::enable_raw_mode()?;
        execute!(stdout, EnterAlternateScreen)?;
        Ok(Self { stdout })
    }

    fn backend(&mut self) -> CrosstermBackend<&mut Stdout> {
        CrosstermBackend::new(&mut self.stdout)
    }
}

impl Drop for TuiGuard {
    fn drop(&mut self) {
        let _ = execute!(self.stdout, LeaveAlternateScreen);
        let _ = terminal::disable_raw_mode();
    }
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
}

/// Runs until the user quits. Attach and create hand the terminal back,
/// run the verb, then re-enter the list.
pub fn run(ctx: &Context) -> Result<()> {
    let mut app = App::new(ctx);
    loop {
        let handoff = {
            let mut guard = TuiGuard::enter()?;
            let mut terminal = Terminal::new(guard.backend())?;
            terminal.clear()?;
            let handoff = run_app(&mut terminal, &mut app, ctx)?;
            terminal.show_cursor()?;
            handoff
        };
        let outcome = match handoff {
            Handoff::Quit => return Ok(()),
            Handoff::Attach(name) => lifecycle::attach(ctx, &name, AttachOptions::default())
                .map(|report| print_warnings(&report.warnings)),
            Handoff::Create(name) => lifecycle::create(ctx, &name, &CreateOptions::default())
                .map(|report| print_warnings(&report.warnings)),
        };
        if let Err(err) = outcome {
            app.set_message(format!("error: {err}"));
        }
        app.reload(ctx);
    }
}
