//! TUI layer using ratatui and crossterm
//!
//! Shows surfaces in a stack of views with chunk and file navigation.
//! Running invocations are pumped from the event loop, so a rerun streams
//! into its surface while the viewer stays responsive.

use crate::diff::{present, DiffEngine, DisplayPolicy, Request};
use crate::navigate::BoundaryGrammar;
use crate::surface::{Completion, Surface, SurfaceMode, SurfaceRegistry};
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph, Wrap},
    Frame, Terminal,
};
use std::collections::HashMap;
use std::io::{self, Stdout};
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Rows taken by the header and status blocks
const CHROME_HEIGHT: u16 = 8;

/// One window onto a surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    pub surface: String,
    pub cursor: usize,
    pub scroll: usize,
}

impl View {
    fn new(surface: &str) -> Self {
        Self {
            surface: surface.to_string(),
            cursor: 0,
            scroll: 0,
        }
    }

    /// Move the cursor, scrolling so it stays visible. `to_top` puts the
    /// cursor line at the top of the window.
    fn move_to(&mut self, line: usize, height: usize, to_top: bool) {
        self.cursor = line;
        let height = height.max(1);
        if to_top || line < self.scroll {
            self.scroll = line;
        } else if line >= self.scroll + height {
            self.scroll = line + 1 - height;
        }
    }
}

/// Views in the order they were opened; the last one is shown
#[derive(Debug, Default)]
pub struct ViewStack {
    views: Vec<View>,
}

impl ViewStack {
    pub fn current(&self) -> Option<&View> {
        self.views.last()
    }

    fn current_mut(&mut self) -> Option<&mut View> {
        self.views.last_mut()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn push(&mut self, surface: &str) {
        self.views.push(View::new(surface));
    }

    /// Close the current view, keeping its surface
    pub fn leave(&mut self) -> Option<View> {
        self.views.pop()
    }

    /// Close the current view and return the surface it showed. With `all`,
    /// every other view of that surface closes too.
    pub fn quit(&mut self, all: bool) -> Option<String> {
        let view = self.views.pop()?;
        if all {
            self.views.retain(|other| other.surface != view.surface);
        }
        Some(view.surface)
    }

    pub fn shows(&self, surface: &str) -> bool {
        self.views.iter().any(|view| view.surface == surface)
    }

    /// Clamp every view of `surface` to its new content. Never opens a view.
    pub fn refresh(&mut self, surface: &Surface) {
        let last = surface.line_count().saturating_sub(1);
        for view in self.views.iter_mut().filter(|view| view.surface == surface.name()) {
            view.cursor = view.cursor.min(last);
            view.scroll = view.scroll.min(view.cursor);
        }
    }

    /// Close every view of `surface`
    pub fn close_all(&mut self, surface: &str) {
        self.views.retain(|view| view.surface != surface);
    }
}

impl DisplayPolicy for ViewStack {
    fn display(&mut self, surface: &Surface, _requested_width: usize) -> Result<()> {
        if self.current().is_some_and(|view| view.surface == surface.name()) {
            self.refresh(surface);
        } else {
            self.push(surface.name());
        }
        Ok(())
    }
}

/// Application state
pub struct App {
    engine: DiffEngine,
    registry: SurfaceRegistry,
    views: ViewStack,
    requests: HashMap<String, Request>,

    /// Width handed to difftastic
    width: u16,
    /// Width came from config or the command line; resizes don't change it
    fixed_width: bool,
    visible_height: usize,

    message: Option<String>,
    show_help: bool,
}

impl App {
    pub fn new(engine: DiffEngine, width: u16, fixed_width: bool) -> Self {
        Self {
            engine,
            registry: SurfaceRegistry::default(),
            views: ViewStack::default(),
            requests: HashMap::new(),
            width,
            fixed_width,
            visible_height: 1,
            message: None,
            show_help: false,
        }
    }

    /// Run `request` to completion and open a view onto its surface when it
    /// produced output.
    pub fn open(&mut self, request: Request) -> Result<Completion> {
        let name = self.engine.start(&mut self.registry, &request, self.width)?;
        self.requests.insert(name.clone(), request);
        let surface = self
            .registry
            .get_mut(&name)
            .context("Surface disappeared while starting")?;
        let completion = surface
            .wait()
            .context("No invocation attached to surface")?;
        present(surface, &completion, &mut self.views)?;
        Ok(completion)
    }

    fn current_surface(&self) -> Option<&Surface> {
        self.registry.get(&self.views.current()?.surface)
    }

    /// Drain output from every running invocation. A finished rerun only
    /// updates views that are still open; an empty one closes them.
    fn pump(&mut self) {
        let mut emptied = Vec::new();
        for surface in self.registry.iter_mut() {
            let Some(completion) = surface.pump() else {
                continue;
            };
            if completion.had_output() {
                self.views.refresh(surface);
            } else {
                self.message = Some(format!("No differences: {}", surface.name()));
                emptied.push(surface.name().to_string());
            }
        }
        for name in emptied {
            self.views.close_all(&name);
        }
    }

    fn rerun(&mut self) {
        let Some(view) = self.views.current() else {
            return;
        };
        let Some(request) = self.requests.get(&view.surface).cloned() else {
            return;
        };
        match self.engine.start(&mut self.registry, &request, self.width) {
            Ok(name) => {
                tracing::info!(target: "tui", surface = %name, width = self.width, "rerun");
                self.requests.insert(name, request);
                self.message = Some(format!("Rerunning at width {}", self.width));
            }
            Err(e) => self.message = Some(format!("Error: {:#}", e)),
        }
    }

    fn refresh_languages(&mut self) {
        match self.engine.catalog().refresh() {
            Ok(catalog) => {
                self.registry.invalidate_grammars();
                self.message = Some(format!("Loaded {} languages", catalog.names().len()));
            }
            Err(e) => self.message = Some(format!("Error: {:#}", e)),
        }
    }

    /// Jump to the next or previous chunk (or file) boundary
    fn jump(&mut self, forward: bool, file_only: bool) {
        let Some(view) = self.views.current() else {
            return;
        };
        let cursor = view.cursor;
        let Some(surface) = self.registry.get_mut(&view.surface) else {
            return;
        };

        let engine = &mut self.engine;
        let grammar = match surface.grammar_or_init(|| {
            let catalog = engine.catalog().get()?;
            Ok(Arc::new(BoundaryGrammar::new(&catalog)?))
        }) {
            Ok(grammar) => grammar,
            Err(e) => {
                tracing::warn!(target: "navigate", error = %format!("{:#}", e), "grammar_unavailable");
                self.message = Some(format!("Error: {:#}", e));
                return;
            }
        };

        let from = surface.line_start(cursor);
        let target = if forward {
            grammar.next_boundary(surface.text(), from, file_only)
        } else {
            grammar.previous_boundary(surface.text(), from, file_only)
        };

        let boundary = target.and_then(|offset| {
            grammar.classify(surface.line(surface.line_of(offset)), offset)
        });
        match boundary {
            Some(boundary) => {
                let line = surface.line_of(boundary.offset);
                let height = self.visible_height;
                if let Some(view) = self.views.current_mut() {
                    view.move_to(line, height, true);
                }
                self.message = Some(match boundary.ordinal {
                    Some((k, n)) => format!("{} {}/{} ({})", boundary.file, k, n, boundary.clause),
                    None => format!("{} ({})", boundary.file, boundary.clause),
                });
            }
            None => {
                let what = if file_only { "files" } else { "chunks" };
                self.message = Some(format!("No more {}", what));
            }
        }
    }

    fn move_cursor(&mut self, line: impl FnOnce(usize, usize) -> usize) {
        let Some(lines) = self.current_surface().map(Surface::line_count) else {
            return;
        };
        let height = self.visible_height;
        if let Some(view) = self.views.current_mut() {
            let last = lines.saturating_sub(1);
            let target = line(view.cursor, last).min(last);
            view.move_to(target, height, false);
        }
    }

    /// Close the current view; `remove` also drops its surface.
    fn close(&mut self, remove: bool, all: bool) {
        let name = if remove {
            self.views.quit(all)
        } else {
            self.views.leave().map(|view| view.surface)
        };
        if let Some(name) = name {
            if remove && !self.views.shows(&name) {
                self.registry.remove(&name);
                self.requests.remove(&name);
                tracing::debug!(target: "tui", surface = %name, "surface_removed");
            }
        }
    }

    fn resize(&mut self, columns: u16) {
        if self.fixed_width || columns == self.width {
            return;
        }
        self.width = columns;
        self.message = Some(format!("Width is now {}; press r to rerun", columns));
    }

    /// Returns true when the application should exit
    pub fn handle_input(&mut self, key: KeyEvent) -> Result<bool> {
        // Clear message on any input
        self.message = None;

        match key.code {
            KeyCode::Char('?') => self.show_help = !self.show_help,
            KeyCode::Esc if self.show_help => self.show_help = false,

            KeyCode::Char('n') => self.jump(true, false),
            KeyCode::Char('p') => self.jump(false, false),
            KeyCode::Char('N') => self.jump(true, true),
            KeyCode::Char('P') => self.jump(false, true),
            KeyCode::Char('j') | KeyCode::Down => self.move_cursor(|cur, _| cur + 1),
            KeyCode::Char('k') | KeyCode::Up => self.move_cursor(|cur, _| cur.saturating_sub(1)),
            KeyCode::PageDown => {
                let page = self.visible_height;
                self.move_cursor(|cur, _| cur + page)
            }
            KeyCode::PageUp => {
                let page = self.visible_height;
                self.move_cursor(|cur, _| cur.saturating_sub(page))
            }
            KeyCode::Char('g') => self.move_cursor(|_, _| 0),
            KeyCode::Char('G') => self.move_cursor(|_, last| last),

            KeyCode::Char('r') => self.rerun(),
            KeyCode::Char('L') => self.refresh_languages(),

            KeyCode::Char('q') => self.close(false, false),
            KeyCode::Char('Q') => self.close(true, false),
            KeyCode::Char('X') => self.close(true, true),

            _ => {}
        }

        Ok(self.views.is_empty())
    }
}

/// Runs the TUI application
pub fn run(mut app: App) -> Result<()> {
    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run_app(&mut terminal, &mut app);

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;

    result
}

fn run_app(terminal: &mut Terminal<CrosstermBackend<Stdout>>, app: &mut App) -> Result<()> {
    loop {
        app.pump();
        if app.views.is_empty() {
            return Ok(());
        }
        app.visible_height = terminal.size()?.height.saturating_sub(CHROME_HEIGHT) as usize;
        terminal.draw(|f| ui(f, app))?;

        if !event::poll(POLL_INTERVAL)? {
            continue;
        }
        match event::read()? {
            Event::Key(key) if key.kind == KeyEventKind::Press => {
                if app.handle_input(key)? {
                    return Ok(());
                }
            }
            Event::Resize(columns, _) => app.resize(columns),
            _ => {}
        }
    }
}

fn ui(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Min(0),    // Surface
            Constraint::Length(3), // Status
        ])
        .split(f.area());

    render_header(f, app, chunks[0]);
    render_surface(f, app, chunks[1]);
    render_status(f, app, chunks[2]);

    if app.show_help {
        render_help(f);
    }
}

fn render_header(f: &mut Frame, app: &App, area: Rect) {
    let info = match (app.views.current(), app.current_surface()) {
        (Some(view), Some(surface)) => {
            let state = if surface.is_running() {
                "running"
            } else if surface.is_read_only() {
                "read-only"
            } else {
                match surface.mode() {
                    SurfaceMode::Streaming => "empty",
                    SurfaceMode::Viewing => "done",
                }
            };
            format!(
                " {} [{}] line {}/{} | views: {}",
                surface.name(),
                state,
                view.cursor + 1,
                surface.line_count().max(1),
                app.views.len()
            )
        }
        _ => " No surface".to_string(),
    };

    let header = Paragraph::new(info)
        .style(Style::default().fg(Color::Cyan))
        .block(Block::default().borders(Borders::ALL).title(" difftview "));

    f.render_widget(header, area);
}

fn render_surface(f: &mut Frame, app: &App, area: Rect) {
    let (Some(view), Some(surface)) = (app.views.current(), app.current_surface()) else {
        f.render_widget(Block::default().borders(Borders::ALL), area);
        return;
    };
    let visible_height = area.height.saturating_sub(2) as usize; // Account for borders

    let lines: Vec<Line> = (view.scroll..surface.line_count())
        .take(visible_height)
        .map(|idx| {
            let spans: Vec<Span> = surface
                .line_spans(idx)
                .into_iter()
                .map(|(text, style)| {
                    let style = style.to_style();
                    // Highlight current line
                    let style = if idx == view.cursor {
                        style.add_modifier(Modifier::REVERSED)
                    } else {
                        style
                    };
                    Span::styled(text.to_string(), style)
                })
                .collect();
            Line::from(spans)
        })
        .collect();

    let body = Paragraph::new(lines).block(Block::default().borders(Borders::ALL));
    f.render_widget(body, area);
}

fn render_status(f: &mut Frame, app: &App, area: Rect) {
    let content = app.message.clone().unwrap_or_else(|| {
        " n/p: chunk | N/P: file | j/k: line | r: rerun | q: leave | Q: quit | ?: help".to_string()
    });

    let status = Paragraph::new(content)
        .style(Style::default().fg(Color::Yellow))
        .block(Block::default().borders(Borders::ALL));

    f.render_widget(status, area);
}

fn render_help(f: &mut Frame) {
    let area = centered_rect(60, 70, f.area());

    let help_text = vec![
        "",
        "  Navigation:",
        "    n / p     Next / previous chunk",
        "    N / P     Next / previous file",
        "    j / ↓     Move down",
        "    k / ↑     Move up",
        "    g / G     Top / bottom",
        "",
        "  Surface:",
        "    r         Rerun at the current width",
        "    L         Refresh the language list",
        "",
        "  Views:",
        "    q         Leave this view",
        "    Q         Quit this view and drop its output",
        "    X         Quit every view of this output",
        "    ?         Toggle this help",
        "",
    ];

    let help = Paragraph::new(help_text.join("\n"))
        .style(Style::default())
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(" Help ")
                .style(Style::default().bg(Color::DarkGray)),
        )
        .wrap(Wrap { trim: false });

    f.render_widget(Clear, area);
    f.render_widget(help, area);
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}
