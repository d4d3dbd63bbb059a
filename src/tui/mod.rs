//! TUI module for live traffic inspection
//!
//! Shows every exchange captured by the mock server, newest first, with a
//! detail pane for the selected one.

use crate::exchange::CapturedExchange;
use crate::server::MockServer;
use anyhow::Result;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::Duration;

const HELP: &str = "[q: quit] [up/down: select] [enter: inspect] [c: clear]";

/// TUI Application state
pub struct TuiApp {
    server: MockServer,
    receiver: UnboundedReceiver<Arc<CapturedExchange>>,
    /// Captured exchanges, newest first
    exchanges: Vec<Arc<CapturedExchange>>,
    list_state: ListState,
    /// Exchange shown in the detail pane
    inspected: Option<Arc<CapturedExchange>>,
    should_quit: bool,
    status_message: String,
}

impl TuiApp {
    /// Create the dashboard and subscribe it to the server's exchanges.
    ///
    /// This replaces any observer already registered on `server`.
    pub fn new(server: MockServer) -> Self {
        let (tx, receiver) = mpsc::unbounded_channel();
        server.on_exchange(move |exchange| {
            let _ = tx.send(exchange);
        });

        Self {
            server,
            receiver,
            exchanges: Vec::new(),
            list_state: ListState::default(),
            inspected: None,
            should_quit: false,
            status_message: HELP.to_string(),
        }
    }

    /// Run the TUI application
    pub async fn run(&mut self) -> Result<()> {
        // Setup terminal
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let result = self.run_app(&mut terminal).await;

        // Restore terminal
        disable_raw_mode()?;
        execute!(
            terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        )?;
        terminal.show_cursor()?;

        result
    }

    async fn run_app<B: Backend>(&mut self, terminal: &mut Terminal<B>) -> Result<()> {
        loop {
            self.drain_exchanges();

            terminal.draw(|f| self.ui(f))?;

            // Poll with a timeout so new traffic shows up without a key press
            if event::poll(Duration::from_millis(100))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_key(key.code);
                    }
                }
            }

            if self.should_quit {
                break;
            }
        }

        self.server.close();
        Ok(())
    }

    /// Move newly captured exchanges into the list
    fn drain_exchanges(&mut self) {
        while let Ok(exchange) = self.receiver.try_recv() {
            self.push_exchange(exchange);
        }
    }

    fn push_exchange(&mut self, exchange: Arc<CapturedExchange>) {
        self.exchanges.insert(0, exchange);
        // Keep the same entry selected as the list grows at the top
        let selected = match self.list_state.selected() {
            Some(i) => i + 1,
            None => 0,
        };
        self.list_state.select(Some(selected));
    }

    fn handle_key(&mut self, code: KeyCode) {
        match code {
            KeyCode::Char('q') | KeyCode::Esc => self.should_quit = true,
            KeyCode::Up | KeyCode::Char('k') => self.move_selection(-1),
            KeyCode::Down | KeyCode::Char('j') => self.move_selection(1),
            KeyCode::Enter | KeyCode::Char(' ') => {
                self.inspected = self
                    .list_state
                    .selected()
                    .and_then(|i| self.exchanges.get(i).cloned());
            }
            KeyCode::Char('c') => {
                self.exchanges.clear();
                self.list_state.select(None);
                self.inspected = None;
                self.status_message = "View cleared".to_string();
            }
            _ => {}
        }
    }

    fn move_selection(&mut self, delta: isize) {
        if self.exchanges.is_empty() {
            return;
        }
        let last = self.exchanges.len() - 1;
        let current = self.list_state.selected().unwrap_or(0);
        let next = current.saturating_add_signed(delta).min(last);
        self.list_state.select(Some(next));
    }

    /// Draw the UI
    fn ui(&mut self, f: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([
                Constraint::Length(3), // Header
                Constraint::Min(10),   // Traffic + detail
                Constraint::Length(3), // Status bar
            ])
            .split(f.size());

        self.draw_header(f, chunks[0]);

        let body = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(chunks[1]);
        self.draw_traffic(f, body[0]);
        self.draw_detail(f, body[1]);

        self.draw_status_bar(f, chunks[2]);
    }

    fn draw_header(&self, f: &mut Frame, area: Rect) {
        let url = self
            .server
            .url()
            .unwrap_or_else(|| "(not listening)".to_string());

        let header = Paragraph::new(Line::from(vec![
            Span::styled(
                " ADUKET ",
                Style::default()
                    .fg(Color::White)
                    .bg(Color::Magenta)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                format!(" Mock Server: {url}"),
                Style::default()
                    .fg(Color::Cyan)
                    .add_modifier(Modifier::BOLD),
            ),
        ]))
        .alignment(Alignment::Center)
        .block(Block::default().borders(Borders::ALL));
        f.render_widget(header, area);
    }

    fn draw_traffic(&mut self, f: &mut Frame, area: Rect) {
        let items: Vec<ListItem> = self
            .exchanges
            .iter()
            .map(|exchange| {
                let status = exchange.status_code;
                ListItem::new(Line::from(vec![
                    Span::styled(
                        format!("{:<7}", exchange.method.as_str()),
                        Style::default()
                            .fg(method_color(exchange.method.as_str()))
                            .add_modifier(Modifier::BOLD),
                    ),
                    Span::raw(format!("{} ", exchange.path())),
                    Span::styled(
                        format!("[{status}]"),
                        Style::default().fg(status_color(exchange.status_code)),
                    ),
                ]))
            })
            .collect();

        let list = List::new(items)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(format!("Traffic ({})", self.exchanges.len())),
            )
            .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
            .highlight_symbol("> ");
        f.render_stateful_widget(list, area, &mut self.list_state);
    }

    fn draw_detail(&self, f: &mut Frame, area: Rect) {
        let (title, text) = match &self.inspected {
            Some(exchange) => (
                format!("{} {}", exchange.method, exchange.path()),
                detail_text(exchange),
            ),
            None => (
                "Details".to_string(),
                "Select a request to see details".to_string(),
            ),
        };

        let detail = Paragraph::new(text)
            .style(Style::default().fg(Color::Gray))
            .wrap(Wrap { trim: false })
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(Span::styled(
                        title,
                        Style::default()
                            .fg(Color::Magenta)
                            .add_modifier(Modifier::BOLD),
                    )),
            );
        f.render_widget(detail, area);
    }

    fn draw_status_bar(&self, f: &mut Frame, area: Rect) {
        let status = Paragraph::new(format!(
            "{} | Recorded: {}",
            self.status_message,
            self.server.request_count()
        ))
        .style(
            Style::default()
                .fg(Color::Blue)
                .add_modifier(Modifier::ITALIC),
        )
        .wrap(Wrap { trim: true })
        .block(Block::default().borders(Borders::ALL).title("Status"));
        f.render_widget(status, area);
    }
}

fn method_color(method: &str) -> Color {
    match method {
        "GET" => Color::Green,
        "POST" => Color::Blue,
        "PUT" => Color::Yellow,
        "DELETE" => Color::Red,
        _ => Color::White,
    }
}

fn status_color(status: u16) -> Color {
    match status {
        200..=299 => Color::Green,
        300..=399 => Color::Yellow,
        400..=599 => Color::Red,
        _ => Color::Gray,
    }
}

/// Text for the detail pane
fn detail_text(exchange: &CapturedExchange) -> String {
    let mut detail = format!(
        "Path: {}\nStatus: {}\n\nHeaders:\n",
        exchange.uri, exchange.status_code
    );
    for (name, value) in &exchange.headers {
        detail.push_str(&format!(
            "  {}: {}\n",
            name,
            value.to_str().unwrap_or("<binary>")
        ));
    }

    detail.push_str("\nRequest Body:\n");
    detail.push_str(&or_empty(exchange.body_text()));
    detail.push_str("\n\nResponse Body:\n");
    detail.push_str(&or_empty(exchange.response_text()));
    detail
}

fn or_empty(text: String) -> String {
    if text.is_empty() {
        "[empty]".to_string()
    } else {
        text
    }
}
