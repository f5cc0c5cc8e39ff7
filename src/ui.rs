use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use log::{debug, info};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Paragraph},
    Frame,
};
use std::{io, time::Duration, time::Instant};
use textwrap::wrap;
use tui_input::{backend::crossterm::EventHandler, Input};

use parley::conversation::{ConnectionState, ScrollCommand, ViewportMetrics};
use parley::models::{Message, MessageStatus, Sender};
use parley::Conversation;

// Export types needed by main module
pub use ratatui::backend::CrosstermBackend;
pub use ratatui::Terminal;

/// What the main loop should do after a round of input handling.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum UiAction {
    None,
    Quit,
    DropConnection, // Simulate the socket going away
}

pub struct ChatUI {
    input: Input,
    scroll_top: u16,
    viewport_height: u16,
    content_height: u16,
    notice: Option<(String, Instant)>,
}

impl ChatUI {
    pub fn new() -> Self {
        ChatUI {
            input: Input::default(),
            scroll_top: 0,
            viewport_height: 0,
            content_height: 0,
            notice: None,
        }
    }

    fn metrics(&self) -> ViewportMetrics {
        ViewportMetrics::new(
            self.scroll_top as f64,
            self.viewport_height as f64,
            self.content_height as f64,
        )
    }

    fn max_scroll_top(&self) -> u16 {
        self.content_height.saturating_sub(self.viewport_height)
    }

    fn show_notice(&mut self, text: impl Into<String>) {
        self.notice = Some((text.into(), Instant::now()));
    }

    /// Move the view by `delta` rows and report it as a user scroll.
    fn scroll_by(&mut self, conversation: &mut Conversation, delta: i32) {
        let target = (self.scroll_top as i32 + delta).clamp(0, self.max_scroll_top() as i32);
        self.scroll_top = target as u16;
        conversation.on_scroll(self.metrics(), Instant::now());
    }

    pub fn handle_input(&mut self, conversation: &mut Conversation) -> Result<UiAction> {
        if !event::poll(Duration::from_millis(50))? {
            return Ok(UiAction::None);
        }
        let key = match event::read()? {
            Event::Key(key) if key.kind == KeyEventKind::Press => key,
            _ => return Ok(UiAction::None),
        };
        let page = self.viewport_height.max(1) as i32;

        if key.modifiers.contains(KeyModifiers::CONTROL) {
            match key.code {
                KeyCode::Char('r') => match conversation.reconnect() {
                    Ok(()) => self.show_notice("Reconnecting..."),
                    Err(e) => self.show_notice(e.to_string()),
                },
                KeyCode::Char('t') => {
                    let retry = conversation
                        .messages()
                        .iter()
                        .rev()
                        .find(|m| m.status == MessageStatus::Failed)
                        .and_then(|m| m.retry.clone());
                    match retry {
                        Some(handle) => {
                            debug!("Retry requested for {}", handle.message_id());
                            handle.retry();
                        }
                        None => self.show_notice("Nothing to retry"),
                    }
                }
                KeyCode::Char('x') => return Ok(UiAction::DropConnection),
                KeyCode::Char('c') => return Ok(UiAction::Quit),
                _ => {}
            }
            return Ok(UiAction::None);
        }

        match key.code {
            KeyCode::Esc => return Ok(UiAction::Quit),
            KeyCode::Enter => {
                if !conversation.can_send() {
                    self.show_notice("Not connected, message not sent");
                } else if conversation.send(self.input.value()).is_some() {
                    self.input.reset();
                }
            }
            KeyCode::PageUp => self.scroll_by(conversation, -page),
            KeyCode::PageDown => self.scroll_by(conversation, page),
            KeyCode::Up => self.scroll_by(conversation, -1),
            KeyCode::Down => self.scroll_by(conversation, 1),
            KeyCode::End => conversation.scroll_to_bottom(),
            _ => {
                self.input.handle_event(&Event::Key(key));
            }
        }
        Ok(UiAction::None)
    }

    pub fn draw<B: Backend>(&mut self, frame: &mut Frame<B>, conversation: &mut Conversation) {
        let size = frame.size();

        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1), // Header
                Constraint::Min(3),    // Messages
                Constraint::Length(3), // Input box
                Constraint::Length(1), // Help line
            ])
            .split(size);

        self.draw_header(frame, conversation, chunks[0]);
        self.draw_messages(frame, conversation, chunks[1]);

        let connected = conversation.can_send();
        let input_block = Block::default()
            .title(if connected { "Message" } else { "Message (offline)" })
            .borders(Borders::ALL)
            .border_style(if connected {
                Style::default().fg(Color::Yellow)
            } else {
                Style::default().fg(Color::DarkGray)
            });
        let input_widget = Paragraph::new(self.input.value()).block(input_block);
        frame.render_widget(input_widget, chunks[2]);

        let help = Paragraph::new(Line::from(vec![Span::styled(
            "ESC quit | Enter send | PgUp/PgDn scroll | End bottom | Ctrl+R reconnect | Ctrl+T retry | Ctrl+X drop",
            Style::default().fg(Color::Gray),
        )]));
        frame.render_widget(help, chunks[3]);

        frame.set_cursor(chunks[2].x + self.input.cursor() as u16 + 1, chunks[2].y + 1);
    }

    fn draw_header<B: Backend>(&mut self, frame: &mut Frame<B>, conversation: &Conversation, area: Rect) {
        let (state_text, state_style) = match conversation.connection_state() {
            ConnectionState::Connected => ("connected", Style::default().fg(Color::Green)),
            ConnectionState::Connecting => ("connecting", Style::default().fg(Color::Yellow)),
            ConnectionState::Reconnecting => ("reconnecting", Style::default().fg(Color::Yellow)),
            ConnectionState::Disconnected => ("disconnected (Ctrl+R)", Style::default().fg(Color::Red)),
        };

        let mut spans = vec![
            Span::raw(format!("{} ", conversation.context().remote_user_id)),
            Span::styled(format!("[{}]", state_text), state_style),
        ];
        if conversation.is_loading_older() {
            spans.push(Span::styled(" loading history...", Style::default().fg(Color::Gray)));
        }
        if conversation.jump_to_bottom_visible() {
            spans.push(Span::styled(
                format!(" {} new, End to jump", conversation.unread_count()),
                Style::default().fg(Color::Cyan),
            ));
        }
        if matches!(&self.notice, Some((_, shown)) if shown.elapsed() >= Duration::from_secs(4)) {
            self.notice = None;
        }
        if let Some((notice, _)) = &self.notice {
            spans.push(Span::styled(format!(" | {}", notice), Style::default().fg(Color::Magenta)));
        }

        frame.render_widget(Paragraph::new(Line::from(spans)), area);
    }

    fn draw_messages<B: Backend>(&mut self, frame: &mut Frame<B>, conversation: &mut Conversation, area: Rect) {
        let wrap_width = area.width.saturating_sub(2).max(1) as usize; // Account for borders
        let local_name = conversation.context().local_user_id.clone();
        let remote_name = conversation.context().remote_user_id.clone();

        let mut lines: Vec<Line> = Vec::new();
        if !conversation.has_more_history() {
            lines.push(Line::from(Span::styled(
                "-- start of conversation --",
                Style::default().fg(Color::DarkGray),
            )));
        }
        let anchor = conversation.anchor_message().map(str::to_string);
        let mut anchor_row = None;
        for message in conversation.messages() {
            if anchor.as_deref() == Some(message.id.as_str()) {
                anchor_row = Some(lines.len());
            }
            let style = message_style(message);
            let full_content = format!(
                "[{}] {}: {}{}",
                message.timestamp.with_timezone(&chrono::Local).format("%H:%M"),
                match message.sender {
                    Sender::LocalUser => local_name.as_str(),
                    Sender::RemoteUser => remote_name.as_str(),
                },
                message.text,
                status_indicator(message)
            );
            for line in wrap(&full_content, wrap_width) {
                lines.push(Line::from(Span::styled(line.into_owned(), style)));
            }
        }

        self.viewport_height = area.height.saturating_sub(2);
        self.content_height = lines.len().min(u16::MAX as usize) as u16;

        // Older history lands above the message that used to be first.
        let metrics = match anchor_row {
            Some(row) => self.metrics().with_prepended_height(row as f64),
            None => self.metrics(),
        };
        match conversation.on_layout(metrics) {
            ScrollCommand::ScrollTo(offset) => {
                self.scroll_top = (offset.round().max(0.0) as u16).min(self.max_scroll_top());
            }
            ScrollCommand::Keep => self.scroll_top = self.scroll_top.min(self.max_scroll_top()),
        }

        let title = format!("Conversation {}", conversation.context().conversation_id);
        let messages = Paragraph::new(lines)
            .block(Block::default().borders(Borders::ALL).title(title))
            .scroll((self.scroll_top, 0));
        frame.render_widget(messages, area);
    }
}

fn status_indicator(message: &Message) -> &'static str {
    match message.status {
        MessageStatus::Pending => " ...",
        MessageStatus::Sent => " ✓",
        MessageStatus::Failed => " ✗ (Ctrl+T retry)",
        MessageStatus::Received => "",
    }
}

fn message_style(message: &Message) -> Style {
    match message.status {
        MessageStatus::Failed => Style::default().fg(Color::Red),
        MessageStatus::Pending => Style::default().fg(Color::DarkGray),
        MessageStatus::Sent => Style::default().fg(Color::Blue),
        MessageStatus::Received => Style::default(),
    }
}

pub fn setup_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let terminal = Terminal::new(backend)?;
    info!("Terminal initialised");
    Ok(terminal)
}

pub fn restore_terminal(mut terminal: Terminal<CrosstermBackend<io::Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}
