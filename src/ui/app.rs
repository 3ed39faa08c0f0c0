use crate::coordinator::{SendCoordinator, SendError};
use crate::message::Message;
use crate::ui::commands::{get_help_text, ParsedCommand, SlashCommand};
use crate::ui::composer::{ChatComposer, ComposerResult};
use crate::ui::history::ConversationHistory;
use crate::ui::tui::AppEvent;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers, MouseEventKind};
use ratatui::{
    buffer::Buffer,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::Widget,
};
use std::sync::Arc;

const PLACEHOLDER: &str = "Type a message, or / for commands";
const MAX_STATUS_LINES: usize = 8;

/// State of the chat screen: conversation view, composer and status lines
pub struct ChatApp {
    coordinator: Arc<SendCoordinator>,
    history: ConversationHistory,
    composer: ChatComposer,
    status: Vec<String>,
    title: String,
    model: String,
    busy: bool,
    should_quit: bool,
}

impl ChatApp {
    pub fn new(coordinator: Arc<SendCoordinator>, title: impl Into<String>, model: impl Into<String>, show_timestamps: bool) -> Self {
        let mode = coordinator.mode();
        let mut history = ConversationHistory::new(show_timestamps);
        history.set_messages(coordinator.store().messages());

        Self {
            coordinator,
            history,
            composer: ChatComposer::new(PLACEHOLDER, mode),
            status: Vec::new(),
            title: title.into(),
            model: model.into(),
            busy: false,
            should_quit: false,
        }
    }

    pub fn coordinator(&self) -> &Arc<SendCoordinator> {
        &self.coordinator
    }

    pub fn should_quit(&self) -> bool {
        self.should_quit
    }

    pub fn status(&self) -> &[String] {
        &self.status
    }

    /// Pick up a new store snapshot
    pub fn sync_messages(&mut self, messages: Vec<Message>) {
        self.history.set_messages(messages);
    }

    pub fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
        self.history.set_busy(busy);
        self.composer.set_busy(busy);
    }

    pub fn handle_event(&mut self, event: AppEvent) {
        match event {
            AppEvent::Key(key) => self.handle_key(key),
            AppEvent::Focus(focused) => self.composer.set_focus(focused),
            AppEvent::Mouse(mouse) => match mouse.kind {
                MouseEventKind::ScrollUp => self.history.scroll_up(3),
                MouseEventKind::ScrollDown => self.history.scroll_down(3),
                _ => {}
            },
            AppEvent::Resize(_, _) | AppEvent::Tick => {}
        }
    }

    /// Handle key input
    pub fn handle_key(&mut self, key: KeyEvent) {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            self.should_quit = true;
            return;
        }

        match key.code {
            KeyCode::Esc if !self.composer.is_palette_open() => {
                self.should_quit = true;
                return;
            }
            KeyCode::PageUp => {
                self.history.scroll_up(5);
                return;
            }
            KeyCode::PageDown => {
                self.history.scroll_down(5);
                return;
            }
            _ => {}
        }

        match self.composer.handle_key(key) {
            ComposerResult::Submitted(text) => self.submit(text),
            ComposerResult::Command(command) => self.handle_slash_command(command),
            ComposerResult::None => {}
        }
    }

    /// Start sending `text` on a background task
    fn submit(&mut self, text: String) {
        self.status.clear();
        if self.coordinator.is_busy() {
            self.status.push("Still waiting for the previous reply.".to_string());
            return;
        }

        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            match coordinator.send(text).await {
                Ok(outcome) => tracing::debug!(?outcome, "send settled"),
                Err(SendError::Busy) => tracing::warn!("send rejected, another reply is in flight"),
            }
        });
    }

    /// Handle slash commands
    fn handle_slash_command(&mut self, command: ParsedCommand) {
        self.status.clear();
        if self.busy && !command.command.available_while_busy() {
            self.status
                .push(format!("/{} is not available while a reply is in flight.", command.command.command()));
            return;
        }

        match command.command {
            SlashCommand::Mode => match command.mode_target() {
                Some(mode) => {
                    self.coordinator.set_mode(mode);
                    self.composer.set_mode(mode);
                    self.status.push(format!("Reply mode set to {mode}."));
                }
                None if command.argument().is_some() => {
                    self.status.push(format!(
                        "Unknown mode '{}'. Use /mode streaming or /mode atomic.",
                        command.argument().unwrap_or_default()
                    ));
                }
                None => {
                    self.status.push(format!(
                        "Reply mode is {}. Use /mode streaming or /mode atomic to change it.",
                        self.coordinator.mode()
                    ));
                }
            },
            SlashCommand::Help => {
                self.status.extend(get_help_text().lines().map(str::to_string));
            }
            SlashCommand::Bye => {
                self.should_quit = true;
            }
        }
    }

    fn header(&self) -> Line<'static> {
        let (indicator, color) = if !self.coordinator.session().is_ready() {
            ("connecting", Color::Yellow)
        } else if self.busy {
            ("replying…", Color::Cyan)
        } else {
            ("ready", Color::Green)
        };

        Line::from(vec![
            Span::styled(self.title.clone(), Style::default().add_modifier(Modifier::BOLD)),
            Span::styled(format!("  {}", self.model), Style::default().fg(Color::DarkGray)),
            Span::raw("  "),
            Span::styled(format!("● {indicator}"), Style::default().fg(color)),
        ])
    }

    /// Render the chat screen
    pub fn render(&self, area: Rect, buf: &mut Buffer) {
        let status_height = self.status.len().min(MAX_STATUS_LINES) as u16;
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1),
                Constraint::Min(5),
                Constraint::Length(status_height),
                Constraint::Length(5),
            ])
            .split(area);

        buf.set_line(chunks[0].x, chunks[0].y, &self.header(), chunks[0].width);
        self.history.clone().render(chunks[1], buf);

        for (i, line) in self.status.iter().take(chunks[2].height as usize).enumerate() {
            let line = Line::from(Span::styled(line.as_str(), Style::default().fg(Color::Magenta)));
            buf.set_line(chunks[2].x, chunks[2].y + i as u16, &line, chunks[2].width);
        }

        self.composer.clone().render(chunks[3], buf);
    }
}
