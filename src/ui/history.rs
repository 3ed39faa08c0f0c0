//! Conversation history display component

use crate::message::{Message, Role};
use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Scrollbar, ScrollbarOrientation, ScrollbarState, StatefulWidget, Widget},
};

/// Renders the conversation from a store snapshot, newest at the bottom
#[derive(Clone, Default)]
pub struct ConversationHistory {
    messages: Vec<Message>,
    /// Lines scrolled up from the bottom
    scroll_offset: usize,
    busy: bool,
    show_timestamps: bool,
}

impl ConversationHistory {
    pub fn new(show_timestamps: bool) -> Self {
        Self {
            show_timestamps,
            ..Self::default()
        }
    }

    /// Replace the displayed snapshot
    pub fn set_messages(&mut self, messages: Vec<Message>) {
        let grew = messages.len() > self.messages.len();
        self.messages = messages;
        if grew {
            self.scroll_to_bottom();
        }
    }

    pub fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    pub fn scroll_up(&mut self, lines: usize) {
        self.scroll_offset = self.scroll_offset.saturating_add(lines);
    }

    pub fn scroll_down(&mut self, lines: usize) {
        self.scroll_offset = self.scroll_offset.saturating_sub(lines);
    }

    pub fn scroll_to_bottom(&mut self) {
        self.scroll_offset = 0;
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Every display line for the current snapshot at the given width
    fn lines(&self, width: u16) -> Vec<Line<'static>> {
        let mut all_lines = Vec::new();
        let last_index = self.messages.len().saturating_sub(1);

        for (index, message) in self.messages.iter().enumerate() {
            let in_flight = self.busy && index == last_index && message.role == Role::Assistant;
            all_lines.extend(self.render_message(message, width, in_flight));
            all_lines.push(Line::default());
        }
        all_lines
    }

    fn render_message(&self, message: &Message, width: u16, in_flight: bool) -> Vec<Line<'static>> {
        let mut lines = Vec::new();
        let style = content_style(message.role);

        let mut header = vec![Span::styled(
            message.role.label().to_string(),
            style.add_modifier(Modifier::BOLD),
        )];
        if self.show_timestamps {
            header.push(Span::styled(
                format!("  {}", message.created_at.with_timezone(&chrono::Local).format("%H:%M:%S")),
                Style::default().fg(Color::DarkGray),
            ));
        }
        lines.push(Line::from(header));

        if in_flight && message.content.is_empty() {
            lines.push(Line::from(vec![
                Span::raw("  "),
                Span::styled("thinking…", Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC)),
            ]));
            return lines;
        }

        let content_lines = wrap_text(&message.content, width.saturating_sub(2) as usize);
        let count = content_lines.len();
        for (i, content_line) in content_lines.into_iter().enumerate() {
            let mut spans = vec![Span::raw("  "), Span::styled(content_line, style)];
            if in_flight && i + 1 == count {
                spans.push(Span::styled("▋", Style::default().fg(Color::Yellow)));
            }
            lines.push(Line::from(spans));
        }

        lines
    }
}

fn content_style(role: Role) -> Style {
    match role {
        Role::User => Style::default().fg(Color::Blue),
        Role::Assistant => Style::default().fg(Color::Green),
        Role::System => Style::default().fg(Color::Yellow),
    }
}

/// Wrap text to `width` columns, keeping explicit line breaks
pub fn wrap_text(text: &str, width: usize) -> Vec<String> {
    if width == 0 {
        return vec![text.to_string()];
    }

    let mut lines = Vec::new();
    for paragraph in text.split('\n') {
        let mut current_line = String::new();
        let mut current_width = 0;

        for word in paragraph.split_whitespace() {
            let word_width = word.chars().count();
            if current_width > 0 && current_width + 1 + word_width > width {
                lines.push(std::mem::take(&mut current_line));
                current_width = 0;
            }
            if current_width > 0 {
                current_line.push(' ');
                current_width += 1;
            }

            // Hard-split words longer than a full line.
            let mut chars: Vec<char> = word.chars().collect();
            while current_width + chars.len() > width && current_width == 0 {
                let rest = chars.split_off(width);
                lines.push(chars.into_iter().collect());
                chars = rest;
            }
            current_line.extend(chars.iter());
            current_width += chars.len();
        }

        lines.push(current_line);
    }

    lines
}

impl Widget for ConversationHistory {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let block = Block::default().borders(Borders::ALL).title(" Conversation ");
        let inner_area = block.inner(area);
        block.render(area, buf);

        if self.messages.is_empty() {
            let welcome_lines = [
                Line::from(Span::styled("Welcome! Ask Gemini anything.", Style::default().fg(Color::Green))),
                Line::default(),
                Line::from(Span::styled(
                    "Enter sends, Shift+Enter adds a new line, /help lists commands.",
                    Style::default().fg(Color::DarkGray),
                )),
            ];
            for (i, line) in welcome_lines.iter().enumerate().take(inner_area.height as usize) {
                buf.set_line(inner_area.x, inner_area.y + i as u16, line, inner_area.width);
            }
            return;
        }

        let all_lines = self.lines(inner_area.width);
        let height = inner_area.height as usize;
        let total = all_lines.len();
        let max_offset = total.saturating_sub(height);
        let offset = self.scroll_offset.min(max_offset);
        let start = max_offset - offset;

        for (i, line) in all_lines[start..].iter().take(height).enumerate() {
            buf.set_line(inner_area.x, inner_area.y + i as u16, line, inner_area.width);
        }

        if max_offset > 0 {
            let mut scroll_state = ScrollbarState::new(max_offset).position(start);
            Scrollbar::default()
                .orientation(ScrollbarOrientation::VerticalRight)
                .begin_symbol(Some("↑"))
                .end_symbol(Some("↓"))
                .render(area, buf, &mut scroll_state);
        }
    }
}
