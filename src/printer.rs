//! Line-oriented output of one conversation turn for `gemchat ask`

use crate::message::{Message, Role};
use std::io::{self, Write};

/// Writes an assistant reply to `out` as it grows in the store.
///
/// Each call receives the turn's records (user message first) and writes only
/// the text added since the previous call. Content that no longer extends what
/// was already written is left alone.
pub struct ReplyPrinter<W> {
    out: W,
    printed: String,
}

impl<W: Write> ReplyPrinter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            printed: String::new(),
        }
    }

    /// Write whatever the in-flight reply gained since the last call
    pub fn update(&mut self, turn: &[Message]) -> io::Result<()> {
        let Some(reply) = turn.get(1).filter(|m| m.role == Role::Assistant) else {
            return Ok(());
        };
        if let Some(delta) = reply.content.strip_prefix(self.printed.as_str()) {
            if !delta.is_empty() {
                self.out.write_all(delta.as_bytes())?;
                self.out.flush()?;
                self.printed.push_str(delta);
            }
        }
        Ok(())
    }

    pub fn printed(&self) -> &str {
        &self.printed
    }

    /// End the reply line if anything was written
    pub fn finish(mut self) -> io::Result<W> {
        if !self.printed.is_empty() {
            self.out.write_all(b"\n")?;
            self.out.flush()?;
        }
        Ok(self.out)
    }
}

/// The notice a turn settled with, if it did not complete
pub fn turn_notice(turn: &[Message]) -> Option<&Message> {
    turn.iter()
        .skip(1)
        .rev()
        .find(|m| m.role == Role::System && !m.content.is_empty())
}
