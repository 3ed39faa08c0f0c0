//! Terminal chat screen

pub mod app;
pub mod commands;
pub mod composer;
pub mod history;
pub mod tui;

pub use app::ChatApp;
pub use commands::{get_help_text, parse_slash_command, ParsedCommand, SlashCommand};
pub use composer::{ChatComposer, ComposerResult};
pub use history::ConversationHistory;
pub use tui::run;
