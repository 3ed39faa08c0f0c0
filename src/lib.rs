//! Terminal chat client for the Gemini API

pub mod config;
pub mod coordinator;
pub mod llm;
pub mod logging;
pub mod message;
pub mod printer;
pub mod session;
pub mod store;
pub mod streaming;
pub mod ui;

pub use config::Config;
pub use coordinator::{FailurePolicy, SendCoordinator, SendError, SendMode, SendOutcome};
pub use llm::{GeminiConfig, GeminiSession};
pub use message::{Message, Role};
pub use session::{AssistantSession, DeltaStream, SessionSlot};
pub use store::ConversationStore;
