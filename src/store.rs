//! Ordered conversation state shared between the send coordinator and the UI

use crate::message::Message;
use tokio::sync::watch;

/// Append-only message sequence; only the trailing record's content may change.
///
/// Every mutation is published through a watch channel so renderers can
/// redraw from a fresh snapshot.
#[derive(Debug)]
pub struct ConversationStore {
    messages: watch::Sender<Vec<Message>>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        let (messages, _) = watch::channel(Vec::new());
        Self { messages }
    }

    /// Add a message to the end of the conversation
    pub fn append(&self, message: Message) {
        tracing::trace!(role = %message.role, len = message.content.len(), "append message");
        self.messages.send_modify(|messages| messages.push(message));
    }

    /// Replace the content of the last message, keeping its role.
    ///
    /// Returns `false` and leaves the store untouched when it is empty.
    pub fn update_last(&self, content: impl Into<String>) -> bool {
        let content = content.into();
        let updated = self.messages.send_if_modified(|messages| match messages.last_mut() {
            Some(last) => {
                last.content = content;
                true
            }
            None => false,
        });
        if !updated {
            tracing::debug!("update_last called on an empty conversation");
        }
        updated
    }

    /// Snapshot of the full ordered sequence
    pub fn messages(&self) -> Vec<Message> {
        self.messages.borrow().clone()
    }

    pub fn last(&self) -> Option<Message> {
        self.messages.borrow().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.messages.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.borrow().is_empty()
    }

    /// Receiver that is notified after every mutation
    pub fn subscribe(&self) -> watch::Receiver<Vec<Message>> {
        self.messages.subscribe()
    }
}
