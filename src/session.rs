//! Remote assistant capability and its initialize-once holder

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::Stream;
use once_cell::sync::OnceCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Finite sequence of text deltas for one streamed reply.
///
/// An `Err` item means the stream failed part-way through.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Conversational context held by the remote service
#[async_trait]
pub trait AssistantSession: Send + Sync {
    /// Send a turn and wait for the complete reply text
    async fn send_atomic(&self, text: &str) -> Result<String>;

    /// Send a turn and receive the reply as incremental deltas
    async fn send_streaming(&self, text: &str) -> Result<DeltaStream>;
}

/// Shared slot for the assistant session, filled at most once
#[derive(Clone, Default)]
pub struct SessionSlot {
    inner: Arc<OnceCell<Arc<dyn AssistantSession>>>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// A slot that is already initialized
    pub fn ready(session: Arc<dyn AssistantSession>) -> Self {
        let slot = Self::new();
        slot.install(session);
        slot
    }

    pub fn get(&self) -> Option<Arc<dyn AssistantSession>> {
        self.inner.get().cloned()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.get().is_some()
    }

    /// Install the session; returns `false` if one was already installed.
    pub fn install(&self, session: Arc<dyn AssistantSession>) -> bool {
        self.inner.set(session).is_ok()
    }

    /// Run session initialization in the background.
    ///
    /// The slot stays empty if initialization fails or does not finish within
    /// `timeout`; senders then see the session as not yet available.
    pub fn spawn_init<F, S>(&self, init: F, timeout: Duration) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = Result<S>> + Send + 'static,
        S: AssistantSession + 'static,
    {
        let slot = self.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, init).await {
                Ok(Ok(session)) => {
                    if slot.install(Arc::new(session)) {
                        tracing::info!("assistant session ready");
                    } else {
                        tracing::warn!("assistant session already installed, discarding new one");
                    }
                }
                Ok(Err(e)) => {
                    tracing::error!(error = %format!("{e:#}"), "assistant session failed to initialize");
                }
                Err(_) => {
                    tracing::error!(?timeout, "assistant session initialization timed out");
                }
            }
        })
    }
}
