//! Drives one user turn from submission to a settled reply

use crate::config::Config;
use crate::message::Message;
use crate::session::{AssistantSession, SessionSlot};
use crate::store::ConversationStore;
use anyhow::Result;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use strum::{AsRefStr, EnumIter, EnumString};
use tokio::sync::watch;
use tracing::Instrument;
use uuid::Uuid;

pub const SESSION_INITIALIZING_NOTICE: &str = "Assistant is initializing. Please try again in a moment.";
pub const DEFAULT_FAILURE_NOTICE: &str = "Sorry, I couldn't process your request. Please try again!";

/// How replies are requested from the assistant
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, EnumString, EnumIter, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SendMode {
    /// Show the reply as it is generated
    #[default]
    Streaming,
    /// Wait for the complete reply
    Atomic,
}

impl std::fmt::Display for SendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Where the failure notice goes when a request fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Replace the assistant placeholder's content with the notice
    OverwritePlaceholder,
    /// Keep the placeholder and append a system message with the notice
    AppendNotice,
}

impl FailurePolicy {
    pub fn default_for(mode: SendMode) -> Self {
        match mode {
            SendMode::Streaming => FailurePolicy::OverwritePlaceholder,
            SendMode::Atomic => FailurePolicy::AppendNotice,
        }
    }
}

/// How a send attempt settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The reply arrived in full
    Completed,
    /// No session yet; a system notice was added instead
    SessionUnavailable,
    /// The remote call failed; the failure notice was shown
    Failed,
}

#[derive(Debug, Snafu)]
pub enum SendError {
    #[snafu(display("a message is already being sent"))]
    Busy,
}

struct Settings {
    mode: SendMode,
    failure_policy: Option<FailurePolicy>,
    failure_notice: String,
}

impl Settings {
    fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
            .unwrap_or_else(|| FailurePolicy::default_for(self.mode))
    }
}

/// Settings captured once at the start of a send
struct AttemptSettings {
    mode: SendMode,
    policy: FailurePolicy,
    notice: String,
}

/// Appends the user's turn, calls the assistant and writes the reply into the store.
///
/// Only one send runs at a time; the busy flag is both the lock and the
/// UI-facing indicator.
pub struct SendCoordinator {
    store: Arc<ConversationStore>,
    session: SessionSlot,
    settings: RwLock<Settings>,
    in_flight: AtomicBool,
    busy: watch::Sender<bool>,
}

/// Clears the busy flag when a send settles, however it exits
struct BusyGuard<'a> {
    in_flight: &'a AtomicBool,
    busy: &'a watch::Sender<bool>,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
        self.busy.send_replace(false);
    }
}

impl SendCoordinator {
    pub fn new(store: Arc<ConversationStore>, session: SessionSlot) -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            store,
            session,
            settings: RwLock::new(Settings {
                mode: SendMode::default(),
                failure_policy: None,
                failure_notice: DEFAULT_FAILURE_NOTICE.to_string(),
            }),
            in_flight: AtomicBool::new(false),
            busy,
        }
    }

    pub fn from_config(config: &Config, store: Arc<ConversationStore>, session: SessionSlot) -> Self {
        Self::new(store, session)
            .with_mode(config.send_mode)
            .with_failure_notice(config.failure_notice.clone())
    }

    pub fn with_mode(self, mode: SendMode) -> Self {
        self.set_mode(mode);
        self
    }

    /// Use `policy` regardless of mode instead of the per-mode default
    pub fn with_failure_policy(self, policy: FailurePolicy) -> Self {
        self.settings_mut(|s| s.failure_policy = Some(policy));
        self
    }

    pub fn with_failure_notice(self, notice: impl Into<String>) -> Self {
        let notice = notice.into();
        self.settings_mut(|s| s.failure_notice = notice);
        self
    }

    pub fn mode(&self) -> SendMode {
        self.settings.read().unwrap_or_else(PoisonError::into_inner).mode
    }

    /// Takes effect from the next send
    pub fn set_mode(&self, mode: SendMode) {
        self.settings_mut(|s| s.mode = mode);
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.attempt_settings().policy
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn session(&self) -> &SessionSlot {
        &self.session
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.borrow()
    }

    pub fn subscribe_busy(&self) -> watch::Receiver<bool> {
        self.busy.subscribe()
    }

    fn attempt_settings(&self) -> AttemptSettings {
        let settings = self.settings.read().unwrap_or_else(PoisonError::into_inner);
        AttemptSettings {
            mode: settings.mode,
            policy: settings.failure_policy(),
            notice: settings.failure_notice.clone(),
        }
    }

    fn settings_mut(&self, f: impl FnOnce(&mut Settings)) {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut settings);
    }

    fn acquire(&self) -> Result<BusyGuard<'_>, SendError> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SendError::Busy)?;
        Ok(BusyGuard {
            in_flight: &self.in_flight,
            busy: &self.busy,
        })
    }

    /// Send one user turn.
    ///
    /// Returns `SendError::Busy` without touching the conversation if another
    /// send is still in flight. Remote failures are reported through the store
    /// and `SendOutcome::Failed`, never as an error.
    pub async fn send(&self, text: impl Into<String>) -> Result<SendOutcome, SendError> {
        let text = text.into();
        let guard = self.acquire()?;

        let AttemptSettings { mode, policy, notice } = self.attempt_settings();

        let span = tracing::info_span!("send", attempt = %Uuid::new_v4(), %mode);
        let outcome = async {
            self.store.append(Message::user(text.as_str()));
            self.busy.send_replace(true);

            let Some(session) = self.session.get() else {
                tracing::info!("session not ready yet");
                self.store.append(Message::system(SESSION_INITIALIZING_NOTICE));
                return SendOutcome::SessionUnavailable;
            };

            self.store.append(Message::placeholder());

            let result = match mode {
                SendMode::Atomic => self.fetch_reply(session.as_ref(), &text).await,
                SendMode::Streaming => self.stream_reply(session.as_ref(), &text).await,
            };

            match result {
                Ok(()) => {
                    tracing::info!("reply complete");
                    SendOutcome::Completed
                }
                Err(e) => {
                    tracing::warn!(error = %format!("{e:#}"), ?policy, "send failed");
                    match policy {
                        FailurePolicy::OverwritePlaceholder => {
                            self.store.update_last(notice);
                        }
                        FailurePolicy::AppendNotice => self.store.append(Message::system(notice)),
                    }
                    SendOutcome::Failed
                }
            }
        }
        .instrument(span)
        .await;

        drop(guard);
        Ok(outcome)
    }

    async fn fetch_reply(&self, session: &dyn AssistantSession, text: &str) -> Result<()> {
        let reply = session.send_atomic(text).await?;
        self.store.update_last(reply);
        Ok(())
    }

    /// Apply deltas as they arrive; the store always holds the full text so far.
    async fn stream_reply(&self, session: &dyn AssistantSession, text: &str) -> Result<()> {
        let mut deltas = session.send_streaming(text).await?;
        let mut accumulated = String::new();
        while let Some(delta) = deltas.next().await {
            accumulated.push_str(&delta?);
            self.store.update_last(accumulated.as_str());
        }
        tracing::debug!(chars = accumulated.len(), "stream finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;
    use crate::session::DeltaStream;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::Mutex;

    /// Replies with canned deltas, optionally failing after them
    struct Scripted {
        deltas: Vec<&'static str>,
        fail_after: bool,
        seen: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn replying(deltas: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                deltas,
                fail_after: false,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn failing_after(deltas: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                deltas,
                fail_after: true,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AssistantSession for Scripted {
        async fn send_atomic(&self, text: &str) -> Result<String> {
            self.seen.lock().unwrap().push(text.to_string());
            if self.fail_after {
                return Err(anyhow!("quota exceeded"));
            }
            Ok(self.deltas.concat())
        }

        async fn send_streaming(&self, text: &str) -> Result<DeltaStream> {
            self.seen.lock().unwrap().push(text.to_string());
            let mut items: Vec<Result<String>> = self.deltas.iter().map(|d| Ok(d.to_string())).collect();
            if self.fail_after {
                items.push(Err(anyhow!("connection reset")));
            }
            Ok(Box::pin(stream::iter(items)))
        }
    }

    fn coordinator(session: Option<Arc<Scripted>>, mode: SendMode) -> SendCoordinator {
        let slot = SessionSlot::new();
        if let Some(session) = session {
            slot.install(session);
        }
        SendCoordinator::new(Arc::new(ConversationStore::new()), slot).with_mode(mode)
    }

    fn contents(coordinator: &SendCoordinator) -> Vec<(Role, String)> {
        coordinator
            .store()
            .messages()
            .into_iter()
            .map(|m| (m.role, m.content))
            .collect()
    }

    #[tokio::test]
    async fn missing_session_adds_initializing_notice() {
        let coordinator = coordinator(None, SendMode::Streaming);

        let outcome = coordinator.send("hi").await.unwrap();

        assert_eq!(outcome, SendOutcome::SessionUnavailable);
        assert_eq!(
            contents(&coordinator),
            vec![
                (Role::User, "hi".to_string()),
                (Role::System, SESSION_INITIALIZING_NOTICE.to_string()),
            ]
        );
        assert!(!coordinator.is_busy());
    }

    #[tokio::test]
    async fn atomic_success_fills_placeholder() {
        let session = Scripted::replying(vec!["4"]);
        let coordinator = coordinator(Some(session.clone()), SendMode::Atomic);

        assert_eq!(coordinator.send("2+2?").await.unwrap(), SendOutcome::Completed);

        assert_eq!(
            contents(&coordinator),
            vec![(Role::User, "2+2?".to_string()), (Role::Assistant, "4".to_string())]
        );
        assert_eq!(*session.seen.lock().unwrap(), vec!["2+2?"]);
    }

    #[tokio::test]
    async fn atomic_failure_appends_system_notice() {
        let coordinator = coordinator(Some(Scripted::failing_after(vec![])), SendMode::Atomic);

        assert_eq!(coordinator.send("hello").await.unwrap(), SendOutcome::Failed);

        assert_eq!(
            contents(&coordinator),
            vec![
                (Role::User, "hello".to_string()),
                (Role::Assistant, String::new()),
                (Role::System, DEFAULT_FAILURE_NOTICE.to_string()),
            ]
        );
        assert!(!coordinator.is_busy());
    }

    #[tokio::test]
    async fn streaming_accumulates_deltas() {
        let coordinator = coordinator(Some(Scripted::replying(vec!["Hel", "lo"])), SendMode::Streaming);
        let mut updates = coordinator.store().subscribe();

        let recorder = tokio::spawn(async move {
            let mut seen = Vec::new();
            while updates.changed().await.is_ok() {
                let last = updates.borrow_and_update().last().cloned();
                if let Some(last) = last.filter(|m| m.role == Role::Assistant) {
                    seen.push(last.content);
                }
            }
            seen
        });

        assert_eq!(coordinator.send("greet me").await.unwrap(), SendOutcome::Completed);
        assert_eq!(coordinator.store().last().unwrap().content, "Hello");

        drop(coordinator);
        let seen = recorder.await.unwrap();
        assert!(!seen.iter().any(|c| c == "lo"));
        assert_eq!(seen.last().map(String::as_str), Some("Hello"));
    }

    #[tokio::test]
    async fn streaming_failure_overwrites_partial_reply() {
        let coordinator = coordinator(Some(Scripted::failing_after(vec!["Hel"])), SendMode::Streaming);

        assert_eq!(coordinator.send("hi").await.unwrap(), SendOutcome::Failed);

        assert_eq!(
            contents(&coordinator),
            vec![
                (Role::User, "hi".to_string()),
                (Role::Assistant, DEFAULT_FAILURE_NOTICE.to_string()),
            ]
        );
        assert!(!coordinator.is_busy());
    }

    #[tokio::test]
    async fn explicit_policy_overrides_mode_default() {
        let coordinator = coordinator(Some(Scripted::failing_after(vec!["Hel"])), SendMode::Streaming)
            .with_failure_policy(FailurePolicy::AppendNotice)
            .with_failure_notice("Something went wrong.");

        coordinator.send("hi").await.unwrap();

        assert_eq!(
            contents(&coordinator),
            vec![
                (Role::User, "hi".to_string()),
                (Role::Assistant, "Hel".to_string()),
                (Role::System, "Something went wrong.".to_string()),
            ]
        );
    }

    #[test]
    fn failure_policy_follows_mode() {
        let coordinator = coordinator(None, SendMode::Streaming);
        assert_eq!(coordinator.failure_policy(), FailurePolicy::OverwritePlaceholder);
        coordinator.set_mode(SendMode::Atomic);
        assert_eq!(coordinator.failure_policy(), FailurePolicy::AppendNotice);
    }

    #[tokio::test]
    async fn reported_policy_is_the_one_send_applies() {
        let coordinator = coordinator(Some(Scripted::failing_after(vec![])), SendMode::Streaming);
        coordinator.set_mode(SendMode::Atomic);
        assert_eq!(coordinator.failure_policy(), FailurePolicy::AppendNotice);

        assert_eq!(coordinator.send("hi").await.unwrap(), SendOutcome::Failed);
        assert_eq!(
            contents(&coordinator),
            vec![
                (Role::User, "hi".to_string()),
                (Role::Assistant, String::new()),
                (Role::System, DEFAULT_FAILURE_NOTICE.to_string()),
            ]
        );
    }

    #[test]
    fn send_mode_parses_case_insensitively() {
        assert_eq!("Atomic".parse::<SendMode>().unwrap(), SendMode::Atomic);
        assert_eq!("streaming".parse::<SendMode>().unwrap(), SendMode::Streaming);
        assert!("batch".parse::<SendMode>().is_err());
        assert_eq!(SendMode::Atomic.to_string(), "atomic");
    }
}
