use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::poll::{poll_assistant_content, ReconciledContent};
use crate::chats::models::PendingExchange;
use crate::chats::{persist_assistant_completion, ChatStore};

/// Message surfaced to the user when reconciliation gives up. Never written
/// to the backend.
pub const TIMEOUT_MESSAGE: &str = "（生成超时，请稍后在对话历史中查看结果）";

/// Bounds for the background retry loop.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub delay_step: Duration,
    pub max_delay: Duration,
    pub poll_window: Duration,
    pub poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 150,
            base_delay: Duration::from_secs(1),
            delay_step: Duration::from_millis(200),
            max_delay: Duration::from_secs(3),
            poll_window: Duration::from_secs(2),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl SyncConfig {
    /// Linearly growing delay, capped.
    fn delay(&self, attempt: u32) -> Duration {
        (self.base_delay + self.delay_step * attempt).min(self.max_delay)
    }
}

/// Terminal result of one background sync task, routed back to the message
/// element it was spawned for via `assistant_mid`.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub assistant_mid: String,
    pub text: String,
    pub images: Vec<String>,
    pub timed_out: bool,
}

/// Background reconciliation for one exchange.
///
/// Takes its own copy of the [`PendingExchange`] at construction, so a new
/// submission can never retarget a task already in flight. Each attempt runs
/// one short poll pass and adopts any better content; acceptable content is
/// persisted exactly once and completion is signaled. Exhausting the attempt
/// budget resolves with a timeout, persisting nothing.
pub struct PendingSync<S> {
    store: Arc<S>,
    chat_id: String,
    exchange: PendingExchange,
    model: String,
    session_id: String,
    config: SyncConfig,
}

impl<S: ChatStore + 'static> PendingSync<S> {
    pub fn new(
        store: Arc<S>,
        chat_id: impl Into<String>,
        exchange: PendingExchange,
        model: impl Into<String>,
        session_id: impl Into<String>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            chat_id: chat_id.into(),
            exchange,
            model: model.into(),
            session_id: session_id.into(),
            config,
        }
    }

    /// Run the retry loop to its terminal state. `best` is the best-known
    /// content so far, usually what the stream assembler produced.
    pub async fn run(self, mut best: ReconciledContent, on_resolved: impl FnOnce(SyncOutcome)) {
        let mut attempt: u32 = 0;
        loop {
            if best.is_acceptable() {
                // Exactly one terminal persist per exchange. Failures past
                // this point are logged inside the persist call, not retried.
                persist_assistant_completion(
                    self.store.as_ref(),
                    &self.chat_id,
                    &self.exchange,
                    &best.text,
                    &best.images,
                    Some(&self.model),
                    Some(&self.session_id),
                )
                .await;
                info!(
                    chat_id = %self.chat_id,
                    assistant_mid = %self.exchange.assistant_mid,
                    attempts = attempt,
                    "pending sync resolved"
                );
                on_resolved(SyncOutcome {
                    assistant_mid: self.exchange.assistant_mid,
                    text: best.text,
                    images: best.images,
                    timed_out: false,
                });
                return;
            }

            if attempt >= self.config.max_attempts {
                warn!(
                    chat_id = %self.chat_id,
                    assistant_mid = %self.exchange.assistant_mid,
                    attempts = attempt,
                    "pending sync exhausted its attempt budget"
                );
                on_resolved(SyncOutcome {
                    assistant_mid: self.exchange.assistant_mid,
                    text: TIMEOUT_MESSAGE.to_string(),
                    images: Vec::new(),
                    timed_out: true,
                });
                return;
            }

            sleep(self.config.delay(attempt)).await;
            let found = poll_assistant_content(
                self.store.as_ref(),
                &self.chat_id,
                &self.exchange,
                self.config.poll_window,
                self.config.poll_interval,
            )
            .await;
            if found.is_acceptable() {
                debug!(
                    chat_id = %self.chat_id,
                    attempt,
                    "reconciliation produced better content"
                );
                best = found;
            }
            attempt += 1;
        }
    }

    /// Run the task off the caller's stack so the user can keep submitting
    /// while earlier exchanges are still reconciling.
    pub fn spawn(
        self,
        best: ReconciledContent,
        on_resolved: impl FnOnce(SyncOutcome) + Send + 'static,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(best, on_resolved).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chats::memory::InMemoryChatStore;
    use crate::chats::models::{ChatMessage, ChatSnapshot};
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn exchange() -> PendingExchange {
        PendingExchange {
            user_mid: "user-1".into(),
            assistant_mid: "assistant-1".into(),
        }
    }

    fn quick_config(max_attempts: u32) -> SyncConfig {
        SyncConfig {
            max_attempts,
            poll_window: Duration::from_secs(1),
            poll_interval: Duration::from_millis(500),
            ..Default::default()
        }
    }

    #[test]
    fn test_delay_grows_linearly_and_caps() {
        let config = SyncConfig::default();
        assert_eq!(config.delay(0), Duration::from_secs(1));
        assert_eq!(config.delay(5), Duration::from_secs(2));
        assert_eq!(config.delay(10), Duration::from_secs(3));
        assert_eq!(config.delay(149), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_resolves_timeout_without_persisting() {
        let store = Arc::new(InMemoryChatStore::new());
        let task = PendingSync::new(
            store.clone(),
            "c1",
            exchange(),
            "gpt-4o",
            "session-1",
            quick_config(0),
        );
        let outcome = Mutex::new(None);
        task.run(ReconciledContent::default(), |o| {
            *outcome.lock().unwrap() = Some(o);
        })
        .await;

        let outcome = outcome.lock().unwrap().take().unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.text.is_empty());
        assert_eq!(outcome.assistant_mid, "assistant-1");
        assert_eq!(store.write_count(), 0);
        assert_eq!(store.completed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acceptable_content_persists_exactly_once_without_waiting() {
        let store = Arc::new(InMemoryChatStore::new());
        store.seed(ChatSnapshot::skeleton("c1"));
        let started = Instant::now();
        let task = PendingSync::new(
            store.clone(),
            "c1",
            exchange(),
            "gpt-4o",
            "session-1",
            quick_config(150),
        );
        let outcome = Mutex::new(None);
        task.run(
            ReconciledContent {
                text: "Hello there".into(),
                images: Vec::new(),
            },
            |o| {
                *outcome.lock().unwrap() = Some(o);
            },
        )
        .await;

        assert_eq!(started.elapsed(), Duration::ZERO);
        let outcome = outcome.lock().unwrap().take().unwrap();
        assert!(!outcome.timed_out);
        assert_eq!(outcome.text, "Hello there");
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.completed_count(), 1);
        let persisted = store.snapshot("c1").unwrap();
        assert_eq!(persisted.messages.len(), 1);
        assert_eq!(persisted.messages[0].text(), "Hello there");
    }

    #[tokio::test(start_paused = true)]
    async fn test_adopts_content_the_backend_materializes_later() {
        let store = Arc::new(InMemoryChatStore::new());
        let mut snapshot = ChatSnapshot::skeleton("c1");
        snapshot.append_message(ChatMessage {
            id: "user-1".into(),
            role: "user".into(),
            content: json!("问题"),
            timestamp: 100,
            ..Default::default()
        });
        snapshot.append_message(ChatMessage {
            id: "assistant-1".into(),
            role: "assistant".into(),
            content: json!("后台生成的回答"),
            timestamp: 101,
            ..Default::default()
        });
        store.seed(snapshot);

        let task = PendingSync::new(
            store.clone(),
            "c1",
            exchange(),
            "gpt-4o",
            "session-1",
            quick_config(5),
        );
        let outcome = Mutex::new(None);
        task.run(ReconciledContent::default(), |o| {
            *outcome.lock().unwrap() = Some(o);
        })
        .await;

        let outcome = outcome.lock().unwrap().take().unwrap();
        assert!(!outcome.timed_out);
        assert_eq!(outcome.text, "后台生成的回答");
        assert_eq!(store.completed_count(), 1);
    }
}
