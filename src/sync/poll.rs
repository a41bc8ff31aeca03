use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::chats::models::{ChatMessage, ChatSnapshot, PendingExchange};
use crate::chats::ChatStore;
use crate::content::is_placeholder_text;

/// Content recovered from the backend's own record of an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciledContent {
    pub text: String,
    pub images: Vec<String>,
}

impl ReconciledContent {
    /// Real content is non-placeholder text or at least one image. A still
    /// empty or still-generating record is not accepted.
    pub fn is_acceptable(&self) -> bool {
        !is_placeholder_text(&self.text) || !self.images.is_empty()
    }
}

fn accept(message: &ChatMessage) -> Option<ReconciledContent> {
    let content = ReconciledContent {
        text: message.text().trim().to_string(),
        images: message.image_urls(),
    };
    content.is_acceptable().then_some(content)
}

/// Search one snapshot for the backend's materialized version of the
/// assistant turn: first by the assistant id itself, then by parent linkage
/// to the user id, and finally any assistant message stamped at or after the
/// user message, for backends that drop the linkage metadata. Placeholder
/// records never match.
pub fn reconciled_content(
    snapshot: &ChatSnapshot,
    exchange: &PendingExchange,
) -> Option<ReconciledContent> {
    let messages = snapshot.flattened_messages();

    for message in &messages {
        if message.role == "assistant" && message.id == exchange.assistant_mid {
            if let Some(content) = accept(message) {
                return Some(content);
            }
        }
    }

    for message in &messages {
        if message.role == "assistant"
            && message.parent_id.as_deref() == Some(exchange.user_mid.as_str())
        {
            if let Some(content) = accept(message) {
                return Some(content);
            }
        }
    }

    let user_ts = messages
        .iter()
        .find(|m| m.id == exchange.user_mid)
        .map(|m| m.timestamp)?;
    messages
        .iter()
        .filter(|m| m.role == "assistant" && m.timestamp >= user_ts)
        .find_map(accept)
}

/// Repeatedly re-fetch the chat document until the exchange's final content
/// appears or `timeout` elapses. An elapsed timeout returns empty content;
/// it is a normal outcome, not an error. Fetch failures are logged and the
/// loop keeps going.
pub async fn poll_assistant_content<S: ChatStore + ?Sized>(
    store: &S,
    chat_id: &str,
    exchange: &PendingExchange,
    timeout: Duration,
    interval: Duration,
) -> ReconciledContent {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match store.fetch_snapshot(chat_id).await {
            Ok(snapshot) => {
                if let Some(content) = reconciled_content(&snapshot, exchange) {
                    return content;
                }
            }
            Err(err) => debug!(chat_id, error = %err, "reconciliation fetch failed"),
        }
        sleep(interval).await;
    }
    ReconciledContent::default()
}

/// Polling windows: a short, tight phase for the common fast completion,
/// then a slower phase up to the overall timeout.
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub short_window: Duration,
    pub short_interval: Duration,
    pub long_interval: Duration,
    pub total_timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            short_window: Duration::from_secs(5),
            short_interval: Duration::from_millis(500),
            long_interval: Duration::from_millis(700),
            total_timeout: Duration::from_secs(12),
        }
    }
}

/// Two-phase reconciliation poll per [`PollConfig`].
pub async fn poll_two_phase<S: ChatStore + ?Sized>(
    store: &S,
    chat_id: &str,
    exchange: &PendingExchange,
    config: &PollConfig,
) -> ReconciledContent {
    let started = Instant::now();
    let short = config.short_window.min(config.total_timeout);
    let found = poll_assistant_content(store, chat_id, exchange, short, config.short_interval).await;
    if found.is_acceptable() {
        return found;
    }
    let remaining = config.total_timeout.saturating_sub(started.elapsed());
    if remaining >= Duration::from_millis(200) {
        let found =
            poll_assistant_content(store, chat_id, exchange, remaining, config.long_interval).await;
        if found.is_acceptable() {
            return found;
        }
    }
    ReconciledContent::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chats::memory::InMemoryChatStore;
    use serde_json::json;

    fn exchange() -> PendingExchange {
        PendingExchange {
            user_mid: "user-1".into(),
            assistant_mid: "assistant-1".into(),
        }
    }

    fn message(id: &str, role: &str, content: &str, timestamp: i64) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            role: role.into(),
            content: json!(content),
            timestamp,
            ..Default::default()
        }
    }

    fn seeded_store(assistant: ChatMessage) -> InMemoryChatStore {
        let store = InMemoryChatStore::new();
        let mut snapshot = ChatSnapshot::skeleton("c1");
        snapshot.append_message(message("user-1", "user", "问题", 100));
        snapshot.append_message(assistant);
        store.seed(snapshot);
        store
    }

    #[test]
    fn test_match_by_id_then_parent_then_timestamp() {
        let mut snapshot = ChatSnapshot::skeleton("c1");
        snapshot.append_message(message("user-1", "user", "问题", 100));
        // The exchange's own assistant id still holds a placeholder.
        snapshot.append_message(message("assistant-1", "assistant", "处理中，请稍候", 101));
        let mut linked = message("other-1", "assistant", "真正的回答", 102);
        linked.parent_id = Some("user-1".into());
        snapshot.append_message(linked);

        let found = reconciled_content(&snapshot, &exchange()).unwrap();
        assert_eq!(found.text, "真正的回答");

        // Without linkage, an assistant stamped after the user still counts.
        let mut snapshot = ChatSnapshot::skeleton("c1");
        snapshot.append_message(message("user-1", "user", "问题", 100));
        snapshot.append_message(message("stale", "assistant", "旧回答", 50));
        snapshot.append_message(message("fresh", "assistant", "新回答", 150));
        let found = reconciled_content(&snapshot, &exchange()).unwrap();
        assert_eq!(found.text, "新回答");
    }

    #[test]
    fn test_placeholder_never_matches() {
        let snapshot = {
            let mut s = ChatSnapshot::skeleton("c1");
            s.append_message(message("user-1", "user", "问题", 100));
            s.append_message(message("assistant-1", "assistant", "", 101));
            s
        };
        assert!(reconciled_content(&snapshot, &exchange()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_returns_immediately_on_materialized_content() {
        let store = seeded_store(message("assistant-1", "assistant", "已完成的回答", 101));
        let started = Instant::now();
        let found = poll_assistant_content(
            &store,
            "c1",
            &exchange(),
            Duration::from_secs(30),
            Duration::from_millis(500),
        )
        .await;
        assert_eq!(found.text, "已完成的回答");
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_after_exactly_the_window() {
        let store = seeded_store(message("assistant-1", "assistant", "", 101));
        let started = Instant::now();
        let found = poll_assistant_content(
            &store,
            "c1",
            &exchange(),
            Duration::from_secs(2),
            Duration::from_millis(500),
        )
        .await;
        assert_eq!(found, ReconciledContent::default());
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_phase_covers_the_total_timeout() {
        let store = seeded_store(message("assistant-1", "assistant", "", 101));
        let config = PollConfig {
            short_window: Duration::from_secs(1),
            short_interval: Duration::from_millis(500),
            long_interval: Duration::from_millis(500),
            total_timeout: Duration::from_secs(3),
        };
        let started = Instant::now();
        let found = poll_two_phase(&store, "c1", &exchange(), &config).await;
        assert_eq!(found, ReconciledContent::default());
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_only_content_is_acceptable() {
        let mut assistant = message("assistant-1", "assistant", "", 101);
        assistant.images = vec!["http://x/a.png".into()];
        let store = seeded_store(assistant);
        let found = poll_assistant_content(
            &store,
            "c1",
            &exchange(),
            Duration::from_secs(5),
            Duration::from_millis(500),
        )
        .await;
        assert_eq!(found.images, vec!["http://x/a.png"]);
        assert!(found.is_acceptable());
    }
}
