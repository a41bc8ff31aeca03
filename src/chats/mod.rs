pub mod memory;
pub mod models;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ClientError};
use crate::content::{build_chat_title, is_placeholder_text};
use models::{ChatMessage, ChatSnapshot, PendingExchange};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Accessor over the backend's remote chat documents. The store holds no
/// state of its own; writes are full-document overwrites, so callers must
/// read-modify-write the latest snapshot.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Fetch the current snapshot. A chat the backend has no record of
    /// decodes to an empty skeleton rather than an error.
    async fn fetch_snapshot(&self, chat_id: &str) -> Result<ChatSnapshot, ClientError>;

    /// Create a fresh remote chat and return its id.
    async fn create_chat(&self, model: Option<&str>) -> Result<String, ClientError>;

    /// Overwrite the full chat document.
    async fn write_snapshot(&self, chat_id: &str, snapshot: &ChatSnapshot)
        -> Result<(), ClientError>;

    /// Tell the backend generation for this message id is finished. Best
    /// effort: failures are logged, never propagated.
    async fn mark_completed(
        &self,
        chat_id: &str,
        assistant_mid: &str,
        model: Option<&str>,
        session_id: Option<&str>,
    );
}

#[async_trait]
impl ChatStore for ApiClient {
    async fn fetch_snapshot(&self, chat_id: &str) -> Result<ChatSnapshot, ClientError> {
        let data = self
            .get_json(&format!("/api/v1/chats/{chat_id}?refresh=1"))
            .await?;
        let mut snapshot =
            ChatSnapshot::decode(&data).unwrap_or_else(|| ChatSnapshot::skeleton(chat_id));
        if snapshot.id.is_empty() {
            snapshot.id = chat_id.to_string();
        }
        Ok(snapshot)
    }

    async fn create_chat(&self, model: Option<&str>) -> Result<String, ClientError> {
        let mut chat = serde_json::Map::new();
        if let Some(model) = model {
            chat.insert("models".into(), json!([model]));
        }
        let data = self
            .post_json("/api/v1/chats/new", &json!({ "chat": chat }))
            .await?;
        let id = data
            .get("id")
            .or_else(|| data.get("data").and_then(|d| d.get("id")))
            .or_else(|| data.get("chat").and_then(|c| c.get("id")))
            .and_then(Value::as_str)
            .map(str::to_string);
        match id {
            Some(id) => {
                info!(chat_id = %id, "created remote chat");
                Ok(id)
            }
            None => Err(ClientError::Parse("chat creation returned no id".into())),
        }
    }

    async fn write_snapshot(
        &self,
        chat_id: &str,
        snapshot: &ChatSnapshot,
    ) -> Result<(), ClientError> {
        self.post_json(
            &format!("/api/v1/chats/{chat_id}?refresh=1"),
            &json!({ "chat": snapshot }),
        )
        .await?;
        Ok(())
    }

    async fn mark_completed(
        &self,
        chat_id: &str,
        assistant_mid: &str,
        model: Option<&str>,
        session_id: Option<&str>,
    ) {
        let mut payload = json!({
            "chat_id": chat_id,
            "id": assistant_mid,
            "done": true,
            "stop": true,
        });
        if let Some(model) = model {
            payload["model"] = json!(model);
        }
        if let Some(session_id) = session_id {
            payload["session_id"] = json!(session_id);
        }
        if let Err(err) = self.post_json("/api/chat/completed", &payload).await {
            warn!(chat_id, assistant_mid, error = %err, "chat completed signal failed");
        }
    }
}

/// Outcome of writing a placeholder pair: the minted exchange plus whether a
/// title was synthesized (which locks title generation for the conversation).
#[derive(Debug, Clone)]
pub struct PlaceholderWrite {
    pub exchange: PendingExchange,
    pub title_set: bool,
}

/// Reserve stable message ids for one exchange by writing a user message and
/// an empty assistant message into the remote document before the model has
/// produced anything.
pub async fn append_placeholder_pair<S: ChatStore + ?Sized>(
    store: &S,
    chat_id: &str,
    model: &str,
    user_text: &str,
    title_locked: bool,
) -> Result<PlaceholderWrite, ClientError> {
    let mut snapshot = store.fetch_snapshot(chat_id).await?;
    snapshot.backfill_history();

    let ts = now_ms();
    let user_mid = uuid::Uuid::new_v4().to_string();
    let assistant_mid = uuid::Uuid::new_v4().to_string();

    let user_msg = ChatMessage {
        id: user_mid.clone(),
        role: "user".into(),
        content: json!(user_text),
        parent_id: snapshot.last_assistant_id(),
        timestamp: ts,
        models: vec![model.to_string()],
        done: Some(true),
        ..Default::default()
    };
    let assistant_msg = ChatMessage {
        id: assistant_mid.clone(),
        role: "assistant".into(),
        content: json!(""),
        parent_id: Some(user_mid.clone()),
        model_name: Some(model.to_string()),
        model_idx: Some(0),
        timestamp: ts + 1,
        done: Some(false),
        stop: Some(false),
        ..Default::default()
    };
    snapshot.append_message(user_msg);
    snapshot.append_message(assistant_msg);

    let mut title_set = false;
    let title_empty = snapshot
        .title
        .as_deref()
        .map(|t| t.trim().is_empty())
        .unwrap_or(true);
    if !title_locked && title_empty {
        snapshot.title = Some(build_chat_title(user_text));
        title_set = true;
    }

    store.write_snapshot(chat_id, &snapshot).await?;
    info!(chat_id, user_mid = %user_mid, assistant_mid = %assistant_mid, "placeholder pair written");
    Ok(PlaceholderWrite {
        exchange: PendingExchange {
            user_mid,
            assistant_mid,
        },
        title_set,
    })
}

/// Write the final assistant content for an exchange: read-modify-write the
/// document, replacing the assistant message by id (appending if it is
/// gone), then signal completion. Placeholder-only text with no images is
/// never persisted.
pub async fn persist_assistant_completion<S: ChatStore + ?Sized>(
    store: &S,
    chat_id: &str,
    exchange: &PendingExchange,
    text: &str,
    images: &[String],
    model: Option<&str>,
    session_id: Option<&str>,
) -> bool {
    let text = text.trim();
    if is_placeholder_text(text) && images.is_empty() {
        debug!(chat_id, "skipping persist: placeholder or empty content");
        return false;
    }

    let mut snapshot = match store.fetch_snapshot(chat_id).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(chat_id, error = %err, "persist fetch failed, writing fresh document");
            ChatSnapshot::skeleton(chat_id)
        }
    };
    snapshot.backfill_history();

    let parent_id = if exchange.user_mid.is_empty() {
        snapshot.last_user_id()
    } else {
        Some(exchange.user_mid.clone())
    };
    let assistant_msg = ChatMessage {
        id: exchange.assistant_mid.clone(),
        role: "assistant".into(),
        content: json!(text),
        parent_id,
        model_name: model.map(str::to_string),
        model_idx: model.map(|_| 0),
        timestamp: now_ms(),
        images: images.to_vec(),
        done: Some(true),
        ..Default::default()
    };
    snapshot.upsert_message(assistant_msg);

    if let Err(err) = store.write_snapshot(chat_id, &snapshot).await {
        warn!(chat_id, error = %err, "assistant overwrite failed");
    }
    store
        .mark_completed(chat_id, &exchange.assistant_mid, model, session_id)
        .await;
    info!(chat_id, assistant_mid = %exchange.assistant_mid, "assistant completion persisted");
    true
}
