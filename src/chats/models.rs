use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::content::{extract_images_from_text, parts_from_content, text_of_parts};

/// The (user message id, assistant message id) pair minted for one
/// submit-to-persisted cycle. Both ids stay stable across stream assembly,
/// polling, and the final persist; background tasks receive their own copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingExchange {
    pub user_mid: String,
    pub assistant_mid: String,
}

fn de_timestamp<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    // Backends write either integer milliseconds or float seconds here.
    let v = Value::deserialize(deserializer)?;
    Ok(v.as_i64()
        .or_else(|| v.as_f64().map(|f| f as i64))
        .unwrap_or(0))
}

/// One message inside the remote chat document, in the backend's wire shape.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ChatMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(rename = "parentId", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(rename = "modelName", default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(rename = "modelIdx", default, skip_serializing_if = "Option::is_none")]
    pub model_idx: Option<u32>,
    #[serde(default, deserialize_with = "de_timestamp")]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<bool>,
}

impl ChatMessage {
    /// Plain-text projection of the message content, whatever shape it is in.
    pub fn text(&self) -> String {
        if let Some(s) = self.content.as_str() {
            return s.to_string();
        }
        text_of_parts(&parts_from_content(&self.content))
    }

    /// Every image URL attached to the message: structured parts, the
    /// `images` field, and Markdown references inside the text, first-seen
    /// order, de-duplicated.
    pub fn image_urls(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let parts = parts_from_content(&self.content);
        for url in crate::content::collect_image_urls(&parts) {
            if seen.insert(url.clone()) {
                out.push(url);
            }
        }
        for url in &self.images {
            if !url.is_empty() && seen.insert(url.clone()) {
                out.push(url.clone());
            }
        }
        for url in extract_images_from_text(&self.text()) {
            if seen.insert(url.clone()) {
                out.push(url);
            }
        }
        out
    }

    fn has_content(&self) -> bool {
        !self.text().trim().is_empty() || !self.image_urls().is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ChatHistory {
    #[serde(default)]
    pub current_id: Option<String>,
    #[serde(default)]
    pub messages: HashMap<String, ChatMessage>,
}

/// The full remote representation of one conversation.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ChatSnapshot {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub history: ChatHistory,
}

impl ChatSnapshot {
    /// Empty skeleton standing in for a snapshot the backend has no record
    /// of yet.
    pub fn skeleton(chat_id: &str) -> Self {
        Self {
            id: chat_id.to_string(),
            ..Default::default()
        }
    }

    /// Decode a snapshot payload. The chat object may arrive nested under
    /// `chat` or `data`, or bare; strategies are tried in that order and
    /// anything else is a decode miss.
    pub fn decode(value: &Value) -> Option<Self> {
        for candidate in [value.get("chat"), value.get("data"), Some(value)]
            .into_iter()
            .flatten()
        {
            if !candidate.is_object() {
                continue;
            }
            if let Ok(snapshot) = serde_json::from_value::<ChatSnapshot>(candidate.clone()) {
                return Some(snapshot);
            }
        }
        None
    }

    /// Id of the most recent assistant message, used to chain `parentId`
    /// when a new user message is appended.
    pub fn last_assistant_id(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "assistant" && !m.id.is_empty())
            .map(|m| m.id.clone())
    }

    /// Id of the most recent user message, the parent fallback when an
    /// exchange lost its user id.
    pub fn last_user_id(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user" && !m.id.is_empty())
            .map(|m| m.id.clone())
    }

    /// Some backend writers populate only `messages`; mirror them into the
    /// history map before editing so the id index stays complete.
    pub fn backfill_history(&mut self) {
        if self.history.messages.is_empty() && !self.messages.is_empty() {
            for m in &self.messages {
                if !m.id.is_empty() {
                    self.history.messages.insert(m.id.clone(), m.clone());
                }
            }
        }
    }

    /// Append a message to both `messages` and `history.messages` and point
    /// `current_id` at it.
    pub fn append_message(&mut self, message: ChatMessage) {
        self.history
            .messages
            .insert(message.id.clone(), message.clone());
        self.history.current_id = Some(message.id.clone());
        self.messages.push(message);
    }

    /// Replace the message with the same id, or append if it is absent,
    /// keeping the history mirror and `current_id` in step.
    pub fn upsert_message(&mut self, message: ChatMessage) {
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(slot) => *slot = message.clone(),
            None => self.messages.push(message.clone()),
        }
        self.history
            .messages
            .insert(message.id.clone(), message.clone());
        self.history.current_id = Some(message.id);
    }

    /// Every message the document knows about, from both `messages` and the
    /// history map, de-duplicated by id preferring the variant that carries
    /// content, sorted by timestamp ascending.
    pub fn flattened_messages(&self) -> Vec<ChatMessage> {
        let mut by_id: HashMap<String, ChatMessage> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        let all = self
            .messages
            .iter()
            .chain(self.history.messages.values());
        for m in all {
            if m.id.is_empty() {
                continue;
            }
            match by_id.get(&m.id) {
                Some(existing) if existing.has_content() || !m.has_content() => {}
                _ => {
                    if !by_id.contains_key(&m.id) {
                        order.push(m.id.clone());
                    }
                    by_id.insert(m.id.clone(), m.clone());
                }
            }
        }
        let mut out: Vec<ChatMessage> = order
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .collect();
        out.sort_by_key(|m| m.timestamp);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_nested_and_bare() {
        let bare = json!({"id": "c1", "title": "t", "messages": []});
        assert_eq!(ChatSnapshot::decode(&bare).unwrap().id, "c1");

        let nested = json!({"chat": {"id": "c2"}});
        assert_eq!(ChatSnapshot::decode(&nested).unwrap().id, "c2");

        let data = json!({"data": {"id": "c3"}});
        assert_eq!(ChatSnapshot::decode(&data).unwrap().id, "c3");

        assert!(ChatSnapshot::decode(&json!("nope")).is_none());
    }

    #[test]
    fn test_message_text_and_images() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "id": "m1",
            "role": "assistant",
            "content": [
                {"type": "text", "text": "看图 ![a](http://x/a.png)"},
                {"type": "image_url", "image_url": {"url": "http://x/b.png"}}
            ],
            "images": ["http://x/a.png", "http://x/c.png"],
            "timestamp": 1700000000.5
        }))
        .unwrap();
        assert_eq!(msg.text(), "看图 ![a](http://x/a.png)");
        assert_eq!(msg.timestamp, 1700000000);
        assert_eq!(
            msg.image_urls(),
            vec!["http://x/b.png", "http://x/a.png", "http://x/c.png"]
        );
    }

    #[test]
    fn test_flattened_prefers_content_bearing_variant() {
        let mut snapshot = ChatSnapshot::skeleton("c1");
        snapshot.messages.push(ChatMessage {
            id: "m1".into(),
            role: "assistant".into(),
            content: json!(""),
            timestamp: 2,
            ..Default::default()
        });
        snapshot.history.messages.insert(
            "m1".into(),
            ChatMessage {
                id: "m1".into(),
                role: "assistant".into(),
                content: json!("real answer"),
                timestamp: 2,
                ..Default::default()
            },
        );
        snapshot.history.messages.insert(
            "m0".into(),
            ChatMessage {
                id: "m0".into(),
                role: "user".into(),
                content: json!("question"),
                timestamp: 1,
                ..Default::default()
            },
        );

        let flat = snapshot.flattened_messages();
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[0].id, "m0");
        assert_eq!(flat[1].text(), "real answer");
    }

    #[test]
    fn test_upsert_replaces_by_id() {
        let mut snapshot = ChatSnapshot::skeleton("c1");
        snapshot.append_message(ChatMessage {
            id: "a1".into(),
            role: "assistant".into(),
            content: json!(""),
            ..Default::default()
        });
        snapshot.upsert_message(ChatMessage {
            id: "a1".into(),
            role: "assistant".into(),
            content: json!("done"),
            ..Default::default()
        });
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].text(), "done");
        assert_eq!(snapshot.history.messages["a1"].text(), "done");
        assert_eq!(snapshot.history.current_id.as_deref(), Some("a1"));
    }
}
