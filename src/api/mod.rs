use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::Settings;

/// Error taxonomy for every backend interaction.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("timed out waiting for the backend")]
    Timeout,
}

impl Serialize for ClientError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// One entry in the remote chat-history listing.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatListEntry {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub updated_at: i64,
}

#[derive(Deserialize)]
struct RawChatListEntry {
    id: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    pinned: bool,
    #[serde(default)]
    updated_at: i64,
}

/// Stateless HTTP transport for an OpenWebUI-compatible backend.
///
/// Owns the connection settings and a pooled reqwest client; every call
/// carries `Authorization: Bearer <apiKey>`.
#[derive(Debug, Clone)]
pub struct ApiClient {
    pub settings: Settings,
    client: Client,
}

impl ApiClient {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            client: Client::new(),
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            let message = text.chars().take(200).collect();
            return Err(ClientError::Api { status, message });
        }
        Ok(resp)
    }

    pub(crate) async fn get_json(&self, path: &str) -> Result<Value, ClientError> {
        self.settings.validate()?;
        let resp = self
            .client
            .get(self.settings.url(path))
            .header("Accept", "application/json")
            .bearer_auth(&self.settings.api_key)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json().await?)
    }

    pub(crate) async fn post_json(&self, path: &str, body: &Value) -> Result<Value, ClientError> {
        let resp = self.post_raw(path, body).await?;
        Ok(resp.json().await?)
    }

    /// POST with a JSON body, returning the raw response for callers that
    /// need to inspect the content type (the streaming completion path).
    pub(crate) async fn post_raw(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<reqwest::Response, ClientError> {
        self.settings.validate()?;
        let resp = self
            .client
            .post(self.settings.url(path))
            .header("Content-Type", "application/json")
            .bearer_auth(&self.settings.api_key)
            .json(body)
            .send()
            .await?;
        Self::check(resp).await
    }

    /// Discover the models the backend offers. Payload shapes vary between
    /// deployments; names are extracted tolerantly and de-duplicated.
    pub async fn list_models(&self) -> Result<Vec<String>, ClientError> {
        let data = self.get_json("/api/models").await?;
        Ok(extract_model_names(&data))
    }

    /// Authenticated probe used by the settings panel's "test" button.
    pub async fn test_connection(&self) -> Result<(), ClientError> {
        self.get_json("/api/models").await.map(|_| ())
    }

    /// Enumerate remote chats: pinned first, then the regular list, newest
    /// first, de-duplicated by id.
    pub async fn list_chats(&self, limit: usize) -> Result<Vec<ChatListEntry>, ClientError> {
        let mut entries: Vec<ChatListEntry> = Vec::new();
        match self.get_json("/api/v1/chats/pinned").await {
            Ok(data) => entries.extend(decode_chat_list(data)),
            Err(err) => debug!(error = %err, "pinned chat listing unavailable"),
        }
        let data = self
            .get_json(&format!("/api/v1/chats/list?limit={limit}"))
            .await?;
        entries.extend(decode_chat_list(data));

        entries.sort_by_key(|e| (!e.pinned, -e.updated_at));
        let mut seen = std::collections::HashSet::new();
        entries.retain(|e| seen.insert(e.id.clone()));
        entries.truncate(limit);
        Ok(entries)
    }
}

/// Decode one chat-list response. Unknown shapes are a decode miss, not a
/// cue to keep searching nested objects.
fn decode_chat_list(data: Value) -> Vec<ChatListEntry> {
    let Ok(raw) = serde_json::from_value::<Vec<RawChatListEntry>>(data) else {
        return Vec::new();
    };
    raw.into_iter()
        .filter_map(|e| {
            e.id.map(|id| ChatListEntry {
                id,
                title: e.title,
                pinned: e.pinned,
                updated_at: e.updated_at,
            })
        })
        .collect()
}

/// Pull model names out of the `/api/models` payload. Accepts a bare array
/// of strings or objects, or an object wrapping one under `data`, `models`,
/// or `items`.
pub fn extract_model_names(data: &Value) -> Vec<String> {
    fn from_array(items: &[Value]) -> Vec<String> {
        items
            .iter()
            .filter_map(|m| {
                m.as_str()
                    .or_else(|| m.get("id").and_then(Value::as_str))
                    .or_else(|| m.get("name").and_then(Value::as_str))
            })
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .collect()
    }

    let names = match data {
        Value::Array(items) => from_array(items),
        Value::Object(map) => ["data", "models", "items"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
            .map(|items| from_array(items))
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    let mut seen = std::collections::HashSet::new();
    names.into_iter().filter(|n| seen.insert(n.clone())).collect()
}
