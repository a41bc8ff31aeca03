pub mod stream;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use serde::Serialize;
use serde_json::{json, Value};

use crate::api::{ApiClient, ClientError};
use crate::content::ContentPart;

/// One message in a completion request. `content` is either the legacy
/// plain string or a part list when images ride along.
#[derive(Debug, Serialize, Clone)]
pub struct CompletionMessage {
    pub role: String,
    pub content: Value,
}

impl CompletionMessage {
    pub fn text(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: json!(text.into()),
        }
    }

    pub fn parts(role: &str, parts: &[ContentPart]) -> Self {
        Self {
            role: role.to_string(),
            content: serde_json::to_value(parts).unwrap_or(Value::Null),
        }
    }
}

/// Body of `POST /api/chat/completions`.
#[derive(Debug, Serialize, Clone)]
pub struct CompletionPayload {
    pub messages: Vec<CompletionMessage>,
    pub stream: bool,
    pub model: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

pub type ByteStream = BoxStream<'static, Result<Vec<u8>, ClientError>>;

/// What the completion endpoint handed back: an event stream when it
/// streams, a JSON document when it does not, or raw text when the body is
/// not even JSON.
pub enum CompletionReply {
    Stream(ByteStream),
    Json(Value),
    Text(String),
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn completion(&self, payload: &CompletionPayload)
        -> Result<CompletionReply, ClientError>;
}

#[async_trait]
impl CompletionClient for ApiClient {
    async fn completion(
        &self,
        payload: &CompletionPayload,
    ) -> Result<CompletionReply, ClientError> {
        let body = serde_json::to_value(payload).map_err(|e| ClientError::Parse(e.to_string()))?;
        let resp = self.post_raw("/api/chat/completions", &body).await?;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if content_type.contains("text/event-stream") {
            let stream = resp
                .bytes_stream()
                .map_ok(|chunk| chunk.to_vec())
                .map_err(ClientError::from);
            Ok(CompletionReply::Stream(Box::pin(stream)))
        } else if content_type.contains("application/json") {
            Ok(CompletionReply::Json(resp.json().await?))
        } else {
            Ok(CompletionReply::Text(resp.text().await?))
        }
    }
}
