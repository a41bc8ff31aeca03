use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tracing::{info, warn};

use crate::api::ClientError;
use crate::capture::{context_message, CapturedPage, PageCapture};
use crate::chats::models::PendingExchange;
use crate::chats::{append_placeholder_pair, persist_assistant_completion, ChatStore};
use crate::config::Settings;
use crate::content::{collect_image_urls, merge_parts, text_of_parts, ContentPart};
use crate::llm::stream::{extract_assistant_content, extract_chat_id, StreamAssembler};
use crate::llm::{CompletionClient, CompletionMessage, CompletionPayload, CompletionReply};
use crate::sync::{poll_assistant_content, PendingSync, PollConfig, ReconciledContent, SyncConfig, SyncOutcome};

/// Shown in place of an answer when the completion produced nothing at all.
const EMPTY_RESPONSE_TEXT: &str = "（暂无响应）";
/// Persisted as the assistant content when the send path fails outright.
const SEND_FAILED_TEXT: &str = "（发送失败）";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One conversational message held by the panel.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<ContentPart>,
    /// True until the content is confirmed to be a real answer.
    pub pending: bool,
    /// Model that produced the turn, assistant turns only.
    pub model: Option<String>,
    /// Backend message id, once an exchange reserved one.
    pub remote_id: Option<String>,
}

impl Turn {
    pub fn user(text: &str) -> Self {
        let mut parts = Vec::new();
        merge_parts(&mut parts, [ContentPart::text(text)]);
        Self {
            role: Role::User,
            parts,
            pending: false,
            model: None,
            remote_id: None,
        }
    }

    pub fn assistant_pending(model: &str) -> Self {
        Self {
            role: Role::Assistant,
            parts: Vec::new(),
            pending: true,
            model: Some(model.to_string()),
            remote_id: None,
        }
    }

    pub fn text(&self) -> String {
        text_of_parts(&self.parts)
    }

    pub fn image_urls(&self) -> Vec<String> {
        collect_image_urls(&self.parts)
    }
}

/// Everything the host panel needs to render; delivered through one shared
/// callback so background resolutions reach the UI as well.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Status { message: String, is_error: bool },
    TurnAdded { index: usize, role: Role },
    AssistantDelta { index: usize, text: String },
    TurnsRolledBack { count: usize },
    SyncResolved(SyncOutcome),
}

pub type EventSink = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// One panel conversation: the ordered turn list, its backend identifiers,
/// and the send-and-reconcile flow that keeps the two in step.
pub struct ChatSession<B> {
    backend: Arc<B>,
    settings: Settings,
    events: EventSink,
    turns: Vec<Turn>,
    chat_id: Option<String>,
    session_id: String,
    title_locked: bool,
    capture_enabled: bool,
    poll_config: PollConfig,
    sync_config: SyncConfig,
}

impl<B> ChatSession<B>
where
    B: ChatStore + CompletionClient + 'static,
{
    pub fn new(backend: Arc<B>, settings: Settings, events: EventSink) -> Self {
        Self {
            backend,
            settings,
            events,
            turns: Vec::new(),
            chat_id: None,
            session_id: uuid::Uuid::new_v4().to_string(),
            title_locked: false,
            capture_enabled: false,
            poll_config: PollConfig::default(),
            sync_config: SyncConfig::default(),
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.chat_id.as_deref()
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.settings.model = Some(model.into());
    }

    pub fn set_capture_enabled(&mut self, enabled: bool) {
        self.capture_enabled = enabled;
    }

    pub fn set_poll_config(&mut self, config: PollConfig) {
        self.poll_config = config;
    }

    pub fn set_sync_config(&mut self, config: SyncConfig) {
        self.sync_config = config;
    }

    /// Start over: clear local display state and identifiers. A background
    /// sync still bound to the old chat id runs to completion or times out
    /// on its own; its resolution carries an id no current turn matches.
    pub fn reset(&mut self) {
        self.turns.clear();
        self.chat_id = None;
        self.session_id = uuid::Uuid::new_v4().to_string();
        self.title_locked = false;
    }

    /// Switch the panel onto an existing remote conversation.
    pub async fn load_history_chat(&mut self, chat_id: &str) -> Result<(), ClientError> {
        let snapshot = self.backend.fetch_snapshot(chat_id).await?;
        self.turns = snapshot
            .flattened_messages()
            .iter()
            .filter_map(|m| {
                let role = match m.role.as_str() {
                    "user" => Role::User,
                    "assistant" => Role::Assistant,
                    _ => return None,
                };
                let mut parts = Vec::new();
                merge_parts(&mut parts, [ContentPart::text(m.text())]);
                for url in m.image_urls() {
                    merge_parts(&mut parts, [ContentPart::image(url)]);
                }
                Some(Turn {
                    role,
                    parts,
                    pending: false,
                    model: m.model_name.clone(),
                    remote_id: Some(m.id.clone()),
                })
            })
            .collect();
        self.chat_id = Some(chat_id.to_string());
        self.session_id = uuid::Uuid::new_v4().to_string();
        self.title_locked = true;
        Ok(())
    }

    /// Fold a background resolution into the turn it was spawned for. Turns
    /// from other exchanges, or from a conversation that was reset away, are
    /// left untouched.
    pub fn apply_sync_outcome(&mut self, outcome: &SyncOutcome) {
        let Some(turn) = self
            .turns
            .iter_mut()
            .find(|t| t.remote_id.as_deref() == Some(outcome.assistant_mid.as_str()))
        else {
            return;
        };
        if outcome.timed_out {
            // Keep whatever partial content was assembled.
            turn.pending = false;
            return;
        }
        let mut parts = Vec::new();
        merge_parts(&mut parts, [ContentPart::text(outcome.text.clone())]);
        for url in &outcome.images {
            merge_parts(&mut parts, [ContentPart::image(url.clone())]);
        }
        turn.parts = parts;
        turn.pending = false;
    }

    async fn ensure_chat_id(&mut self, model: &str) -> Option<String> {
        if self.chat_id.is_some() {
            return self.chat_id.clone();
        }
        match self.backend.create_chat(Some(model)).await {
            Ok(id) => {
                self.chat_id = Some(id.clone());
                self.title_locked = false;
                Some(id)
            }
            Err(err) => {
                warn!(error = %err, "chat creation failed, continuing without remote persistence");
                None
            }
        }
    }

    fn status(&self, message: impl Into<String>, is_error: bool) {
        (self.events)(SessionEvent::Status {
            message: message.into(),
            is_error,
        });
    }

    /// History projection for the completion request: the optional context
    /// message, then every settled turn; image-bearing turns ride as part
    /// lists, the rest as plain strings.
    fn completion_messages(&self, context: Option<&CompletionMessage>) -> Vec<CompletionMessage> {
        let mut out = Vec::new();
        if let Some(context) = context {
            out.push(context.clone());
        }
        for turn in &self.turns {
            if turn.pending {
                continue;
            }
            let text = turn.text();
            let images = turn.image_urls();
            if turn.role == Role::Assistant && text.trim().is_empty() && images.is_empty() {
                continue;
            }
            if images.is_empty() {
                out.push(CompletionMessage::text(turn.role.as_str(), text));
            } else {
                out.push(CompletionMessage::parts(turn.role.as_str(), &turn.parts));
            }
        }
        out
    }

    /// Submit one prompt: optimistic turns, placeholder reservation,
    /// streamed assembly, then a short reconciliation pass and a background
    /// sync that persists the final turn exactly once.
    pub async fn send_message(
        &mut self,
        prompt: &str,
        capture: Option<&dyn PageCapture>,
    ) -> Result<Option<PendingExchange>, ClientError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Ok(None);
        }
        self.settings.validate()?;
        let model = self.settings.model().to_string();

        // 1. Capture page context when enabled; a failed capture injects
        //    nothing and only colors the final status line.
        let mut captured: Option<CapturedPage> = None;
        if self.capture_enabled {
            if let Some(capture) = capture {
                captured = capture.capture().await;
            }
        }
        let context = captured.as_ref().and_then(context_message);

        // 2. Optimistic turns, shown before anything touches the network.
        let user_index = self.turns.len();
        self.turns.push(Turn::user(prompt));
        (self.events)(SessionEvent::TurnAdded {
            index: user_index,
            role: Role::User,
        });
        let assistant_index = self.turns.len();
        self.turns.push(Turn::assistant_pending(&model));
        (self.events)(SessionEvent::TurnAdded {
            index: assistant_index,
            role: Role::Assistant,
        });
        self.status("思考中...", false);

        // 3. Locate or create the remote chat; without one the exchange
        //    stays local-only.
        let chat_id = self.ensure_chat_id(&model).await;

        // 4. Reserve stable message ids.
        let mut exchange: Option<PendingExchange> = None;
        if let Some(chat_id) = &chat_id {
            match append_placeholder_pair(
                self.backend.as_ref(),
                chat_id,
                &model,
                prompt,
                self.title_locked,
            )
            .await
            {
                Ok(write) => {
                    if write.title_set {
                        self.title_locked = true;
                    }
                    self.turns[user_index].remote_id = Some(write.exchange.user_mid.clone());
                    self.turns[assistant_index].remote_id =
                        Some(write.exchange.assistant_mid.clone());
                    exchange = Some(write.exchange);
                }
                Err(err) => warn!(error = %err, "placeholder write failed, exchange is local-only"),
            }
        }

        // 5. Fire the completion and assemble the reply.
        let payload = CompletionPayload {
            messages: self.completion_messages(context.as_ref()),
            stream: true,
            model: model.clone(),
            session_id: self.session_id.clone(),
            chat_id: chat_id.clone(),
            id: exchange.as_ref().map(|e| e.assistant_mid.clone()),
        };
        if let Err(err) = self.run_completion(&payload, assistant_index).await {
            self.turns.truncate(user_index);
            (self.events)(SessionEvent::TurnsRolledBack { count: 2 });
            self.status(format!("发送失败: {err}"), true);
            if let (Some(chat_id), Some(exchange)) = (self.chat_id.clone(), exchange.as_ref()) {
                persist_assistant_completion(
                    self.backend.as_ref(),
                    &chat_id,
                    exchange,
                    SEND_FAILED_TEXT,
                    &[],
                    Some(&model),
                    Some(&self.session_id),
                )
                .await;
            }
            return Err(err);
        }

        if self.turns[assistant_index].text().trim().is_empty()
            && self.turns[assistant_index].image_urls().is_empty()
        {
            // Display-only fallback; the sync task keeps looking for the
            // real content.
            (self.events)(SessionEvent::AssistantDelta {
                index: assistant_index,
                text: EMPTY_RESPONSE_TEXT.to_string(),
            });
        }

        // 6. Reconcile and persist off the call stack.
        if let (Some(chat_id), Some(exchange)) = (self.chat_id.clone(), exchange.clone()) {
            let local = ReconciledContent {
                text: self.turns[assistant_index].text(),
                images: self.turns[assistant_index].image_urls(),
            };
            let polled = poll_assistant_content(
                self.backend.as_ref(),
                &chat_id,
                &exchange,
                self.poll_config.short_window,
                self.poll_config.short_interval,
            )
            .await;
            let best = if polled.is_acceptable() { polled } else { local };
            if best.is_acceptable() {
                self.turns[assistant_index].pending = false;
            }

            let events = self.events.clone();
            let task = PendingSync::new(
                self.backend.clone(),
                chat_id,
                exchange.clone(),
                model,
                self.session_id.clone(),
                self.sync_config.clone(),
            );
            task.spawn(best, move |outcome| {
                events(SessionEvent::SyncResolved(outcome));
            });
            info!(assistant_mid = %exchange.assistant_mid, "pending sync scheduled");
        } else if !self.turns[assistant_index].text().trim().is_empty() {
            self.turns[assistant_index].pending = false;
        }

        match captured.as_ref() {
            Some(page) if page.succeeded => {
                self.status(format!("完成。页面抓取方式: {:?}", page.source), false)
            }
            Some(_) => self.status("已回答，页面内容未能抓取。", false),
            None => self.status("完成。", false),
        }
        Ok(exchange)
    }

    async fn run_completion(
        &mut self,
        payload: &CompletionPayload,
        assistant_index: usize,
    ) -> Result<(), ClientError> {
        let backend = self.backend.clone();
        let reply = backend.completion(payload).await?;
        let events = self.events.clone();
        match reply {
            CompletionReply::Stream(mut stream) => {
                let mut assembler = StreamAssembler::new();
                {
                    let mut sink = |text: &str| {
                        events(SessionEvent::AssistantDelta {
                            index: assistant_index,
                            text: text.to_string(),
                        });
                    };
                    while let Some(chunk) = stream.next().await {
                        let chunk = chunk?;
                        assembler.push(&chunk, &mut sink);
                    }
                    assembler.finish(&mut sink);
                }
                if let Some(chat_id) = assembler.chat_id() {
                    self.chat_id = Some(chat_id.to_string());
                }
                self.turns[assistant_index].parts = assembler.into_parts();
            }
            CompletionReply::Json(value) => self.adopt_json_reply(&value, assistant_index),
            CompletionReply::Text(text) => match serde_json::from_str::<Value>(&text) {
                Ok(value) => self.adopt_json_reply(&value, assistant_index),
                Err(_) => {
                    let mut parts = Vec::new();
                    merge_parts(&mut parts, [ContentPart::text(text)]);
                    self.turns[assistant_index].parts = parts;
                    (self.events)(SessionEvent::AssistantDelta {
                        index: assistant_index,
                        text: self.turns[assistant_index].text(),
                    });
                }
            },
        }
        Ok(())
    }

    fn adopt_json_reply(&mut self, value: &Value, assistant_index: usize) {
        if let Some(chat_id) = extract_chat_id(value) {
            self.chat_id = Some(chat_id);
        }
        self.turns[assistant_index].parts = extract_assistant_content(value);
        (self.events)(SessionEvent::AssistantDelta {
            index: assistant_index,
            text: self.turns[assistant_index].text(),
        });
    }
}
