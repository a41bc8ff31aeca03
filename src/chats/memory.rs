use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::models::ChatSnapshot;
use super::ChatStore;
use crate::api::ClientError;

/// In-memory chat store. Useful for testing and development: it mirrors the
/// remote store's full-document overwrite semantics and counts writes so
/// exactly-once behavior can be asserted.
#[derive(Clone, Default)]
pub struct InMemoryChatStore {
    chats: Arc<Mutex<HashMap<String, ChatSnapshot>>>,
    writes: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a snapshot directly into the store, standing in for writes the
    /// backend performs on its own.
    pub fn seed(&self, snapshot: ChatSnapshot) {
        let mut chats = self.chats.lock().unwrap();
        chats.insert(snapshot.id.clone(), snapshot);
    }

    pub fn snapshot(&self, chat_id: &str) -> Option<ChatSnapshot> {
        self.chats.lock().unwrap().get(chat_id).cloned()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn fetch_snapshot(&self, chat_id: &str) -> Result<ChatSnapshot, ClientError> {
        let chats = self.chats.lock().unwrap();
        Ok(chats
            .get(chat_id)
            .cloned()
            .unwrap_or_else(|| ChatSnapshot::skeleton(chat_id)))
    }

    async fn create_chat(&self, model: Option<&str>) -> Result<String, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut snapshot = ChatSnapshot::skeleton(&id);
        if let Some(model) = model {
            snapshot.models = vec![model.to_string()];
        }
        self.chats.lock().unwrap().insert(id.clone(), snapshot);
        Ok(id)
    }

    async fn write_snapshot(
        &self,
        chat_id: &str,
        snapshot: &ChatSnapshot,
    ) -> Result<(), ClientError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut chats = self.chats.lock().unwrap();
        chats.insert(chat_id.to_string(), snapshot.clone());
        Ok(())
    }

    async fn mark_completed(
        &self,
        _chat_id: &str,
        _assistant_mid: &str,
        _model: Option<&str>,
        _session_id: Option<&str>,
    ) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}
