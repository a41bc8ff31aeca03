pub mod api;
pub mod capture;
pub mod chats;
pub mod config;
pub mod content;
pub mod llm;
pub mod session;
pub mod sync;

pub use api::{ApiClient, ChatListEntry, ClientError};
pub use capture::{CaptureSource, CapturedPage, PageCapture};
pub use chats::models::{ChatMessage, ChatSnapshot, PendingExchange};
pub use chats::ChatStore;
pub use config::Settings;
pub use content::ContentPart;
pub use llm::CompletionClient;
pub use session::{ChatSession, EventSink, Role, SessionEvent, Turn};
pub use sync::{PendingSync, PollConfig, SyncConfig, SyncOutcome};
