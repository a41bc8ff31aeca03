use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::llm::CompletionMessage;

/// Page text longer than this is cut before it is offered as context.
const CONTEXT_LIMIT: usize = 8000;

/// How the page text was obtained, or why it was not.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSource {
    /// Remote readability service.
    Readability,
    /// Raw HTML fetch.
    Html,
    /// In-page script.
    Dom,
    /// The tab's URL scheme cannot be captured (not http/https).
    Unsupported,
    /// Every strategy came up empty.
    None,
}

/// Result of one page-capture attempt.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CapturedPage {
    pub url: String,
    pub content: String,
    pub source: CaptureSource,
    pub succeeded: bool,
}

impl CapturedPage {
    pub fn unsupported(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            content: String::new(),
            source: CaptureSource::Unsupported,
            succeeded: false,
        }
    }
}

/// Extracts the active tab's text. The strategies themselves (readability
/// service, raw HTML fetch, in-page script) live with the host panel; this
/// crate only consumes their result.
#[async_trait]
pub trait PageCapture: Send + Sync {
    async fn capture(&self) -> Option<CapturedPage>;
}

/// Cut `text` at `limit` characters, marking the cut.
pub fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{cut}\n...\n(内容已截断)")
}

/// Build the system context message for a capture, or nothing when the
/// capture failed or produced no text.
pub fn context_message(capture: &CapturedPage) -> Option<CompletionMessage> {
    if !capture.succeeded || capture.content.trim().is_empty() {
        return None;
    }
    let excerpt = truncate(capture.content.trim(), CONTEXT_LIMIT);
    let source = match capture.source {
        CaptureSource::Readability => "readability",
        CaptureSource::Html => "html",
        CaptureSource::Dom => "dom",
        CaptureSource::Unsupported => "unsupported",
        CaptureSource::None => "none",
    };
    Some(CompletionMessage::text(
        "system",
        format!(
            "当前页面地址: {}\n抓取方式: {}\n页面内容片段:\n{}",
            capture.url, source, excerpt
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_capture_yields_no_context() {
        let capture = CapturedPage::unsupported("chrome://settings");
        assert!(context_message(&capture).is_none());
    }

    #[test]
    fn test_empty_content_yields_no_context() {
        let capture = CapturedPage {
            url: "https://example.com".into(),
            content: "   ".into(),
            source: CaptureSource::Html,
            succeeded: true,
        };
        assert!(context_message(&capture).is_none());
    }

    #[test]
    fn test_context_message_truncates_and_labels() {
        let capture = CapturedPage {
            url: "https://example.com".into(),
            content: "正".repeat(9000),
            source: CaptureSource::Readability,
            succeeded: true,
        };
        let message = context_message(&capture).unwrap();
        assert_eq!(message.role, "system");
        let text = message.content.as_str().unwrap();
        assert!(text.contains("https://example.com"));
        assert!(text.contains("readability"));
        assert!(text.contains("(内容已截断)"));
        assert!(text.chars().count() < 9000);
    }
}
