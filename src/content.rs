use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

static IMG_MD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\(([^)]+)\)").expect("image markdown regex"));
static IMG_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(https?://[^\s)]+?\.(?:png|jpg|jpeg|gif|webp)(?:\?[^\s)]*)?)")
        .expect("image url regex")
});

/// Phrases the backend writes into a message while it is still generating.
/// Matched as substrings after normalization.
const PLACEHOLDER_PHRASES: &[&str] = &[
    "后台生成中",
    "后台处理中",
    "处理中",
    "请稍候",
    "模型生成中或无输出",
];

/// Normalized strings that are placeholders in their entirety.
const PLACEHOLDER_EXACT: &[&str] = &["…", "（模型生成中或无输出）", "（处理中，请稍候…）"];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub url: String,
}

/// One piece of message content in the backend's multi-part wire shape.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageRef },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageRef { url: url.into() },
        }
    }
}

/// Normalize any of the content shapes the backend or the completion API may
/// hand back: a plain string, a multi-part list, or the legacy object with a
/// `text` field. Unknown shapes yield an empty list.
pub fn parts_from_content(content: &Value) -> Vec<ContentPart> {
    let mut parts = Vec::new();
    match content {
        Value::String(s) => merge_parts(&mut parts, [ContentPart::text(s.clone())]),
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::String(s) => merge_parts(&mut parts, [ContentPart::text(s.clone())]),
                    Value::Object(_) => {
                        if let Ok(part) = serde_json::from_value::<ContentPart>(item.clone()) {
                            merge_parts(&mut parts, [part]);
                        } else if let Some(text) = item
                            .get("text")
                            .and_then(Value::as_str)
                            .or_else(|| item.get("content").and_then(Value::as_str))
                        {
                            merge_parts(&mut parts, [ContentPart::text(text)]);
                        }
                    }
                    _ => {}
                }
            }
        }
        Value::Object(_) => {
            if let Some(text) = content.get("text").and_then(Value::as_str) {
                merge_parts(&mut parts, [ContentPart::text(text)]);
            }
        }
        _ => {}
    }
    parts
}

/// Append `incoming` into `target`, coalescing consecutive text runs so no
/// two adjacent text parts survive. Empty text is never stored; images with
/// an empty URL are dropped.
pub fn merge_parts(target: &mut Vec<ContentPart>, incoming: impl IntoIterator<Item = ContentPart>) {
    for part in incoming {
        match part {
            ContentPart::Text { text } => {
                if text.is_empty() {
                    continue;
                }
                if let Some(ContentPart::Text { text: last }) = target.last_mut() {
                    last.push_str(&text);
                } else {
                    target.push(ContentPart::Text { text });
                }
            }
            ContentPart::ImageUrl { image_url } => {
                if image_url.url.is_empty() {
                    continue;
                }
                target.push(ContentPart::ImageUrl { image_url });
            }
        }
    }
}

/// Concatenation of all text parts, in order. Images contribute nothing.
pub fn text_of_parts(parts: &[ContentPart]) -> String {
    let mut out = String::new();
    for part in parts {
        if let ContentPart::Text { text } = part {
            out.push_str(text);
        }
    }
    out
}

/// Image URLs in first-seen order, de-duplicated.
pub fn collect_image_urls(parts: &[ContentPart]) -> Vec<String> {
    let mut seen = HashSet::new();
    parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::ImageUrl { image_url } => Some(image_url.url.clone()),
            _ => None,
        })
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

/// True when `text` is one of the transient phrases the backend writes
/// before real content lands. The empty string is always a placeholder.
pub fn is_placeholder_text(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return true;
    }
    let normalized = trimmed
        .replace('(', "（")
        .replace(')', "）")
        .replace("...", "…");
    if PLACEHOLDER_EXACT.contains(&normalized.as_str()) {
        return true;
    }
    PLACEHOLDER_PHRASES
        .iter()
        .any(|phrase| normalized.contains(phrase))
}

/// Image references buried in Markdown text: `![..](url)` plus bare image
/// URLs, first-seen order, de-duplicated.
pub fn extract_images_from_text(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for caps in IMG_MD_RE.captures_iter(text) {
        let url = caps[1].trim().to_string();
        if !url.is_empty() && seen.insert(url.clone()) {
            out.push(url);
        }
    }
    for caps in IMG_URL_RE.captures_iter(text) {
        let url = caps[1].to_string();
        if seen.insert(url.clone()) {
            out.push(url);
        }
    }
    out
}

static MD_IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[([^\]]*)\]\([^)]+\)").expect("md image regex"));
static MD_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").expect("md link regex"));
static MD_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(.*?)```").expect("md fence regex"));
static MD_LINE_MARK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[#>\-\+\*]\s*").expect("md line marker regex"));
static MD_TABLE_RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\|\s*-{2,}\s*\|").expect("md table rule regex"));
static BLANK_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("blank run regex"));
static WS_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Flatten Markdown down to plain text: images become their alt text, links
/// become `text (url)`, code fences and emphasis markers are removed.
pub fn strip_markdown(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }
    let mut s = MD_IMAGE.replace_all(input, "$1").into_owned();
    s = MD_LINK.replace_all(&s, "$1 ($2)").into_owned();
    s = MD_FENCE.replace_all(&s, "$1").into_owned();
    s = s.replace('`', "");
    for mark in ["**", "__", "*", "_", "~~"] {
        s = s.replace(mark, "");
    }
    s = MD_LINE_MARK.replace_all(&s, "").into_owned();
    s = MD_TABLE_RULE.replace_all(&s, "|").into_owned();
    s = BLANK_RUN.replace_all(&s, "\n\n").into_owned();
    s.trim().to_string()
}

/// Synthesize a chat title from the first user message: a stripped,
/// whitespace-collapsed snippet of at most 16 characters plus a timestamp
/// suffix, e.g. `天气怎么样 · 20250301-0942`.
pub fn build_chat_title(seed_text: &str) -> String {
    let stripped = strip_markdown(seed_text);
    let collapsed = WS_RUN.replace_all(&stripped, " ");
    let snippet: String = collapsed.trim().chars().take(16).collect();
    let base = if snippet.is_empty() {
        "会话".to_string()
    } else {
        snippet
    };
    let ts = chrono::Local::now().format("%Y%m%d-%H%M");
    format!("{base} · {ts}")
}
