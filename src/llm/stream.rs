use serde_json::Value;

use crate::content::{merge_parts, parts_from_content, text_of_parts, ContentPart};

/// Pull assistant content out of a completion payload, streamed or not.
/// Preference order: `choices[0].delta.content`, `choices[0].delta.text`,
/// then the generic fallbacks (`choices[0].message.content`, a top-level
/// string `message`, an assistant entry in `messages[]`).
pub fn extract_assistant_content(data: &Value) -> Vec<ContentPart> {
    let choice = data.get("choices").and_then(|c| c.get(0));
    if let Some(choice) = choice {
        if let Some(delta) = choice.get("delta") {
            if let Some(content) = delta.get("content") {
                let parts = parts_from_content(content);
                if !parts.is_empty() {
                    return parts;
                }
            }
            if let Some(text) = delta.get("text") {
                let parts = parts_from_content(text);
                if !parts.is_empty() {
                    return parts;
                }
            }
        }
        if let Some(content) = choice.get("message").and_then(|m| m.get("content")) {
            let parts = parts_from_content(content);
            if !parts.is_empty() {
                return parts;
            }
        }
    }
    if let Some(message) = data.get("message").and_then(Value::as_str) {
        return parts_from_content(&Value::String(message.to_string()));
    }
    if let Some(messages) = data.get("messages").and_then(Value::as_array) {
        if let Some(assistant) = messages
            .iter()
            .find(|m| m.get("role").and_then(Value::as_str) == Some("assistant"))
        {
            if let Some(content) = assistant.get("content") {
                return parts_from_content(content);
            }
        }
    }
    Vec::new()
}

fn id_like(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| s.len() >= 8)
        .map(str::to_string)
}

/// Find the chat id a completion payload is bound to, wherever the backend
/// chose to put it.
pub fn extract_chat_id(data: &Value) -> Option<String> {
    for key in ["chat_id", "conversation_id"] {
        if let Some(id) = id_like(data.get(key)) {
            return Some(id);
        }
    }
    if let Some(id) = data.get("chat").and_then(|c| c.get("id")).and_then(Value::as_str) {
        return Some(id.to_string());
    }
    let choice = data.get("choices").and_then(|c| c.get(0));
    if let Some(choice) = choice {
        for container in ["message", "delta"] {
            let meta = choice.get(container).and_then(|m| m.get("metadata"));
            if let Some(meta) = meta {
                for key in ["chat_id", "conversation_id"] {
                    if let Some(id) = id_like(meta.get(key)) {
                        return Some(id);
                    }
                }
            }
        }
    }
    None
}

/// Incremental assembler for a `text/event-stream` completion body.
///
/// Feed raw byte chunks with [`push`](Self::push); events are cut on blank
/// lines, `data:` lines are parsed as delta records, `[DONE]` ends a line's
/// processing, and unparseable bodies degrade to raw text. The sink receives
/// the full assembled text after every delta, however the bytes were
/// chunked.
#[derive(Default)]
pub struct StreamAssembler {
    pending: Vec<u8>,
    buffer: String,
    parts: Vec<ContentPart>,
    chat_id: Option<String>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8], sink: &mut dyn FnMut(&str)) {
        self.pending.extend_from_slice(bytes);
        self.drain_utf8();
        while let Some(pos) = self.buffer.find("\n\n") {
            let event = self.buffer[..pos].trim().to_string();
            self.buffer.drain(..pos + 2);
            if !event.is_empty() {
                self.process_event(&event, sink);
            }
        }
    }

    /// Flush whatever is left once the transport signals end of stream.
    pub fn finish(&mut self, sink: &mut dyn FnMut(&str)) {
        self.pending.push(b'\n');
        self.drain_utf8();
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        if !rest.is_empty() {
            self.process_event(rest, sink);
        }
    }

    pub fn text(&self) -> String {
        text_of_parts(&self.parts)
    }

    pub fn image_urls(&self) -> Vec<String> {
        crate::content::collect_image_urls(&self.parts)
    }

    pub fn into_parts(self) -> Vec<ContentPart> {
        self.parts
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.chat_id.as_deref()
    }

    /// Move every complete UTF-8 sequence from the byte buffer into the text
    /// buffer, holding back a split trailing character for the next chunk.
    fn drain_utf8(&mut self) {
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    self.buffer.push_str(s);
                    self.pending.clear();
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    self.buffer
                        .push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        Some(bad) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn process_event(&mut self, event: &str, sink: &mut dyn FnMut(&str)) {
        for line in event.lines() {
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                // Ends this event's processing; the transport signals the
                // actual end of stream separately.
                return;
            }
            match serde_json::from_str::<Value>(data) {
                Ok(record) => {
                    if let Some(chat_id) = extract_chat_id(&record) {
                        self.chat_id = Some(chat_id);
                    }
                    let incoming = extract_assistant_content(&record);
                    if !incoming.is_empty() {
                        merge_parts(&mut self.parts, incoming);
                        sink(&self.text());
                    }
                }
                Err(_) => {
                    merge_parts(&mut self.parts, [ContentPart::text(data)]);
                    sink(&self.text());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delta_event(content: &str) -> String {
        format!(
            "data: {}\n\n",
            json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    fn assemble(body: &[u8], chunk_sizes: &[usize]) -> (String, usize) {
        let mut assembler = StreamAssembler::new();
        let mut redraws = 0;
        let mut sink = |_: &str| redraws += 1;
        let mut offset = 0;
        let mut sizes = chunk_sizes.iter().copied().cycle();
        while offset < body.len() {
            let size = sizes.next().unwrap().max(1).min(body.len() - offset);
            assembler.push(&body[offset..offset + size], &mut sink);
            offset += size;
        }
        assembler.finish(&mut sink);
        (assembler.text(), redraws)
    }

    #[test]
    fn test_assembly_is_chunking_invariant() {
        let mut body = String::new();
        for delta in ["He", "llo", " 世界", "！"] {
            body.push_str(&delta_event(delta));
        }
        body.push_str("data: [DONE]\n\n");
        let bytes = body.as_bytes();

        let (whole, redraws) = assemble(bytes, &[bytes.len()]);
        assert_eq!(whole, "Hello 世界！");
        assert_eq!(redraws, 4, "one redraw per delta");

        // Byte-at-a-time splits multi-byte characters across pushes.
        for sizes in [&[1usize][..], &[2, 3][..], &[7][..], &[1, 13, 2][..]] {
            let (text, _) = assemble(bytes, sizes);
            assert_eq!(text, whole, "chunk sizes {sizes:?} changed the result");
        }
    }

    #[test]
    fn test_done_is_per_line_not_per_stream() {
        let mut assembler = StreamAssembler::new();
        let mut sink = |_: &str| {};
        let body = format!("data: [DONE]\n\n{}", delta_event("after"));
        assembler.push(body.as_bytes(), &mut sink);
        assembler.finish(&mut sink);
        assert_eq!(assembler.text(), "after");
    }

    #[test]
    fn test_unparseable_data_degrades_to_raw_text() {
        let mut assembler = StreamAssembler::new();
        let mut sink = |_: &str| {};
        assembler.push(b"data: plain words\n\n", &mut sink);
        assembler.finish(&mut sink);
        assert_eq!(assembler.text(), "plain words");
    }

    #[test]
    fn test_trailing_event_without_boundary_is_flushed() {
        let mut assembler = StreamAssembler::new();
        let mut sink = |_: &str| {};
        let event = delta_event("tail");
        assembler.push(event.trim_end().as_bytes(), &mut sink);
        assembler.finish(&mut sink);
        assert_eq!(assembler.text(), "tail");
    }

    #[test]
    fn test_extract_preference_order() {
        let delta = json!({"choices": [{"delta": {"content": "a"}, "message": {"content": "b"}}]});
        assert_eq!(text_of_parts(&extract_assistant_content(&delta)), "a");

        let delta_text = json!({"choices": [{"delta": {"text": "t"}}]});
        assert_eq!(text_of_parts(&extract_assistant_content(&delta_text)), "t");

        let message = json!({"choices": [{"message": {"content": "m"}}]});
        assert_eq!(text_of_parts(&extract_assistant_content(&message)), "m");

        let top = json!({"message": "top"});
        assert_eq!(text_of_parts(&extract_assistant_content(&top)), "top");

        let list = json!({"messages": [
            {"role": "user", "content": "q"},
            {"role": "assistant", "content": "ans"}
        ]});
        assert_eq!(text_of_parts(&extract_assistant_content(&list)), "ans");

        assert!(extract_assistant_content(&json!({"noise": true})).is_empty());
    }

    #[test]
    fn test_image_parts_survive_assembly() {
        let mut assembler = StreamAssembler::new();
        let mut sink = |_: &str| {};
        let event = format!(
            "data: {}\n\n",
            json!({"choices": [{"delta": {"content": [
                {"type": "text", "text": "图："},
                {"type": "image_url", "image_url": {"url": "http://x/a.png"}}
            ]}}]})
        );
        assembler.push(event.as_bytes(), &mut sink);
        assert_eq!(assembler.text(), "图：");
        assert_eq!(assembler.image_urls(), vec!["http://x/a.png"]);
    }

    #[test]
    fn test_chat_id_adoption() {
        let mut assembler = StreamAssembler::new();
        let mut sink = |_: &str| {};
        let event = format!(
            "data: {}\n\n",
            json!({"chat_id": "abcdef1234", "choices": [{"delta": {"content": "x"}}]})
        );
        assembler.push(event.as_bytes(), &mut sink);
        assert_eq!(assembler.chat_id(), Some("abcdef1234"));

        // Short ids are noise, metadata ids are honored.
        assert_eq!(extract_chat_id(&json!({"chat_id": "short"})), None);
        let meta = json!({"choices": [{"delta": {"metadata": {"conversation_id": "0123456789"}}}]});
        assert_eq!(extract_chat_id(&meta).as_deref(), Some("0123456789"));
    }
}
