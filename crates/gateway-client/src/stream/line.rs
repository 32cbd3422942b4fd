use serde_json::Value;

pub const DONE_SENTINEL: &str = "[DONE]";
const DATA_PREFIX: &str = "data:";

/// What one line of a streamed chat body contributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLine {
    /// Text to append.
    Fragment(String),
    /// Text to append, after which the stream is over.
    FinalFragment(String),
    /// End of stream.
    Done,
    /// Blank, comment, malformed or content-free line.
    Skip,
}

/// Classifies one line of an SSE or NDJSON chat body.
///
/// Accepts OpenAI-style `choices[0].delta.content`, Ollama-style
/// `message.content` and generate-style `response` payloads, with or without
/// an SSE `data:` prefix.
pub fn parse_stream_line(line: &str) -> StreamLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return StreamLine::Skip;
    }
    let payload = trimmed
        .strip_prefix(DATA_PREFIX)
        .map_or(trimmed, str::trim_start);
    if payload == DONE_SENTINEL {
        return StreamLine::Done;
    }

    let value = match serde_json::from_str::<Value>(payload) {
        Ok(value) => value,
        Err(error) => {
            tracing::trace!(error = %error, line = %trimmed, "skipping unparseable stream line");
            return StreamLine::Skip;
        }
    };

    let fragment = delta_content(&value).filter(|fragment| !fragment.is_empty());
    let done = value.get("done").and_then(Value::as_bool).unwrap_or(false);
    match (fragment, done) {
        (Some(fragment), true) => StreamLine::FinalFragment(fragment.to_string()),
        (None, true) => StreamLine::Done,
        (Some(fragment), false) => StreamLine::Fragment(fragment.to_string()),
        (None, false) => StreamLine::Skip,
    }
}

fn delta_content(value: &Value) -> Option<&str> {
    value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .or_else(|| value.pointer("/message/content").and_then(Value::as_str))
        .or_else(|| value.get("response").and_then(Value::as_str))
}

/// Text of a complete, non-streamed chat reply.
pub fn whole_message_content(value: &Value) -> Option<&str> {
    value
        .pointer("/message/content")
        .and_then(Value::as_str)
        .or_else(|| value.get("response").and_then(Value::as_str))
        .or_else(|| {
            value
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str)
        })
}

/// Reassembles lines from arbitrarily split body chunks.
///
/// Works on bytes so a multi-byte character split across two reads is
/// decoded only once both halves have arrived.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every line it completed, without the
    /// trailing `\n` or `\r\n`.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=newline).collect::<Vec<_>>();
            let body = line.split_last().map_or(&[][..], |(_, body)| body);
            lines.push(decode_line(body));
        }
        lines
    }

    pub fn has_remaining(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Takes the unterminated tail left at end of body.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
