use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::line::{LineBuffer, StreamLine, parse_stream_line, whole_message_content};
use crate::config::StreamConfig;
use crate::error::ClientError;

/// Reply text used when a complete response carries no content.
pub const EMPTY_REPLY_TEXT: &str = "No response from model.";

/// Accumulated reply text for one chat call. Emissions only ever grow.
#[derive(Debug)]
pub struct DeltaSink {
    tx: mpsc::Sender<String>,
    accumulated: String,
    terminal: bool,
}

impl DeltaSink {
    pub(crate) fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            tx,
            accumulated: String::new(),
            terminal: false,
        }
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Appends a fragment and emits the new accumulated text.
    pub async fn append(&mut self, fragment: &str) {
        if self.terminal || fragment.is_empty() {
            return;
        }
        self.accumulated.push_str(fragment);
        self.emit().await;
    }

    /// Emits `prefix` if it extends what has been shown so far.
    pub async fn reveal(&mut self, prefix: &str) {
        if self.terminal || prefix.len() <= self.accumulated.len() {
            return;
        }
        prefix.clone_into(&mut self.accumulated);
        self.emit().await;
    }

    /// Marks the stream finished and returns the final text.
    pub fn finish(&mut self) -> String {
        self.terminal = true;
        self.accumulated.clone()
    }

    async fn emit(&mut self) {
        if self.tx.send(self.accumulated.clone()).await.is_err() {
            tracing::trace!("delta receiver gone, continuing to accumulate");
        }
    }
}

/// Source of incremental reply text for one response body.
#[async_trait]
pub trait DeltaProducer: Send {
    /// Feeds the sink until the reply is complete and returns the final text.
    async fn produce(self: Box<Self>, sink: &mut DeltaSink) -> Result<String, ClientError>;
}

/// Reads an SSE or NDJSON body line by line as it arrives.
pub struct EventStreamProducer {
    response: reqwest::Response,
}

impl EventStreamProducer {
    pub fn new(response: reqwest::Response) -> Self {
        Self { response }
    }
}

#[async_trait]
impl DeltaProducer for EventStreamProducer {
    async fn produce(self: Box<Self>, sink: &mut DeltaSink) -> Result<String, ClientError> {
        let mut body = self.response.bytes_stream();
        let mut lines = LineBuffer::new();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|error| ClientError::Read {
                message: error.to_string(),
            })?;
            for line in lines.push(&chunk) {
                if apply_line(sink, &line).await {
                    return Ok(sink.finish());
                }
            }
        }

        if let Some(rest) = lines.flush() {
            apply_line(sink, &rest).await;
        }
        Ok(sink.finish())
    }
}

/// Applies one line and reports whether the stream has ended.
async fn apply_line(sink: &mut DeltaSink, line: &str) -> bool {
    match parse_stream_line(line) {
        StreamLine::Fragment(fragment) => {
            sink.append(&fragment).await;
            false
        }
        StreamLine::FinalFragment(fragment) => {
            sink.append(&fragment).await;
            true
        }
        StreamLine::Done => true,
        StreamLine::Skip => false,
    }
}

/// Reveals a complete JSON reply as a sequence of growing prefixes.
pub struct TypewriterProducer {
    response: reqwest::Response,
    config: StreamConfig,
}

impl TypewriterProducer {
    pub fn new(response: reqwest::Response, config: StreamConfig) -> Self {
        Self { response, config }
    }
}

#[async_trait]
impl DeltaProducer for TypewriterProducer {
    async fn produce(self: Box<Self>, sink: &mut DeltaSink) -> Result<String, ClientError> {
        let bytes = self.response.bytes().await.map_err(|error| ClientError::Read {
            message: error.to_string(),
        })?;
        let value =
            serde_json::from_slice::<serde_json::Value>(&bytes).map_err(|error| {
                ClientError::Decode {
                    message: error.to_string(),
                }
            })?;
        let text = whole_message_content(&value).unwrap_or(EMPTY_REPLY_TEXT);
        if text.is_empty() {
            return Ok(sink.finish());
        }

        let mut ticker = tokio::time::interval(self.config.frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        for end in reveal_frames(text, self.config.frame_count()) {
            ticker.tick().await;
            if let Some(prefix) = text.get(..end) {
                sink.reveal(prefix).await;
            }
        }
        Ok(sink.finish())
    }
}

/// Byte offsets of the prefixes shown on each frame. Offsets fall on char
/// boundaries, strictly increase and end at `text.len()`.
pub fn reveal_frames(text: &str, frame_count: usize) -> Vec<usize> {
    let boundaries = text
        .char_indices()
        .map(|(index, ch)| index + ch.len_utf8())
        .collect::<Vec<_>>();
    if boundaries.is_empty() {
        return Vec::new();
    }
    let step = boundaries.len().div_ceil(frame_count.max(1));
    let mut ends = boundaries
        .iter()
        .skip(step - 1)
        .step_by(step)
        .copied()
        .collect::<Vec<_>>();
    if ends.last() != Some(&text.len()) {
        ends.push(text.len());
    }
    ends
}
