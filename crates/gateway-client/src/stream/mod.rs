//! Incremental chat reply delivery.
//!
//! The gateway answers `POST /v1/chat` either with a real stream (SSE or
//! NDJSON) or with one complete JSON reply. Both are normalized into the same
//! contract: a sequence of ever-growing accumulated texts followed by the
//! final text, which always equals the last emission.

mod line;
mod producer;

use std::sync::Arc;

use reqwest::header::CONTENT_TYPE;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use line::{DONE_SENTINEL, LineBuffer, StreamLine, parse_stream_line, whole_message_content};
pub use producer::{
    DeltaProducer, DeltaSink, EMPTY_REPLY_TEXT, EventStreamProducer, TypewriterProducer,
    reveal_frames,
};

use crate::config::StreamConfig;
use crate::error::ClientError;
use crate::transport::{AuthenticatedTransport, HttpMethod, RequestOptions, ensure_success};
use crate::types::ChatRequest;

pub const CHAT_PATH: &str = "/v1/chat";
const DELTA_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// `text/event-stream` or `application/x-ndjson`, read as it arrives.
    EventStream,
    /// Any other body, revealed on a timer once complete.
    Simulated,
}

impl DeliveryMode {
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let Some(content_type) = content_type else {
            return Self::Simulated;
        };
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "text/event-stream" | "application/x-ndjson" => Self::EventStream,
            _ => Self::Simulated,
        }
    }
}

type CompletionHook = Arc<dyn Fn() + Send + Sync>;

/// A chat reply in progress.
///
/// Dropping the stream cancels the underlying request.
pub struct ChatStream {
    mode: DeliveryMode,
    deltas: mpsc::Receiver<String>,
    outcome: JoinHandle<Result<String, ClientError>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ChatStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatStream")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl ChatStream {
    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Next accumulated text, or `None` once the producer is finished.
    pub async fn next(&mut self) -> Option<String> {
        self.deltas.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the reply to complete, discarding unread emissions.
    pub async fn finish(mut self) -> Result<String, ClientError> {
        while self.deltas.recv().await.is_some() {}
        match (&mut self.outcome).await {
            Ok(result) => result,
            Err(error) => Err(ClientError::Read {
                message: format!("stream task failed: {error}"),
            }),
        }
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Clone)]
pub struct StreamingEngine {
    transport: AuthenticatedTransport,
    config: StreamConfig,
    on_complete: Option<CompletionHook>,
}

impl std::fmt::Debug for StreamingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StreamingEngine {
    pub fn new(transport: AuthenticatedTransport, config: StreamConfig) -> Self {
        Self {
            transport,
            config,
            on_complete: None,
        }
    }

    /// Runs `hook` after every reply that completes successfully.
    pub fn with_completion_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(hook));
        self
    }

    /// Sends the chat request and returns once response headers arrive.
    pub async fn open(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream, ClientError> {
        let mut body = request.clone();
        body.stream = Some(true);
        let options = RequestOptions::json(HttpMethod::Post, &body)?
            .with_cancel(cancel.clone())
            .long_lived();

        let response = self.transport.request(CHAT_PATH, options).await?;
        let response = ensure_success(response).await?;
        let mode = DeliveryMode::from_content_type(
            response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
        );
        tracing::debug!(model = %request.model, mode = ?mode, "chat reply started");

        let producer: Box<dyn DeltaProducer> = match mode {
            DeliveryMode::EventStream => Box::new(EventStreamProducer::new(response)),
            DeliveryMode::Simulated => Box::new(TypewriterProducer::new(response, self.config)),
        };

        let (tx, deltas) = mpsc::channel(DELTA_CHANNEL_CAPACITY);
        let task_cancel = cancel.clone();
        let on_complete = self.on_complete.clone();
        let outcome = tokio::spawn(async move {
            let mut sink = DeltaSink::new(tx);
            let result = tokio::select! {
                biased;
                () = task_cancel.cancelled() => Err(ClientError::Cancelled),
                result = producer.produce(&mut sink) => result,
            };
            if result.is_ok()
                && let Some(hook) = on_complete
            {
                hook();
            }
            result
        });

        Ok(ChatStream {
            mode,
            deltas,
            outcome,
            cancel,
        })
    }

    /// Callback form: `on_delta` sees every accumulated text in order.
    pub async fn stream_chat<F>(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
        mut on_delta: F,
    ) -> Result<String, ClientError>
    where
        F: FnMut(&str),
    {
        let mut stream = self.open(request, cancel).await?;
        while let Some(text) = stream.next().await {
            on_delta(&text);
        }
        stream.finish().await
    }
}
