use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Future, Stream, StreamExt};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, instrument};

use parley_core::backend::{ChunkStream, CompletionBackend};
use parley_core::errors::BackendError;
use parley_core::messages::ChatMessage;

use crate::markup::strip_reasoning_markup;
use crate::ndjson::NdjsonDecoder;
use crate::wire::{self, ChatChunk, ChatRequest};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Endpoint and fixed generation parameters. Shared by both call modes.
#[derive(Debug)]
pub struct OllamaConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub system_prompt: String,
    pub temperature: f64,
    pub top_p: f64,
    pub repeat_penalty: f64,
    /// Bounds the whole call, streamed body included.
    pub timeout: Duration,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            api_key: None,
            model: "model9".to_string(),
            system_prompt: String::new(),
            temperature: 0.2,
            top_p: 0.8,
            repeat_penalty: 1.15,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Completion backend client speaking the Ollama `/api/chat` protocol.
pub struct OllamaClient {
    client: Client,
    config: OllamaConfig,
    endpoint: String,
}

impl OllamaClient {
    pub fn new(config: OllamaConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.timeout)
            .build()
            .map_err(|e| BackendError::Network(format!("failed to build HTTP client: {e}")))?;
        let endpoint = format!("{}/api/chat", config.base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            config,
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_request(
        &self,
        history: &[ChatMessage],
        new_message: &str,
        stream: bool,
    ) -> reqwest::RequestBuilder {
        let body = ChatRequest {
            model: &self.config.model,
            stream,
            messages: wire::conversation(history, new_message),
            system: &self.config.system_prompt,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            repeat_penalty: self.config.repeat_penalty,
        };

        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key.expose_secret());
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, BackendError> {
        let resp = req.send().await.map_err(|e| self.classify(e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), body));
        }
        Ok(resp)
    }

    fn classify(&self, e: reqwest::Error) -> BackendError {
        classify(e, self.config.timeout)
    }
}

fn classify(e: reqwest::Error, timeout: Duration) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout(timeout)
    } else if e.is_decode() {
        BackendError::Decode(e.to_string())
    } else {
        BackendError::Network(e.to_string())
    }
}

#[async_trait]
impl CompletionBackend for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip_all, fields(model = %self.config.model, history_len = history.len()))]
    async fn generate(
        &self,
        history: &[ChatMessage],
        new_message: &str,
    ) -> Result<String, BackendError> {
        let resp = self
            .send(self.build_request(history, new_message, false))
            .await?;
        let body = resp.bytes().await.map_err(|e| self.classify(e))?;
        let chunk: ChatChunk =
            serde_json::from_slice(&body).map_err(|e| BackendError::Decode(e.to_string()))?;
        let message = chunk
            .message
            .ok_or_else(|| BackendError::Decode("response has no message".into()))?;
        debug!(len = message.content.len(), "completion received");
        Ok(strip_reasoning_markup(&message.content))
    }

    #[instrument(skip_all, fields(model = %self.config.model, history_len = history.len()))]
    async fn generate_stream(
        &self,
        history: &[ChatMessage],
        new_message: &str,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, BackendError> {
        let req = self.build_request(history, new_message, true);
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            resp = self.send(req) => resp?,
        };

        let timeout = self.config.timeout;
        let bytes = resp
            .bytes_stream()
            .map(move |r| r.map_err(|e| classify(e, timeout)));
        Ok(Box::pin(NdjsonStream::new(bytes, cancel)))
    }
}

/// Turns a streamed `/api/chat` body into cleaned text fragments.
///
/// Ends after the first object with `done = true`, at end of data, or after
/// the first error. Cancellation yields a single `Err(Cancelled)`.
pub(crate) struct NdjsonStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, BackendError>> + Send>>,
    decoder: NdjsonDecoder,
    pending: VecDeque<Result<String, BackendError>>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    finished: bool,
}

impl NdjsonStream {
    pub(crate) fn new(
        byte_stream: impl Stream<Item = Result<Bytes, BackendError>> + Send + 'static,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            decoder: NdjsonDecoder::new(),
            pending: VecDeque::new(),
            cancelled: Box::pin(cancel.cancelled_owned()),
            finished: false,
        }
    }

    fn absorb(&mut self, frame: Result<ChatChunk, BackendError>) {
        if self.finished {
            return;
        }
        match frame {
            Ok(chunk) => {
                if !chunk.content().is_empty() {
                    let cleaned = strip_reasoning_markup(chunk.content());
                    if !cleaned.is_empty() {
                        self.pending.push_back(Ok(cleaned));
                    }
                }
                if chunk.done {
                    self.finished = true;
                }
            }
            Err(e) => {
                self.pending.push_back(Err(e));
                self.finished = true;
            }
        }
    }
}

impl Stream for NdjsonStream {
    type Item = Result<String, BackendError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(item) = this.pending.pop_front() {
                return Poll::Ready(Some(item));
            }
            if this.finished {
                return Poll::Ready(None);
            }
            if this.cancelled.as_mut().poll(cx).is_ready() {
                this.finished = true;
                return Poll::Ready(Some(Err(BackendError::Cancelled)));
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    for frame in this.decoder.push(&bytes) {
                        this.absorb(frame);
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    this.pending.push_back(Err(e));
                    this.finished = true;
                }
                Poll::Ready(None) => {
                    if let Some(frame) = this.decoder.finish() {
                        this.absorb(frame);
                    }
                    this.finished = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
