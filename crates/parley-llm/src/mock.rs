use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use parley_core::backend::{ChunkStream, CompletionBackend};
use parley_core::errors::BackendError;
use parley_core::messages::ChatMessage;

use crate::markup::strip_reasoning_markup;

/// Pre-programmed replies for deterministic testing without a live backend.
#[derive(Clone, Debug)]
pub enum MockReply {
    /// Whole reply; streamed as a single chunk.
    Text(String),
    /// Streamed fragments; concatenated in whole-response mode.
    Chunks(Vec<String>),
    /// Fragments followed by a terminal stream error.
    ChunksThenError(Vec<String>, BackendError),
    /// The call itself fails.
    Error(BackendError),
    /// Wait, then resolve the inner reply.
    Delay(Duration, Box<MockReply>),
    /// Fragments, then stall until cancelled.
    Hang(Vec<String>),
}

impl MockReply {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }

    pub fn chunks(parts: &[&str]) -> Self {
        Self::Chunks(parts.iter().map(|p| p.to_string()).collect())
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// What a single call received.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedCall {
    pub history: Vec<ChatMessage>,
    pub new_message: String,
    pub stream: bool,
}

/// Backend returning queued replies in order. Calls beyond the queue fail
/// with a 500 status error.
pub struct MockBackend {
    replies: Mutex<VecDeque<MockReply>>,
    calls: Mutex<Vec<RecordedCall>>,
    call_count: AtomicUsize,
}

impl MockBackend {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    fn next_reply(&self, history: &[ChatMessage], new_message: &str, stream: bool) -> MockReply {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().push(RecordedCall {
            history: history.to_vec(),
            new_message: new_message.to_string(),
            stream,
        });
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| {
                MockReply::Error(BackendError::Status {
                    status: 500,
                    body: format!("no reply configured for call {idx}"),
                })
            })
    }
}

/// A reply with every delay already waited out.
enum Settled {
    Text(String),
    Chunks(Vec<String>),
    ChunksThenError(Vec<String>, BackendError),
    Error(BackendError),
    Hang(Vec<String>),
}

/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve(mut reply: MockReply) -> Settled {
    loop {
        reply = match reply {
            MockReply::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                *inner
            }
            MockReply::Text(text) => return Settled::Text(text),
            MockReply::Chunks(parts) => return Settled::Chunks(parts),
            MockReply::ChunksThenError(parts, e) => return Settled::ChunksThenError(parts, e),
            MockReply::Error(e) => return Settled::Error(e),
            MockReply::Hang(parts) => return Settled::Hang(parts),
        };
    }
}

fn cleaned(parts: Vec<String>) -> Vec<Result<String, BackendError>> {
    parts
        .iter()
        .map(|p| strip_reasoning_markup(p))
        .filter(|p| !p.is_empty())
        .map(Ok)
        .collect()
}

#[async_trait]
impl CompletionBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn generate(
        &self,
        history: &[ChatMessage],
        new_message: &str,
    ) -> Result<String, BackendError> {
        let reply = self.next_reply(history, new_message, false);
        match resolve(reply).await {
            Settled::Text(text) => Ok(strip_reasoning_markup(&text)),
            Settled::Chunks(parts) | Settled::Hang(parts) => {
                Ok(strip_reasoning_markup(&parts.concat()))
            }
            Settled::ChunksThenError(_, e) | Settled::Error(e) => Err(e),
        }
    }

    async fn generate_stream(
        &self,
        history: &[ChatMessage],
        new_message: &str,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, BackendError> {
        let reply = self.next_reply(history, new_message, true);
        let reply = tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            reply = resolve(reply) => reply,
        };
        match reply {
            Settled::Text(text) => Ok(Box::pin(stream::iter(cleaned(vec![text])))),
            Settled::Chunks(parts) => Ok(Box::pin(stream::iter(cleaned(parts)))),
            Settled::ChunksThenError(parts, e) => {
                let mut items = cleaned(parts);
                items.push(Err(e));
                Ok(Box::pin(stream::iter(items)))
            }
            Settled::Hang(parts) => {
                let tail = stream::once(async move {
                    cancel.cancelled_owned().await;
                    Err(BackendError::Cancelled)
                });
                Ok(Box::pin(stream::iter(cleaned(parts)).chain(tail)))
            }
            Settled::Error(e) => Err(e),
        }
    }
}
