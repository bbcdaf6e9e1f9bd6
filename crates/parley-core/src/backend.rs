use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::errors::BackendError;
use crate::messages::ChatMessage;

/// Incremental completion output: cleaned, non-empty text fragments in
/// arrival order. An `Err` item is terminal; nothing follows it.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

/// A remote text-generation service.
///
/// Both modes take the replayed history (oldest first) and the new user
/// message, which the implementation appends as the final entry. Both modes
/// must send the same system prompt and sampling parameters.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    /// Whole-response mode. The text comes back already cleaned of
    /// reasoning markup; callers use it as is.
    async fn generate(
        &self,
        history: &[ChatMessage],
        new_message: &str,
    ) -> Result<String, BackendError>;

    /// Incremental mode. The returned stream stops at the backend's terminal
    /// marker or end of data, and yields `Err(Cancelled)` once `cancel` fires.
    async fn generate_stream(
        &self,
        history: &[ChatMessage],
        new_message: &str,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, BackendError>;
}
