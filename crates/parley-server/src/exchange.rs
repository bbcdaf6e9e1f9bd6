//! One turn's backend call, chunk relay and persistence, plus the bounded
//! per-session set of turns in flight.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use parley_core::backend::CompletionBackend;
use parley_core::envelope::OutboundEnvelope;
use parley_core::errors::BackendError;
use parley_core::ids::{ConversationId, MessageId, TurnId, UserId};
use parley_core::messages::ChatMessage;
use parley_llm::strip_reasoning_markup;
use parley_store::{HistoryStore, NewMessage};

use crate::error::GENERATION_FAILED;
use crate::relay::Outbox;

struct ActiveTurn {
    conversation_id: ConversationId,
    cancel: CancellationToken,
    started_at: Instant,
}

/// Turns in flight for one session, capped at `limit`.
#[derive(Clone)]
pub struct TurnTracker {
    active: Arc<DashMap<TurnId, ActiveTurn>>,
    limit: usize,
}

impl TurnTracker {
    pub fn new(limit: usize) -> Self {
        Self {
            active: Arc::new(DashMap::new()),
            limit: limit.max(1),
        }
    }

    /// Register a turn under a child of `parent`, or `None` when the session
    /// is at its limit. Only the receive loop registers, so the length check
    /// cannot race another insert.
    pub fn try_begin(
        &self,
        conversation_id: ConversationId,
        parent: &CancellationToken,
    ) -> Option<TurnGuard> {
        if self.active.len() >= self.limit {
            return None;
        }
        let id = TurnId::new();
        let cancel = parent.child_token();
        self.active.insert(
            id.clone(),
            ActiveTurn {
                conversation_id,
                cancel: cancel.clone(),
                started_at: Instant::now(),
            },
        );
        Some(TurnGuard {
            id,
            cancel,
            active: Arc::clone(&self.active),
        })
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Cancel every registered turn; returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for entry in self.active.iter() {
            let turn = entry.value();
            debug!(
                turn_id = %entry.key(),
                conversation_id = %turn.conversation_id,
                elapsed_ms = turn.started_at.elapsed().as_millis() as u64,
                "cancelling turn"
            );
            turn.cancel.cancel();
            count += 1;
        }
        count
    }
}

/// Slot in a [`TurnTracker`]; released on drop.
pub struct TurnGuard {
    id: TurnId,
    cancel: CancellationToken,
    active: Arc<DashMap<TurnId, ActiveTurn>>,
}

impl TurnGuard {
    pub fn id(&self) -> &TurnId {
        &self.id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.active.remove(&self.id);
    }
}

/// How an exchange ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// `assistant_complete` was delivered.
    Completed,
    /// The backend failed and an `error` envelope was sent.
    Failed,
    /// The turn was cancelled; nothing further was sent or persisted.
    Cancelled,
    /// The connection's writer is gone.
    Disconnected,
}

enum Halt {
    Cancelled,
    Disconnected,
}

impl From<Halt> for ExchangeOutcome {
    fn from(h: Halt) -> Self {
        match h {
            Halt::Cancelled => Self::Cancelled,
            Halt::Disconnected => Self::Disconnected,
        }
    }
}

/// Per-turn state. Owned by the task running the turn and dropped with it.
pub struct GenerationExchange {
    pub turn: TurnGuard,
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub content: String,
    /// Row of the already-persisted user message, left out of the replay.
    pub user_message_id: Option<MessageId>,
    pub history: Arc<dyn HistoryStore>,
    pub backend: Arc<dyn CompletionBackend>,
    pub outbox: Outbox,
}

impl GenerationExchange {
    #[instrument(skip_all, fields(
        connection_id = %self.outbox.connection_id(),
        turn_id = %self.turn.id(),
        conversation_id = %self.conversation_id,
    ))]
    pub async fn run(self) -> ExchangeOutcome {
        let outcome = match self.relay().await {
            Ok(outcome) => outcome,
            Err(halt) => halt.into(),
        };
        debug!(?outcome, "exchange finished");
        outcome
    }

    async fn relay(&self) -> Result<ExchangeOutcome, Halt> {
        let cancel = self.turn.cancel_token().clone();
        self.emit(OutboundEnvelope::typing(self.conversation_id)).await?;

        let history = self.replay_history();
        let started = tokio::select! {
            _ = cancel.cancelled() => return Err(Halt::Cancelled),
            r = self.backend.generate_stream(&history, &self.content, cancel.clone()) => r,
        };
        let mut stream = match started {
            Ok(stream) => stream,
            Err(e) => return self.fail(e).await,
        };

        let mut buffer = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    buffer.push_str(&chunk);
                    self.emit(OutboundEnvelope::chunk(self.conversation_id, chunk))
                        .await?;
                }
                Err(e) => return self.fail(e).await,
            }
        }
        if cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }

        // Tags split across chunk boundaries only disappear here.
        let text = strip_reasoning_markup(&buffer);
        if let Err(e) = self.history.create(NewMessage::assistant(
            self.conversation_id,
            self.user_id,
            text.as_str(),
        )) {
            warn!(error = %e, "failed to persist assistant message");
        }

        self.emit(OutboundEnvelope::complete(self.conversation_id, text))
            .await?;
        info!(
            backend = self.backend.name(),
            model = self.backend.model(),
            "turn completed"
        );
        Ok(ExchangeOutcome::Completed)
    }

    async fn fail(&self, e: BackendError) -> Result<ExchangeOutcome, Halt> {
        if e.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        warn!(error = %e, kind = e.error_kind(), "backend call failed");
        self.emit(OutboundEnvelope::error(Some(self.conversation_id), GENERATION_FAILED))
            .await?;
        Ok(ExchangeOutcome::Failed)
    }

    /// Awaits writer capacity; cancellation wins over a stalled writer.
    async fn emit(&self, envelope: OutboundEnvelope) -> Result<(), Halt> {
        let cancel = self.turn.cancel_token();
        if cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        let envelope = envelope.for_turn(self.turn.id());
        tokio::select! {
            _ = cancel.cancelled() => Err(Halt::Cancelled),
            sent = self.outbox.send(envelope) => if sent { Ok(()) } else { Err(Halt::Disconnected) },
        }
    }

    fn replay_history(&self) -> Vec<ChatMessage> {
        match self.history.list_by_conversation(self.conversation_id) {
            Ok(rows) => rows
                .iter()
                .filter(|row| Some(row.id) != self.user_message_id)
                .map(ChatMessage::from)
                .collect(),
            Err(e) => {
                warn!(error = %e, "history unavailable, replaying none");
                Vec::new()
            }
        }
    }
}
