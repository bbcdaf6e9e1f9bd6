//! Relay Session: one duplex connection, its single writer task, and the
//! receive loop that turns user messages into generation exchanges.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, trace, warn};

use parley_core::backend::CompletionBackend;
use parley_core::envelope::{InboundEnvelope, OutboundEnvelope, UserTurn};
use parley_core::errors::ValidationError;
use parley_core::ids::{ConnectionId, UserId};
use parley_store::{HistoryStore, NewMessage};

use crate::auth::CurrentUser;
use crate::error::ApiError;
use crate::exchange::{GenerationExchange, TurnTracker};
use crate::server::AppState;

/// Floor for the ping period; a zero interval is not a valid timer.
const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Outbound envelopes buffered per connection before senders wait.
    pub max_send_queue: usize,
    pub max_turns_in_flight: usize,
    pub heartbeat: Duration,
    /// How long teardown waits for cancelled turns to wind down.
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_send_queue: 256,
            max_turns_in_flight: 4,
            heartbeat: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Sending half of a connection's writer channel. Every producer (the receive
/// loop and each exchange) holds a clone; only the writer task touches the
/// socket.
#[derive(Clone)]
pub struct Outbox {
    connection_id: ConnectionId,
    tx: mpsc::Sender<OutboundEnvelope>,
}

impl Outbox {
    pub fn new(connection_id: ConnectionId, tx: mpsc::Sender<OutboundEnvelope>) -> Self {
        Self { connection_id, tx }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Waits for queue capacity. False once the writer is gone.
    pub async fn send(&self, envelope: OutboundEnvelope) -> bool {
        self.tx.send(envelope).await.is_ok()
    }
}

/// Identity is resolved before the upgrade: an unknown account gets a 401
/// and the socket is never opened.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Response, ApiError> {
    let user = current.resolve(&state.storage.users)?;
    Ok(ws
        .on_upgrade(move |socket| run_session(socket, state, user.id))
        .into_response())
}

async fn run_session(socket: WebSocket, state: AppState, user_id: UserId) {
    let connection_id = ConnectionId::new();
    let config = state.relay.clone();
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel(config.max_send_queue.max(1));

    let cancel = state.shutdown.child_token();
    let writer = tokio::spawn(write_loop(
        sink,
        rx,
        config.heartbeat.max(MIN_HEARTBEAT),
        cancel.clone(),
        connection_id.clone(),
    ));

    let session = Session {
        user_id,
        outbox: Outbox::new(connection_id.clone(), tx),
        history: Arc::clone(&state.history),
        backend: Arc::clone(&state.backend),
        turns: TurnTracker::new(config.max_turns_in_flight),
        tasks: TaskTracker::new(),
        cancel,
    };

    info!(connection_id = %connection_id, user_id = %user_id, "relay session opened");
    session.receive(stream).await;
    session.shutdown(config.shutdown_grace).await;
    drop(session);

    if let Err(e) = writer.await {
        warn!(connection_id = %connection_id, error = %e, "writer task failed");
    }
    info!(connection_id = %connection_id, "relay session closed");
}

struct Session {
    user_id: UserId,
    outbox: Outbox,
    history: Arc<dyn HistoryStore>,
    backend: Arc<dyn CompletionBackend>,
    turns: TurnTracker,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl Session {
    #[instrument(skip_all, fields(connection_id = %self.outbox.connection_id(), user_id = %self.user_id))]
    async fn receive(&self, mut stream: SplitStream<WebSocket>) {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = stream.next() => frame,
            };
            match frame {
                Some(Ok(WsMessage::Text(text))) => match InboundEnvelope::parse(text.as_str()) {
                    Ok(envelope) => self.handle(envelope).await,
                    Err(e) => {
                        warn!(error = %e, "undecodable envelope, closing session");
                        break;
                    }
                },
                Some(Ok(WsMessage::Binary(_))) => debug!("ignoring binary frame"),
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "read failed");
                    break;
                }
            }
        }
    }

    async fn handle(&self, envelope: InboundEnvelope) {
        match envelope {
            InboundEnvelope::UserMessage {
                conversation_id,
                content,
            } => match UserTurn::new(conversation_id, content) {
                Ok(turn) => self.accept(turn).await,
                Err(e) => {
                    let conv = conversation_id.filter(|id| id.is_valid());
                    self.outbox.send(OutboundEnvelope::error(conv, e.to_string())).await;
                }
            },
            InboundEnvelope::Unknown => debug!("ignoring unknown envelope type"),
        }
    }

    #[instrument(skip_all, fields(conversation_id = %turn.conversation_id))]
    async fn accept(&self, turn: UserTurn) {
        let conv = turn.conversation_id;
        match self.history.owns_conversation(self.user_id, conv) {
            Ok(true) => {}
            Ok(false) => {
                let e = ValidationError::UnknownConversation(conv);
                self.outbox.send(OutboundEnvelope::error(Some(conv), e.to_string())).await;
                return;
            }
            Err(e) => warn!(error = %e, "ownership check failed, proceeding"),
        }

        let Some(guard) = self.turns.try_begin(conv, &self.cancel) else {
            let e = ValidationError::TooManyTurns;
            self.outbox.send(OutboundEnvelope::error(Some(conv), e.to_string())).await;
            return;
        };

        let user_message_id = match self
            .history
            .create(NewMessage::user(conv, self.user_id, turn.content.as_str()))
        {
            Ok(row) => Some(row.id),
            Err(e) => {
                warn!(error = %e, "failed to persist user message");
                None
            }
        };

        let echo = OutboundEnvelope::echo(conv, turn.content.as_str()).for_turn(guard.id());
        if !self.outbox.send(echo).await {
            return;
        }

        let exchange = GenerationExchange {
            turn: guard,
            conversation_id: conv,
            user_id: self.user_id,
            content: turn.content,
            user_message_id,
            history: Arc::clone(&self.history),
            backend: Arc::clone(&self.backend),
            outbox: self.outbox.clone(),
        };
        self.tasks.spawn(exchange.run());
    }

    /// Cancel every turn, then wait up to `grace` for them to finish.
    async fn shutdown(&self, grace: Duration) {
        let cancelled = self.turns.cancel_all();
        self.cancel.cancel();
        self.tasks.close();
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            warn!(
                connection_id = %self.outbox.connection_id(),
                remaining = self.turns.len(),
                "turns still running after grace period"
            );
        } else if cancelled > 0 {
            debug!(connection_id = %self.outbox.connection_id(), cancelled, "turns cancelled");
        }
    }
}

/// Sole owner of the socket's sending half. Ends when every [`Outbox`] is
/// dropped, a write fails, or the session is cancelled.
async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<OutboundEnvelope>,
    heartbeat: Duration,
    cancel: CancellationToken,
    connection_id: ConnectionId,
) {
    let mut ping = tokio::time::interval(heartbeat);
    ping.tick().await;

    loop {
        tokio::select! {
            envelope = rx.recv() => {
                let Some(envelope) = envelope else { break };
                let text = match envelope.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(connection_id = %connection_id, error = %e, "failed to encode envelope");
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                    debug!(connection_id = %connection_id, error = %e, "write failed");
                    return;
                }
            }
            _ = ping.tick() => {
                if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    return;
                }
                trace!(connection_id = %connection_id, "sent ping");
            }
            _ = cancel.cancelled() => break,
        }
    }

    let _ = sink.send(WsMessage::Close(None)).await;
    let _ = sink.close().await;
}
