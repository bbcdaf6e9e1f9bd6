//! Shared fixtures for handler and relay tests.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use secrecy::SecretString;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use parley_core::backend::CompletionBackend;
use parley_core::envelope::{EnvelopeKind, OutboundEnvelope};
use parley_core::ids::{ConversationId, UserId};
use parley_llm::{MockBackend, MockReply};
use parley_store::{Database, HistoryStore, MessageRow, NewMessage, Storage, StoreError};

use crate::auth::AuthState;
use crate::relay::RelayConfig;
use crate::server::{start, AppState, ServerConfig, ServerHandle};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Conversation id seeded for the default user.
pub const CONVERSATION: ConversationId = ConversationId::new(42);

pub struct TestApp {
    pub handle: ServerHandle,
    pub state: AppState,
    pub backend: Arc<MockBackend>,
    pub user_id: UserId,
    pub token: String,
}

impl TestApp {
    pub async fn spawn(replies: Vec<MockReply>) -> Self {
        Self::spawn_with(replies, RelayConfig::default(), None).await
    }

    pub async fn spawn_with(
        replies: Vec<MockReply>,
        relay: RelayConfig,
        history: Option<Arc<dyn HistoryStore>>,
    ) -> Self {
        Self::launch(replies, relay, history, None).await
    }

    /// Serve with a hand-written backend in place of the mock.
    pub async fn spawn_with_backend(backend: Arc<dyn CompletionBackend>) -> Self {
        Self::launch(vec![], RelayConfig::default(), None, Some(backend)).await
    }

    async fn launch(
        replies: Vec<MockReply>,
        relay: RelayConfig,
        history: Option<Arc<dyn HistoryStore>>,
        backend_override: Option<Arc<dyn CompletionBackend>>,
    ) -> Self {
        let db = Database::in_memory().unwrap();
        let storage = Storage::new(db.clone());
        let backend = Arc::new(MockBackend::new(replies));
        let auth = AuthState::new(&SecretString::from("test-secret"), 1).with_bcrypt_cost(4);

        let mut state = AppState::new(storage, backend.clone(), auth, relay.clone());
        if let Some(history) = history {
            state.history = history;
        }
        if let Some(other) = backend_override {
            state.backend = other;
        }

        let user_id = state
            .storage
            .users
            .create("ada@example.com", "unused", "Ada")
            .unwrap()
            .id;
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (id, user_id, title, created_at, updated_at)
                 VALUES (?1, ?2, 'seeded', '2026-01-01T00:00:00.000000Z', '2026-01-01T00:00:00.000000Z')",
                [CONVERSATION.get(), user_id.get()],
            )?;
            Ok(())
        })
        .unwrap();
        let token = state.auth.issue_token("ada@example.com").unwrap();

        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            request_timeout: Duration::from_secs(10),
            relay,
        };
        let handle = start(config, state.clone()).await.unwrap();

        Self {
            handle,
            state,
            backend,
            user_id,
            token,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.handle.port)
    }

    /// A second account with its own token.
    pub fn add_user(&self, email: &str) -> (UserId, String) {
        let id = self.state.storage.users.create(email, "unused", "Other").unwrap().id;
        (id, self.state.auth.issue_token(email).unwrap())
    }

    pub async fn connect(&self) -> Ws {
        let url = format!("ws://127.0.0.1:{}/api/ws?token={}", self.handle.port, self.token);
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        ws
    }

    pub fn stored(&self, conversation: ConversationId) -> Vec<MessageRow> {
        self.state
            .storage
            .messages
            .list_by_conversation(conversation)
            .unwrap()
    }
}

pub async fn send_json(ws: &mut Ws, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Next envelope from the server, skipping control frames. `None` once the
/// server has closed the socket.
pub async fn next_envelope(ws: &mut Ws) -> Option<OutboundEnvelope> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame");
        match frame {
            Some(Ok(Message::Text(text))) => {
                return Some(serde_json::from_str(text.as_str()).unwrap());
            }
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

/// Drain a closed outbox channel.
pub async fn collect_kinds(mut rx: mpsc::Receiver<OutboundEnvelope>) -> Vec<(EnvelopeKind, String)> {
    let mut out = Vec::new();
    while let Some(env) = rx.recv().await {
        out.push((env.kind, env.content));
    }
    out
}

/// A store whose every call fails.
pub struct FailingHistory;

impl HistoryStore for FailingHistory {
    fn owns_conversation(&self, _: UserId, _: ConversationId) -> Result<bool, StoreError> {
        Err(StoreError::Database("disk I/O error".into()))
    }

    fn list_by_conversation(&self, _: ConversationId) -> Result<Vec<MessageRow>, StoreError> {
        Err(StoreError::Database("disk I/O error".into()))
    }

    fn create(&self, _: NewMessage) -> Result<MessageRow, StoreError> {
        Err(StoreError::Database("disk I/O error".into()))
    }
}
