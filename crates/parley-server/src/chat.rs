//! Synchronous Request Handler: one message in, one whole completion out.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use parley_core::envelope::UserTurn;
use parley_core::errors::ValidationError;
use parley_core::ids::ConversationId;
use parley_core::messages::ChatMessage;
use parley_store::NewMessage;

use crate::auth::CurrentUser;
use crate::error::ApiError;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: String,
    pub timestamp: String,
}

#[instrument(skip_all, fields(user = %current.email))]
pub async fn chat_handler(
    State(state): State<AppState>,
    current: CurrentUser,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let user = current.resolve(&state.storage.users)?;
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let turn = UserTurn::new(req.conversation_id, req.message)?;
    let conv = turn.conversation_id;

    match state.history.owns_conversation(user.id, conv) {
        Ok(true) => {}
        Ok(false) => return Err(ValidationError::UnknownConversation(conv).into()),
        Err(e) => warn!(error = %e, conversation_id = %conv, "ownership check failed, proceeding"),
    }

    let user_message_id = match state
        .history
        .create(NewMessage::user(conv, user.id, turn.content.as_str()))
    {
        Ok(row) => Some(row.id),
        Err(e) => {
            warn!(error = %e, conversation_id = %conv, "failed to persist user message");
            None
        }
    };

    let history: Vec<ChatMessage> = match state.history.list_by_conversation(conv) {
        Ok(rows) => rows
            .iter()
            .filter(|row| Some(row.id) != user_message_id)
            .map(ChatMessage::from)
            .collect(),
        Err(e) => {
            warn!(error = %e, conversation_id = %conv, "history unavailable, replaying none");
            Vec::new()
        }
    };

    let reply = state.backend.generate(&history, &turn.content).await?;

    if let Err(e) = state
        .history
        .create(NewMessage::assistant(conv, user.id, reply.as_str()))
    {
        warn!(error = %e, conversation_id = %conv, "failed to persist assistant message");
    }

    Ok(Json(ChatResponse {
        message: reply,
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingHistory, TestApp, CONVERSATION};
    use crate::relay::RelayConfig;
    use parley_core::backend::{ChunkStream, CompletionBackend};
    use parley_core::errors::BackendError;
    use parley_core::messages::Role;
    use parley_llm::MockReply;
    use serde_json::json;
    use std::sync::Arc;

    async fn post_chat(app: &TestApp, body: serde_json::Value) -> reqwest::Response {
        reqwest::Client::new()
            .post(app.url("/api/chat"))
            .bearer_auth(&app.token)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn returns_whole_reply_and_persists_both_sides() {
        let app = TestApp::spawn(vec![MockReply::text("<think>hmm</think>Hello")]).await;
        let resp = post_chat(&app, json!({"message": "hi", "conversation_id": 42})).await;
        assert_eq!(resp.status(), 200);

        let body: ChatResponse = resp.json().await.unwrap();
        assert_eq!(body.message, "hmmHello");
        assert!(chrono::DateTime::parse_from_rfc3339(&body.timestamp).is_ok());

        let stored = app.stored(CONVERSATION);
        assert_eq!(stored.len(), 2);
        assert_eq!((stored[0].role, stored[0].content.as_str()), (Role::User, "hi"));
        assert_eq!((stored[1].role, stored[1].content.as_str()), (Role::Assistant, "hmmHello"));

        let call = &app.backend.calls()[0];
        assert!(!call.stream);
        assert!(call.history.is_empty());
    }

    /// Returns its reply untouched, so anything the handler did to the text
    /// would show.
    struct VerbatimBackend(&'static str);

    #[async_trait::async_trait]
    impl CompletionBackend for VerbatimBackend {
        fn name(&self) -> &str {
            "verbatim"
        }

        fn model(&self) -> &str {
            "verbatim"
        }

        async fn generate(&self, _: &[ChatMessage], _: &str) -> Result<String, BackendError> {
            Ok(self.0.to_string())
        }

        async fn generate_stream(
            &self,
            _: &[ChatMessage],
            _: &str,
            _: tokio_util::sync::CancellationToken,
        ) -> Result<ChunkStream, BackendError> {
            Err(BackendError::Cancelled)
        }
    }

    #[tokio::test]
    async fn reply_text_is_taken_from_backend_as_is() {
        let app = TestApp::spawn_with_backend(Arc::new(VerbatimBackend("a </think> b"))).await;

        let resp = post_chat(&app, json!({"message": "hi", "conversation_id": 42})).await;
        assert_eq!(resp.status(), 200);
        let body: ChatResponse = resp.json().await.unwrap();
        assert_eq!(body.message, "a </think> b");
    }

    #[tokio::test]
    async fn backend_500_yields_500_without_assistant_row() {
        let app = TestApp::spawn(vec![MockReply::Error(BackendError::from_status(
            500,
            "model crashed",
        ))])
        .await;
        let resp = post_chat(&app, json!({"message": "hi", "conversation_id": 42})).await;
        assert_eq!(resp.status(), 500);
        let body = resp.text().await.unwrap();
        assert_eq!(body, crate::error::GENERATION_FAILED);
        assert!(!body.contains("model crashed"));

        let stored = app.stored(CONVERSATION);
        assert!(stored.iter().all(|m| m.role != Role::Assistant));
    }

    #[tokio::test]
    async fn missing_fields_are_400() {
        let app = TestApp::spawn(vec![]).await;
        for body in [
            json!({"message": "", "conversation_id": 42}),
            json!({"message": "hi"}),
            json!({"message": "hi", "conversation_id": 0}),
        ] {
            let resp = post_chat(&app, body).await;
            assert_eq!(resp.status(), 400);
        }

        let resp = reqwest::Client::new()
            .post(app.url("/api/chat"))
            .bearer_auth(&app.token)
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        assert_eq!(app.backend.call_count(), 0);
        assert!(app.stored(CONVERSATION).is_empty());
    }

    #[tokio::test]
    async fn missing_identity_is_401() {
        let app = TestApp::spawn(vec![]).await;
        let resp = reqwest::Client::new()
            .post(app.url("/api/chat"))
            .json(&json!({"message": "hi", "conversation_id": 42}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
    }

    #[tokio::test]
    async fn foreign_conversation_is_404() {
        let app = TestApp::spawn(vec![MockReply::text("never")]).await;
        let (bob, _) = app.add_user("bob@example.com");
        let bobs = app.state.storage.conversations.create(bob, "private").unwrap();

        let resp = post_chat(&app, json!({"message": "hi", "conversation_id": bobs.id})).await;
        assert_eq!(resp.status(), 404);
        assert_eq!(app.backend.call_count(), 0);
    }

    #[tokio::test]
    async fn persistence_failure_still_answers() {
        let app = TestApp::spawn_with(
            vec![MockReply::text("Hello")],
            RelayConfig::default(),
            Some(Arc::new(FailingHistory)),
        )
        .await;
        let resp = post_chat(&app, json!({"message": "hi", "conversation_id": 42})).await;
        assert_eq!(resp.status(), 200);
        let body: ChatResponse = resp.json().await.unwrap();
        assert_eq!(body.message, "Hello");
    }
}
