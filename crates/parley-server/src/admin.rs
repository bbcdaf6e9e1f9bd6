//! Conversation and message administration. Ownership is enforced by the
//! repositories' predicates; anything not owned is reported as missing.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use parley_core::ids::{ConversationId, MessageId};
use parley_store::{ConversationRow, MessageRow};

use crate::auth::CurrentUser;
use crate::error::ApiError;
use crate::server::AppState;

const MAX_TITLE_CHARS: usize = 255;

#[derive(Debug, Deserialize)]
pub struct CreateConversation {
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameConversation {
    pub id: ConversationId,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct ById<T> {
    pub id: T,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub conversation_id: Option<String>,
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(v)| v)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

fn validate_title(raw: &str) -> Result<String, ApiError> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(ApiError::BadRequest("title is required".into()));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(ApiError::BadRequest(format!(
            "title must be at most {MAX_TITLE_CHARS} characters"
        )));
    }
    Ok(title.to_string())
}

fn found(changed: bool, what: impl FnOnce() -> String) -> Result<StatusCode, ApiError> {
    if changed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(what()))
    }
}

pub async fn list_conversations(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<Vec<ConversationRow>>, ApiError> {
    let user = current.resolve(&state.storage.users)?;
    Ok(Json(state.storage.conversations.list_by_user(user.id)?))
}

pub async fn create_conversation(
    State(state): State<AppState>,
    current: CurrentUser,
    body: Result<Json<CreateConversation>, JsonRejection>,
) -> Result<Json<ConversationRow>, ApiError> {
    let user = current.resolve(&state.storage.users)?;
    let title = validate_title(&json_body(body)?.title)?;
    Ok(Json(state.storage.conversations.create(user.id, &title)?))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    current: CurrentUser,
    body: Result<Json<ById<ConversationId>>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let user = current.resolve(&state.storage.users)?;
    let id = json_body(body)?.id;
    found(state.storage.conversations.delete(id, user.id)?, || {
        format!("conversation {id} not found")
    })
}

pub async fn rename_conversation(
    State(state): State<AppState>,
    current: CurrentUser,
    body: Result<Json<RenameConversation>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let user = current.resolve(&state.storage.users)?;
    let req = json_body(body)?;
    let title = validate_title(&req.title)?;
    found(
        state.storage.conversations.rename(req.id, user.id, &title)?,
        || format!("conversation {} not found", req.id),
    )
}

pub async fn list_messages(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<MessageRow>>, ApiError> {
    let user = current.resolve(&state.storage.users)?;
    let id: ConversationId = query
        .conversation_id
        .as_deref()
        .and_then(|raw| raw.parse().ok())
        .filter(|id: &ConversationId| id.is_valid())
        .ok_or_else(|| ApiError::BadRequest("a valid conversation_id is required".into()))?;

    if state.storage.conversations.get_owned(id, user.id)?.is_none() {
        return Err(ApiError::NotFound(format!("conversation {id} not found")));
    }
    Ok(Json(state.storage.messages.list_by_conversation(id)?))
}

pub async fn delete_message(
    State(state): State<AppState>,
    current: CurrentUser,
    body: Result<Json<ById<MessageId>>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let user = current.resolve(&state.storage.users)?;
    let id = json_body(body)?.id;
    found(state.storage.messages.delete(id, user.id)?, || {
        format!("message {id} not found")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestApp, CONVERSATION};
    use parley_store::NewMessage;
    use serde_json::json;

    fn client() -> reqwest::Client {
        reqwest::Client::new()
    }

    async fn post(app: &TestApp, token: &str, path: &str, body: serde_json::Value) -> reqwest::StatusCode {
        client()
            .post(app.url(path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap()
            .status()
    }

    #[test]
    fn title_validation() {
        assert_eq!(validate_title("  Trip  ").unwrap(), "Trip");
        assert!(validate_title("   ").is_err());
        assert!(validate_title(&"x".repeat(255)).is_ok());
        assert!(validate_title(&"é".repeat(256)).is_err());
    }

    #[tokio::test]
    async fn create_and_list_conversations() {
        let app = TestApp::spawn(vec![]).await;
        let resp = client()
            .post(app.url("/api/conversations/create"))
            .bearer_auth(&app.token)
            .json(&json!({"title": "Trip plans"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let created: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(created["title"], "Trip plans");

        let list: Vec<serde_json::Value> = client()
            .get(app.url("/api/conversations"))
            .bearer_auth(&app.token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let titles: Vec<&str> = list.iter().map(|c| c["title"].as_str().unwrap()).collect();
        assert_eq!(titles, ["Trip plans", "seeded"]);

        assert_eq!(
            post(&app, &app.token, "/api/conversations/create", json!({"title": " "})).await,
            400
        );
    }

    #[tokio::test]
    async fn rename_and_delete_are_owner_scoped() {
        let app = TestApp::spawn(vec![]).await;
        let (_, bob_token) = app.add_user("bob@example.com");

        let rename = json!({"id": 42, "title": "mine now"});
        assert_eq!(post(&app, &bob_token, "/api/conversations/rename", rename).await, 404);
        assert_eq!(
            post(&app, &bob_token, "/api/conversations/delete", json!({"id": 42})).await,
            404
        );

        let rename = json!({"id": 42, "title": "renamed"});
        assert_eq!(post(&app, &app.token, "/api/conversations/rename", rename).await, 204);
        assert_eq!(
            post(&app, &app.token, "/api/conversations/rename", json!({"id": 42, "title": ""})).await,
            400
        );
        assert_eq!(
            post(&app, &app.token, "/api/conversations/delete", json!({"id": 42})).await,
            204
        );
        assert_eq!(
            post(&app, &app.token, "/api/conversations/delete", json!({"id": 42})).await,
            404
        );
    }

    #[tokio::test]
    async fn list_and_delete_messages() {
        let app = TestApp::spawn(vec![]).await;
        let storage = &app.state.storage;
        let first = storage.messages.create(&NewMessage::user(CONVERSATION, app.user_id, "one")).unwrap();
        storage.messages.create(&NewMessage::assistant(CONVERSATION, app.user_id, "two")).unwrap();
        let (_, bob_token) = app.add_user("bob@example.com");

        let get = |token: &str, query: &str| {
            client()
                .get(app.url(&format!("/api/messages{query}")))
                .bearer_auth(token.to_string())
                .send()
        };

        let rows: Vec<serde_json::Value> = get(&app.token, "?conversation_id=42")
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let contents: Vec<&str> = rows.iter().map(|m| m["content"].as_str().unwrap()).collect();
        assert_eq!(contents, ["one", "two"]);
        assert_eq!(rows[1]["role"], "assistant");

        assert_eq!(get(&app.token, "").await.unwrap().status(), 400);
        assert_eq!(get(&app.token, "?conversation_id=abc").await.unwrap().status(), 400);
        assert_eq!(get(&bob_token, "?conversation_id=42").await.unwrap().status(), 404);

        let delete = json!({"id": first.id});
        assert_eq!(post(&app, &bob_token, "/api/messages/delete", delete.clone()).await, 404);
        assert_eq!(post(&app, &app.token, "/api/messages/delete", delete.clone()).await, 204);
        assert_eq!(post(&app, &app.token, "/api/messages/delete", delete).await, 404);
        assert_eq!(app.stored(CONVERSATION).len(), 1);
    }
}
