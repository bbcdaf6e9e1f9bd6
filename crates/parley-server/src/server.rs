use std::sync::Arc;
use std::time::Duration;

use axum::middleware;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use parley_core::backend::CompletionBackend;
use parley_store::{HistoryStore, Storage};

use crate::auth::{auth_middleware, AuthState};
use crate::relay::RelayConfig;
use crate::{accounts, admin, chat, relay};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout: Duration,
    pub relay: RelayConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            request_timeout: Duration::from_secs(120),
            relay: RelayConfig::default(),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub history: Arc<dyn HistoryStore>,
    pub backend: Arc<dyn CompletionBackend>,
    pub auth: AuthState,
    pub relay: RelayConfig,
    /// Parent of every relay session's token.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        storage: Storage,
        backend: Arc<dyn CompletionBackend>,
        auth: AuthState,
        relay: RelayConfig,
    ) -> Self {
        Self {
            history: Arc::new(storage.clone()),
            storage,
            backend,
            auth,
            relay,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let protected = Router::new()
        .route("/api/ws", get(relay::ws_handler))
        .route("/api/chat", post(chat::chat_handler))
        .route("/api/conversations", get(admin::list_conversations))
        .route("/api/conversations/create", post(admin::create_conversation))
        .route("/api/conversations/delete", post(admin::delete_conversation))
        .route("/api/conversations/rename", post(admin::rename_conversation))
        .route("/api/messages", get(admin::list_messages))
        .route("/api/messages/delete", post(admin::delete_message))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/auth/register", post(accounts::register))
        .route("/api/auth/login", post(accounts::login))
        .merge(protected)
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, state: AppState) -> Result<ServerHandle, std::io::Error> {
    let shutdown = state.shutdown.clone();
    let router = build_router(state, config.request_timeout);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "parley server started");

    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections, end every relay session, and wait for
    /// the listener task.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task failed");
        }
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestApp;

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let app = TestApp::spawn(vec![]).await;
        let resp = reqwest::get(app.url("/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn protected_routes_require_token() {
        let app = TestApp::spawn(vec![]).await;
        let client = reqwest::Client::new();

        let resp = client.get(app.url("/api/conversations")).send().await.unwrap();
        assert_eq!(resp.status(), 401);

        let resp = client
            .get(app.url("/api/conversations"))
            .bearer_auth("not-a-jwt")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        let resp = client
            .get(app.url("/api/conversations"))
            .bearer_auth(&app.token)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn token_for_unknown_account_is_rejected() {
        let app = TestApp::spawn(vec![]).await;
        let ghost = app.state.auth.issue_token("ghost@example.com").unwrap();
        let resp = reqwest::Client::new()
            .get(app.url("/api/conversations"))
            .bearer_auth(ghost)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
    }

    #[tokio::test]
    async fn wrong_method_is_405() {
        let app = TestApp::spawn(vec![]).await;
        let resp = reqwest::Client::new()
            .get(app.url("/api/chat"))
            .bearer_auth(&app.token)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 405);
    }

    #[tokio::test]
    async fn shutdown_stops_listener() {
        let app = TestApp::spawn(vec![]).await;
        let url = app.url("/health");
        app.handle.shutdown().await;
        assert!(reqwest::get(url).await.is_err());
    }
}
