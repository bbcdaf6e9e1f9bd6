//! Account registration and login, issuing bearer tokens.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::auth::AuthError;
use crate::error::ApiError;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

#[instrument(skip_all)]
pub async fn register(
    State(state): State<AppState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let email = req.email.trim().to_lowercase();
    let name = req.name.trim().to_string();
    if email.is_empty() || req.password.is_empty() || name.is_empty() {
        return Err(ApiError::BadRequest(
            "email, password and name are required".into(),
        ));
    }

    let cost = state.auth.bcrypt_cost();
    let password = req.password;
    let hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let user = state.storage.users.create(&email, &hash, &name)?;
    info!(user_id = %user.id, "account registered");
    Ok(Json(TokenResponse {
        token: state.auth.issue_token(&user.email)?,
    }))
}

#[instrument(skip_all)]
pub async fn login(
    State(state): State<AppState>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let email = req.email.trim().to_lowercase();

    let user = state
        .storage
        .users
        .find_by_email(&email)?
        .ok_or(AuthError::InvalidCredentials)?;

    let hash = user.password_hash.clone();
    let password = req.password;
    let valid = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .unwrap_or(false);
    if !valid {
        return Err(AuthError::InvalidCredentials.into());
    }

    Ok(Json(TokenResponse {
        token: state.auth.issue_token(&user.email)?,
    }))
}
