//! Bearer-token identity: JWT issuance and validation, the request
//! middleware, and the `CurrentUser` extractor.

use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use parley_store::{UserRepo, UserRow};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,

    #[error("invalid authorization header format")]
    InvalidAuthHeader,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    TokenExpired,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("unknown user")]
    UnknownUser,

    #[error("internal auth error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

/// Signing keys and token lifetime. Cheap to clone.
#[derive(Clone)]
pub struct AuthState {
    encoding: EncodingKey,
    decoding: DecodingKey,
    token_ttl_secs: i64,
    bcrypt_cost: u32,
}

impl AuthState {
    pub fn new(secret: &SecretString, token_ttl_hours: u64) -> Self {
        let bytes = secret.expose_secret().as_bytes();
        Self {
            encoding: EncodingKey::from_secret(bytes),
            decoding: DecodingKey::from_secret(bytes),
            token_ttl_secs: i64::try_from(token_ttl_hours.saturating_mul(3600)).unwrap_or(i64::MAX),
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }

    pub fn with_bcrypt_cost(mut self, cost: u32) -> Self {
        self.bcrypt_cost = cost;
        self
    }

    pub fn bcrypt_cost(&self) -> u32 {
        self.bcrypt_cost
    }

    pub fn issue_token(&self, email: &str) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            email: email.to_string(),
            iat: now,
            exp: now.saturating_add(self.token_ttl_secs),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Internal(e.to_string()))
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            debug!(error = %e, "token rejected");
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;
        Ok(data.claims)
    }
}

/// Identity placed in request extensions by [`auth_middleware`].
#[derive(Clone, Debug)]
pub struct CurrentUser {
    pub email: String,
}

impl CurrentUser {
    /// Map the token's email to a stored account.
    pub fn resolve(&self, users: &UserRepo) -> Result<UserRow, AuthError> {
        users
            .find_by_email(&self.email)
            .map_err(|e| AuthError::Internal(e.to_string()))?
            .ok_or(AuthError::UnknownUser)
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AuthError::MissingCredentials)
    }
}

fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }
    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }
    Ok(token)
}

/// Browsers cannot set headers on WebSocket upgrades, so the token may also
/// arrive as a `token` query parameter.
fn token_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == "token" {
            urlencoding::decode(value).ok().map(|s| s.into_owned())
        } else {
            None
        }
    })
}

/// Validates the bearer token and injects [`CurrentUser`]. Rejected requests
/// never reach the handler, so a refused WebSocket upgrade sends no payload.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let claims = if let Some(header) = header {
        auth.validate_token(bearer_token_from_header(header)?)?
    } else if let Some(token) = req.uri().query().and_then(token_from_query) {
        auth.validate_token(&token)?
    } else {
        return Err(AuthError::MissingCredentials);
    };

    req.extensions_mut().insert(CurrentUser {
        email: claims.email,
    });
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AuthState {
        AuthState::new(&SecretString::from("test-secret"), 1)
    }

    #[test]
    fn bearer_header_parsing() {
        assert_eq!(bearer_token_from_header("Bearer abc.def").unwrap(), "abc.def");
        assert_eq!(bearer_token_from_header("bearer   tok").unwrap(), "tok");
        for bad in ["", "Bearer", "Token x", "Bearer a b"] {
            assert!(bearer_token_from_header(bad).is_err(), "{bad:?} should fail");
        }
    }

    #[test]
    fn query_token_is_url_decoded() {
        assert_eq!(token_from_query("a=1&token=x%2By").as_deref(), Some("x+y"));
        assert_eq!(token_from_query("a=1"), None);
        assert_eq!(token_from_query("tokenx=1"), None);
    }

    #[test]
    fn issued_token_validates() {
        let auth = state();
        let token = auth.issue_token("ada@example.com").unwrap();
        let claims = auth.validate_token(&token).unwrap();
        assert_eq!(claims.email, "ada@example.com");
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn token_from_other_secret_rejected() {
        let other = AuthState::new(&SecretString::from("different"), 1);
        let token = other.issue_token("ada@example.com").unwrap();
        assert!(matches!(state().validate_token(&token), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn expired_token_rejected() {
        let auth = state();
        let past = Utc::now().timestamp() - 7200;
        let claims = Claims {
            email: "ada@example.com".into(),
            iat: past,
            exp: past + 60,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &auth.encoding).unwrap();
        assert!(matches!(auth.validate_token(&token), Err(AuthError::TokenExpired)));
    }

    #[test]
    fn auth_errors_are_unauthorized_except_internal() {
        assert_eq!(AuthError::MissingCredentials.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::UnknownUser.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AuthError::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
