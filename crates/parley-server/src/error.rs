//! HTTP-facing errors. Bodies are plain text.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use parley_core::errors::{BackendError, ValidationError};
use parley_store::StoreError;

use crate::auth::AuthError;

/// Client-facing text for any failed generation. The backend's own message
/// may carry its response body and is only logged.
pub const GENERATION_FAILED: &str = "failed to generate a reply";

const INTERNAL: &str = "internal server error";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Auth(e) => e.status(),
            Self::Backend(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Response body. Server-side failures get a fixed string.
    pub fn client_message(&self) -> String {
        match self {
            Self::Backend(_) => GENERATION_FAILED.to_string(),
            Self::Internal(_) => INTERNAL.to_string(),
            other => other.to_string(),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        match e {
            ValidationError::UnknownConversation(_) => Self::NotFound(e.to_string()),
            ValidationError::MissingFields | ValidationError::TooManyTurns => {
                Self::BadRequest(e.to_string())
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Conflict(what) => Self::Conflict(what),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, self.client_message()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::ids::ConversationId;

    #[test]
    fn validation_maps_to_client_errors() {
        assert_eq!(
            ApiError::from(ValidationError::MissingFields).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(ValidationError::UnknownConversation(ConversationId::new(9))).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn backend_failure_is_server_error() {
        let err = ApiError::from(BackendError::from_status(500, "boom"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "backend error: backend returned status 500: boom");
        assert_eq!(err.client_message(), GENERATION_FAILED);
    }

    #[test]
    fn internal_detail_stays_out_of_body() {
        let err = ApiError::from(StoreError::Database("no such table: users".into()));
        assert_eq!(err.client_message(), "internal server error");
        assert_eq!(
            ApiError::NotFound("conversation 9 not found".into()).client_message(),
            "conversation 9 not found"
        );
    }

    #[test]
    fn store_errors_map_by_kind() {
        assert_eq!(
            ApiError::from(StoreError::Conflict("dup".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(StoreError::Database("locked".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
