use std::time::Duration;

/// Failures of a call to the completion backend.
///
/// None of these are retried: a failed call is terminal for the turn that made it.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed backend response: {0}")]
    Decode(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl BackendError {
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        Self::Status {
            status,
            body: body.into(),
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Decode(_) => "decode",
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// User-correctable input problems. Never fatal to a connection.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("conversation_id and content are required")]
    MissingFields,
    #[error("conversation {0} not found")]
    UnknownConversation(crate::ids::ConversationId),
    #[error("too many replies in progress, wait for one to finish")]
    TooManyTurns,
}
