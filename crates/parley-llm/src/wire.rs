//! Request/response bodies of the backend's `/api/chat` endpoint.

use parley_core::messages::{ChatMessage, Role};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub stream: bool,
    pub messages: Vec<WireMessage>,
    pub system: &'a str,
    pub temperature: f64,
    pub top_p: f64,
    pub repeat_penalty: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

impl From<&ChatMessage> for WireMessage {
    fn from(m: &ChatMessage) -> Self {
        Self {
            role: m.role.as_str().to_string(),
            content: m.content.clone(),
        }
    }
}

/// One response object: the whole reply in non-stream mode, one fragment per
/// line in stream mode. The final streamed object carries `done = true`.
#[derive(Clone, Debug, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub message: Option<WireMessage>,
    #[serde(default)]
    pub done: bool,
}

impl ChatChunk {
    pub fn content(&self) -> &str {
        self.message.as_ref().map_or("", |m| m.content.as_str())
    }
}

/// History oldest first, then the new message as the final user entry.
pub fn conversation(history: &[ChatMessage], new_message: &str) -> Vec<WireMessage> {
    history
        .iter()
        .map(WireMessage::from)
        .chain(std::iter::once(WireMessage {
            role: Role::User.as_str().to_string(),
            content: new_message.to_string(),
        }))
        .collect()
}
