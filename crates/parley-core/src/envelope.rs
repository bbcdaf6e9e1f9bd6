//! JSON frames exchanged over the relay connection.
//!
//! Inbound frames are internally tagged by `type`; only `user_message` is
//! understood and any other tag decodes to [`InboundEnvelope::Unknown`].
//! Outbound frames are flat `{type, content, role}` objects with optional
//! `conversation_id` and `turn_id` fields. Turns on the same conversation
//! share a `conversation_id`, so interleaved replies are told apart by
//! `turn_id`.

use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;
use crate::ids::{ConversationId, TurnId};
use crate::messages::Role;

/// Content of the typing indicator frame.
pub const TYPING_CONTENT: &str = "thinking...";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEnvelope {
    UserMessage {
        #[serde(default)]
        conversation_id: Option<ConversationId>,
        #[serde(default)]
        content: String,
    },
    #[serde(other)]
    Unknown,
}

impl InboundEnvelope {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// A validated user message: a real conversation and non-empty content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserTurn {
    pub conversation_id: ConversationId,
    pub content: String,
}

impl UserTurn {
    pub fn new(
        conversation_id: Option<ConversationId>,
        content: String,
    ) -> Result<Self, ValidationError> {
        match conversation_id {
            Some(id) if id.is_valid() && !content.is_empty() => Ok(Self {
                conversation_id: id,
                content,
            }),
            _ => Err(ValidationError::MissingFields),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    #[serde(rename = "user_message")]
    UserMessageEcho,
    #[serde(rename = "typing")]
    TypingIndicator,
    AssistantChunk,
    AssistantComplete,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub content: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<TurnId>,
}

impl OutboundEnvelope {
    fn new(
        kind: EnvelopeKind,
        role: Role,
        conversation_id: Option<ConversationId>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            content: content.into(),
            role,
            conversation_id,
            turn_id: None,
        }
    }

    /// Tag the frame with the turn that produced it.
    pub fn for_turn(mut self, turn: &TurnId) -> Self {
        self.turn_id = Some(turn.clone());
        self
    }

    pub fn echo(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::UserMessageEcho, Role::User, Some(conversation_id), content)
    }

    pub fn typing(conversation_id: ConversationId) -> Self {
        Self::new(
            EnvelopeKind::TypingIndicator,
            Role::Assistant,
            Some(conversation_id),
            TYPING_CONTENT,
        )
    }

    pub fn chunk(conversation_id: ConversationId, text: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::AssistantChunk, Role::Assistant, Some(conversation_id), text)
    }

    pub fn complete(conversation_id: ConversationId, text: impl Into<String>) -> Self {
        Self::new(
            EnvelopeKind::AssistantComplete,
            Role::Assistant,
            Some(conversation_id),
            text,
        )
    }

    pub fn error(conversation_id: Option<ConversationId>, message: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Error, Role::System, conversation_id, message)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_user_message() {
        let env = InboundEnvelope::parse(
            r#"{"type":"user_message","conversation_id":42,"content":"hi","role":"user"}"#,
        )
        .unwrap();
        assert_eq!(
            env,
            InboundEnvelope::UserMessage {
                conversation_id: Some(ConversationId::new(42)),
                content: "hi".into(),
            }
        );
    }

    #[test]
    fn missing_fields_default() {
        let env = InboundEnvelope::parse(r#"{"type":"user_message"}"#).unwrap();
        assert_eq!(
            env,
            InboundEnvelope::UserMessage {
                conversation_id: None,
                content: String::new(),
            }
        );
    }

    #[test]
    fn unknown_tag_is_tolerated() {
        let env = InboundEnvelope::parse(r#"{"type":"presence","status":"away"}"#).unwrap();
        assert_eq!(env, InboundEnvelope::Unknown);
    }

    #[test]
    fn malformed_frames_fail() {
        assert!(InboundEnvelope::parse("not json").is_err());
        assert!(InboundEnvelope::parse(r#"{"content":"no tag"}"#).is_err());
        assert!(
            InboundEnvelope::parse(r#"{"type":"user_message","conversation_id":"x"}"#).is_err()
        );
    }

    #[test]
    fn turn_validation() {
        assert!(UserTurn::new(Some(ConversationId::new(42)), "hi".into()).is_ok());
        assert_eq!(
            UserTurn::new(Some(ConversationId::new(0)), "hi".into()),
            Err(ValidationError::MissingFields)
        );
        assert_eq!(
            UserTurn::new(None, "hi".into()),
            Err(ValidationError::MissingFields)
        );
        assert_eq!(
            UserTurn::new(Some(ConversationId::new(42)), String::new()),
            Err(ValidationError::MissingFields)
        );
    }

    #[test]
    fn outbound_wire_shape() {
        let id = ConversationId::new(42);
        let cases = [
            (OutboundEnvelope::echo(id, "hi"), "user_message", "user"),
            (OutboundEnvelope::typing(id), "typing", "assistant"),
            (OutboundEnvelope::chunk(id, "He"), "assistant_chunk", "assistant"),
            (OutboundEnvelope::complete(id, "Hello"), "assistant_complete", "assistant"),
            (OutboundEnvelope::error(Some(id), "oops"), "error", "system"),
        ];
        for (env, kind, role) in cases {
            let value: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
            assert_eq!(value["type"], kind);
            assert_eq!(value["role"], role);
            assert_eq!(value["conversation_id"], 42);
            assert!(value.get("turn_id").is_none());
        }
    }

    #[test]
    fn turn_tag_is_serialized() {
        let turn = TurnId::new();
        let env = OutboundEnvelope::chunk(ConversationId::new(42), "He").for_turn(&turn);
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["turn_id"], turn.as_str());

        let back: OutboundEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(back.turn_id, Some(turn));
    }

    #[test]
    fn error_without_conversation_omits_field() {
        let value = serde_json::to_value(OutboundEnvelope::error(None, "bad")).unwrap();
        assert_eq!(
            value,
            json!({"type": "error", "content": "bad", "role": "system"})
        );
    }
}
