pub mod backend;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod messages;

pub use backend::{ChunkStream, CompletionBackend};
pub use envelope::{EnvelopeKind, InboundEnvelope, OutboundEnvelope, UserTurn};
pub use errors::{BackendError, ValidationError};
pub use ids::{ConnectionId, ConversationId, MessageId, TurnId, UserId};
pub use messages::{ChatMessage, Role};
