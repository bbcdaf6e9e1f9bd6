use parley_core::ids::{ConversationId, UserId};

use crate::conversations::ConversationRepo;
use crate::database::Database;
use crate::error::StoreError;
use crate::messages::{MessageRepo, MessageRow, NewMessage};
use crate::users::UserRepo;

/// The persistence the relay and the synchronous handler need: ownership
/// checks, ordered history, and message creation.
pub trait HistoryStore: Send + Sync {
    fn owns_conversation(&self, user: UserId, conversation: ConversationId) -> Result<bool, StoreError>;

    /// Oldest first.
    fn list_by_conversation(&self, conversation: ConversationId) -> Result<Vec<MessageRow>, StoreError>;

    fn create(&self, message: NewMessage) -> Result<MessageRow, StoreError>;
}

/// All repositories over one [`Database`]. Built once at startup and shared.
#[derive(Clone)]
pub struct Storage {
    pub users: UserRepo,
    pub conversations: ConversationRepo,
    pub messages: MessageRepo,
}

impl Storage {
    pub fn new(db: Database) -> Self {
        Self {
            users: UserRepo::new(db.clone()),
            conversations: ConversationRepo::new(db.clone()),
            messages: MessageRepo::new(db),
        }
    }
}

impl HistoryStore for Storage {
    fn owns_conversation(&self, user: UserId, conversation: ConversationId) -> Result<bool, StoreError> {
        Ok(self.conversations.get_owned(conversation, user)?.is_some())
    }

    fn list_by_conversation(&self, conversation: ConversationId) -> Result<Vec<MessageRow>, StoreError> {
        self.messages.list_by_conversation(conversation)
    }

    fn create(&self, message: NewMessage) -> Result<MessageRow, StoreError> {
        self.messages.create(&message)
    }
}
