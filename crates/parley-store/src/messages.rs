use serde::Serialize;
use tracing::instrument;

use parley_core::ids::{ConversationId, MessageId, UserId};
use parley_core::messages::{ChatMessage, Role};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A message about to be persisted.
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub role: Role,
    pub content: String,
}

impl NewMessage {
    pub fn user(conversation_id: ConversationId, user_id: UserId, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            user_id,
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(
        conversation_id: ConversationId,
        user_id: UserId,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id,
            user_id,
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub role: Role,
    pub content: String,
    pub created_at: String,
}

impl From<&MessageRow> for ChatMessage {
    fn from(row: &MessageRow) -> Self {
        ChatMessage::new(row.role, row.content.clone())
    }
}

#[derive(Clone)]
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a message and bump the owning conversation's `updated_at` in
    /// one transaction.
    #[instrument(skip(self, message), fields(conversation_id = %message.conversation_id, role = %message.role))]
    pub fn create(&self, message: &NewMessage) -> Result<MessageRow, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let now = row_helpers::now();
            tx.execute(
                "INSERT INTO messages (conversation_id, user_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    message.conversation_id.get(),
                    message.user_id.get(),
                    message.role.as_str(),
                    message.content,
                    now,
                ],
            )?;
            let id = MessageId::new(tx.last_insert_rowid());
            tx.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, message.conversation_id.get()],
            )?;
            tx.commit()?;

            Ok(MessageRow {
                id,
                conversation_id: message.conversation_id,
                user_id: message.user_id,
                role: message.role,
                content: message.content.clone(),
                created_at: now,
            })
        })
    }

    /// Canonical history order: oldest first, insertion order on ties.
    #[instrument(skip(self), fields(conversation_id = %conversation))]
    pub fn list_by_conversation(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, user_id, role, content, created_at
                 FROM messages WHERE conversation_id = ?1
                 ORDER BY created_at ASC, id ASC",
            )?;
            let mut rows = stmt.query([conversation.get()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    /// Returns false when no message authored under `user` matched.
    #[instrument(skip(self), fields(message_id = %id, user_id = %user))]
    pub fn delete(&self, id: MessageId, user: UserId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM messages WHERE id = ?1 AND user_id = ?2",
                [id.get(), user.get()],
            )?;
            Ok(changed > 0)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRow, StoreError> {
    let role: String = row_helpers::get(row, 3, "messages", "role")?;
    Ok(MessageRow {
        id: MessageId::new(row_helpers::get(row, 0, "messages", "id")?),
        conversation_id: ConversationId::new(row_helpers::get(row, 1, "messages", "conversation_id")?),
        user_id: UserId::new(row_helpers::get(row, 2, "messages", "user_id")?),
        role: row_helpers::parse_enum(&role, "messages", "role")?,
        content: row_helpers::get(row, 4, "messages", "content")?,
        created_at: row_helpers::get(row, 5, "messages", "created_at")?,
    })
}
