use serde::Serialize;
use tracing::instrument;

use parley_core::ids::{ConversationId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConversationRow {
    pub id: ConversationId,
    pub user_id: UserId,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Conversation administration. Every mutation carries the acting user in
/// its predicate, so a row owned by someone else behaves as missing.
#[derive(Clone)]
pub struct ConversationRepo {
    db: Database,
}

const COLUMNS: &str = "id, user_id, title, created_at, updated_at";

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(user_id = %user))]
    pub fn create(&self, user: UserId, title: &str) -> Result<ConversationRow, StoreError> {
        self.db.with_conn(|conn| {
            let now = row_helpers::now();
            conn.execute(
                "INSERT INTO conversations (user_id, title, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                rusqlite::params![user.get(), title, now],
            )?;

            Ok(ConversationRow {
                id: ConversationId::new(conn.last_insert_rowid()),
                user_id: user,
                title: title.to_string(),
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Most recently updated first.
    #[instrument(skip(self), fields(user_id = %user))]
    pub fn list_by_user(&self, user: UserId) -> Result<Vec<ConversationRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM conversations WHERE user_id = ?1
                 ORDER BY updated_at DESC, id DESC"
            ))?;
            let mut rows = stmt.query([user.get()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_conversation(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id, user_id = %user))]
    pub fn get_owned(
        &self,
        id: ConversationId,
        user: UserId,
    ) -> Result<Option<ConversationRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM conversations WHERE id = ?1 AND user_id = ?2"
            ))?;
            let mut rows = stmt.query([id.get(), user.get()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_conversation(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Returns false when no row owned by `user` matched.
    #[instrument(skip(self), fields(conversation_id = %id, user_id = %user))]
    pub fn delete(&self, id: ConversationId, user: UserId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM conversations WHERE id = ?1 AND user_id = ?2",
                [id.get(), user.get()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Returns false when no row owned by `user` matched.
    #[instrument(skip(self), fields(conversation_id = %id, user_id = %user))]
    pub fn rename(&self, id: ConversationId, user: UserId, title: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3 AND user_id = ?4",
                rusqlite::params![title, row_helpers::now(), id.get(), user.get()],
            )?;
            Ok(changed > 0)
        })
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<ConversationRow, StoreError> {
    Ok(ConversationRow {
        id: ConversationId::new(row_helpers::get(row, 0, "conversations", "id")?),
        user_id: UserId::new(row_helpers::get(row, 1, "conversations", "user_id")?),
        title: row_helpers::get(row, 2, "conversations", "title")?,
        created_at: row_helpers::get(row, 3, "conversations", "created_at")?,
        updated_at: row_helpers::get(row, 4, "conversations", "updated_at")?,
    })
}
