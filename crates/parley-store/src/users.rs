use serde::Serialize;
use tracing::instrument;

use parley_core::ids::UserId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize)]
pub struct UserRow {
    pub id: UserId,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub name: String,
    pub created_at: String,
}

#[derive(Clone)]
pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a user. A duplicate email is a [`StoreError::Conflict`].
    #[instrument(skip(self, password_hash))]
    pub fn create(&self, email: &str, password_hash: &str, name: &str) -> Result<UserRow, StoreError> {
        self.db.with_conn(|conn| {
            let now = row_helpers::now();
            conn.execute(
                "INSERT INTO users (email, password_hash, name, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![email, password_hash, name, now],
            )
            .map_err(|e| match StoreError::from(e) {
                StoreError::Conflict(_) => StoreError::Conflict(format!("email {email} already registered")),
                other => other,
            })?;

            Ok(UserRow {
                id: UserId::new(conn.last_insert_rowid()),
                email: email.to_string(),
                password_hash: password_hash.to_string(),
                name: name.to_string(),
                created_at: now,
            })
        })
    }

    #[instrument(skip(self))]
    pub fn find_by_email(&self, email: &str) -> Result<Option<UserRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, email, password_hash, name, created_at FROM users WHERE email = ?1",
            )?;
            let mut rows = stmt.query([email])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_user(row)?)),
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self), fields(user_id = %id))]
    pub fn get(&self, id: UserId) -> Result<UserRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, email, password_hash, name, created_at FROM users WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.get()])?;
            match rows.next()? {
                Some(row) => row_to_user(row),
                None => Err(StoreError::NotFound(format!("user {id}"))),
            }
        })
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> Result<UserRow, StoreError> {
    Ok(UserRow {
        id: UserId::new(row_helpers::get(row, 0, "users", "id")?),
        email: row_helpers::get(row, 1, "users", "email")?,
        password_hash: row_helpers::get(row, 2, "users", "password_hash")?,
        name: row_helpers::get(row, 3, "users", "name")?,
        created_at: row_helpers::get(row, 4, "users", "created_at")?,
    })
}
