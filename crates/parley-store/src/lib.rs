pub mod conversations;
pub mod database;
pub mod error;
pub mod messages;
pub mod row_helpers;
pub mod schema;
pub mod storage;
pub mod users;

pub use conversations::{ConversationRepo, ConversationRow};
pub use database::Database;
pub use error::StoreError;
pub use messages::{MessageRepo, MessageRow, NewMessage};
pub use storage::{HistoryStore, Storage};
pub use users::{UserRepo, UserRow};
