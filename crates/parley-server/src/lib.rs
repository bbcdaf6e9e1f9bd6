pub mod accounts;
pub mod admin;
pub mod auth;
pub mod chat;
pub mod error;
pub mod exchange;
pub mod relay;
pub mod server;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{AuthError, AuthState, CurrentUser};
pub use error::ApiError;
pub use exchange::{ExchangeOutcome, GenerationExchange, TurnTracker};
pub use relay::{Outbox, RelayConfig};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
