use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Default system prompt sent with every completion request.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "Answer only the question that was asked. Do not add anything extra.";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub backend: BackendSettings,
    pub auth: AuthSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Reject values the server cannot start with.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.auth.jwt_secret.as_deref(), Some(secret) if !secret.is_empty()) {
            return Err(SettingsError::InvalidValue(
                "auth.jwtSecret must be set (or PARLEY_JWT_SECRET)".into(),
            ));
        }
        if self.backend.url.trim().is_empty() {
            return Err(SettingsError::InvalidValue("backend.url is empty".into()));
        }
        if self.server.max_turns_in_flight == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxTurnsInFlight must be at least 1".into(),
            ));
        }
        if self.server.max_send_queue == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxSendQueue must be at least 1".into(),
            ));
        }
        for (name, secs) in [
            ("server.heartbeatSecs", self.server.heartbeat_secs),
            ("server.requestTimeoutSecs", self.server.request_timeout_secs),
            ("backend.timeoutSecs", self.backend.timeout_secs),
        ] {
            if secs == 0 {
                return Err(SettingsError::InvalidValue(format!("{name} must be at least 1")));
            }
        }
        Ok(())
    }
}

/// HTTP/WebSocket listener and relay session limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Outbound envelopes buffered per connection before senders wait.
    pub max_send_queue: usize,
    /// Generation exchanges allowed in flight on one connection.
    pub max_turns_in_flight: usize,
    pub heartbeat_secs: u64,
    /// How long a closing session waits for its cancelled turns to wind down.
    pub shutdown_grace_secs: u64,
    /// Upper bound for plain HTTP requests (the WebSocket upgrade is exempt once upgraded).
    pub request_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            max_send_queue: 256,
            max_turns_in_flight: 4,
            heartbeat_secs: 30,
            shutdown_grace_secs: 5,
            request_timeout_secs: 120,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: crate::loader::parley_home().join("parley.db"),
        }
    }
}

/// Completion backend endpoint and the fixed generation parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendSettings {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    pub system_prompt: String,
    pub temperature: f64,
    pub top_p: f64,
    pub repeat_penalty: f64,
    pub timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            api_key: None,
            model: "model9".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: 0.2,
            top_p: 0.8,
            repeat_penalty: 1.15,
            timeout_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    pub token_ttl_hours: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            token_ttl_hours: 24 * 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level; `RUST_LOG` still wins when set.
    pub level: String,
    /// Per-target overrides, e.g. `{"tower_http": "debug"}`.
    pub modules: BTreeMap<String, String>,
    pub json: bool,
    /// Persist warn+ records to `log_db_path`.
    pub persist_warnings: bool,
    pub log_db_path: PathBuf,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            modules: BTreeMap::new(),
            json: true,
            persist_warnings: false,
            log_db_path: crate::loader::parley_home().join("logs.db"),
        }
    }
}
