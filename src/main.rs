//! # parley
//!
//! Conversational relay server binary: loads settings, wires the store,
//! the completion backend and the HTTP/WebSocket server together.

#![deny(unsafe_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use secrecy::SecretString;

use parley_core::backend::CompletionBackend;
use parley_llm::{OllamaClient, OllamaConfig};
use parley_server::{AppState, AuthState, RelayConfig, ServerConfig};
use parley_settings::Settings;
use parley_store::{Database, Storage};
use parley_telemetry::{LogQuery, TelemetryConfig, WarnLogSink};

/// Conversational relay server.
#[derive(Parser, Debug)]
#[command(name = "parley", about = "Streaming chat relay in front of an Ollama-compatible backend")]
struct Cli {
    /// Settings file (defaults to `~/.parley/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to bind (0 for auto-assign). Overrides settings.
    #[arg(long)]
    port: Option<u16>,

    /// Path to the SQLite database. Overrides settings.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Print the newest N persisted warnings as JSON lines and exit.
    #[arg(long, value_name = "N")]
    recent_warnings: Option<u32>,
}

impl Cli {
    fn load_settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => parley_settings::load_settings_from_path(path)
                .with_context(|| format!("failed to load settings from {}", path.display()))?,
            None => parley_settings::load_settings().context("failed to load settings")?,
        };
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(db) = &self.db {
            settings.database.path = db.clone();
        }
        Ok(settings)
    }
}

/// Write the newest `limit` warn+ records, newest first. Returns how many
/// were written.
fn dump_warnings(path: &Path, limit: u32, out: &mut impl Write) -> Result<usize> {
    let sink = WarnLogSink::open(path)
        .with_context(|| format!("failed to open log database {}", path.display()))?;
    let records = sink.query(&LogQuery {
        limit: Some(limit),
        ..Default::default()
    })?;
    for record in &records {
        writeln!(out, "{}", serde_json::to_string(record)?)?;
    }
    Ok(records.len())
}

fn telemetry_config(settings: &Settings) -> TelemetryConfig {
    TelemetryConfig {
        level: settings.logging.level.clone(),
        module_levels: settings
            .logging
            .modules
            .iter()
            .map(|(module, level)| (module.clone(), level.clone()))
            .collect(),
        json: settings.logging.json,
        persist_warnings: settings.logging.persist_warnings,
        log_db_path: settings.logging.log_db_path.clone(),
    }
}

fn backend_config(settings: &Settings) -> OllamaConfig {
    let b = &settings.backend;
    OllamaConfig {
        base_url: b.url.clone(),
        api_key: b.api_key.clone().map(SecretString::from),
        model: b.model.clone(),
        system_prompt: b.system_prompt.clone(),
        temperature: b.temperature,
        top_p: b.top_p,
        repeat_penalty: b.repeat_penalty,
        timeout: Duration::from_secs(b.timeout_secs),
    }
}

fn server_config(settings: &Settings) -> ServerConfig {
    let s = &settings.server;
    ServerConfig {
        host: s.host.clone(),
        port: s.port,
        request_timeout: Duration::from_secs(s.request_timeout_secs),
        relay: RelayConfig {
            max_send_queue: s.max_send_queue,
            max_turns_in_flight: s.max_turns_in_flight,
            heartbeat: Duration::from_secs(s.heartbeat_secs),
            shutdown_grace: Duration::from_secs(s.shutdown_grace_secs),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;
    if let Some(limit) = cli.recent_warnings {
        dump_warnings(&settings.logging.log_db_path, limit, &mut std::io::stdout().lock())?;
        return Ok(());
    }
    settings.validate().context("invalid settings")?;

    let telemetry = parley_telemetry::init_telemetry(&telemetry_config(&settings));
    if let Some(logs) = telemetry.logs() {
        match logs.count() {
            Ok(stored) => tracing::info!(stored, "persisting warnings"),
            Err(e) => tracing::warn!(error = %e, "log database unreadable"),
        }
    }

    let db = Database::open(&settings.database.path).with_context(|| {
        format!("failed to open database at {}", settings.database.path.display())
    })?;
    let storage = Storage::new(db);

    let backend = OllamaClient::new(backend_config(&settings)).context("failed to build backend client")?;
    tracing::info!(
        endpoint = backend.endpoint(),
        model = backend.model(),
        "completion backend configured"
    );

    let secret = settings
        .auth
        .jwt_secret
        .clone()
        .map(SecretString::from)
        .context("auth.jwtSecret is not set")?;
    let auth = AuthState::new(&secret, settings.auth.token_ttl_hours);

    let config = server_config(&settings);
    let state = AppState::new(storage, Arc::new(backend), auth, config.relay.clone());
    let handle = parley_server::start(config, state)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "parley ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
