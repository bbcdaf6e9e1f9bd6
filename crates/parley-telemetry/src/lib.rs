mod logging;

pub use logging::{LogQuery, LogRecord, WarnLogLayer, WarnLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by `RUST_LOG`.
    pub level: String,
    /// Per-module level overrides (e.g. `("parley_llm", "debug")`).
    pub module_levels: Vec<(String, String)>,
    /// JSON lines on stdout instead of human-readable output.
    pub json: bool,
    /// Persist warn+ events to SQLite.
    pub persist_warnings: bool,
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            module_levels: Vec::new(),
            json: true,
            persist_warnings: false,
            log_db_path: std::env::temp_dir().join("parley-logs.db"),
        }
    }
}

/// Keeps the warn+ sink alive for the lifetime of the process.
pub struct TelemetryGuard {
    log_sink: Option<Arc<WarnLogSink>>,
}

impl TelemetryGuard {
    /// Access the sink for querying persisted warnings.
    pub fn logs(&self) -> Option<&WarnLogSink> {
        self.log_sink.as_deref()
    }
}

/// Build the `EnvFilter` directive string from config.
pub fn filter_directives(config: &TelemetryConfig) -> String {
    let mut directives = config.level.to_lowercase();
    for (module, level) in &config.module_levels {
        directives.push_str(&format!(",{}={}", module, level.to_lowercase()));
    }
    directives
}

/// Initialize the tracing subscriber. Call once at startup; later calls leave
/// the first subscriber in place.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryGuard {
    let directives = filter_directives(config);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    let (sqlite_layer, log_sink) = if config.persist_warnings {
        match WarnLogSink::open(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(WarnLogLayer::new(Arc::clone(&sink))), Some(sink))
            }
            Err(e) => {
                eprintln!("parley-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .try_init()
    {
        eprintln!("parley-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard { log_sink }
}
