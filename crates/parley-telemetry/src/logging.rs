use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const CREATE_LOGS: &str = "
CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL,
    target TEXT NOT NULL,
    message TEXT NOT NULL,
    fields TEXT,
    connection_id TEXT,
    conversation_id INTEGER
);
CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
CREATE INDEX IF NOT EXISTS idx_logs_conversation ON logs(conversation_id);
";

/// A warn+ log record persisted to SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub connection_id: Option<String>,
    pub conversation_id: Option<i64>,
}

#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub conversation_id: Option<i64>,
    pub limit: Option<u32>,
}

/// SQLite sink for warn+ events, so dropped writes and backend failures
/// can be audited after the fact.
pub struct WarnLogSink {
    conn: Mutex<Connection>,
}

impl WarnLogSink {
    pub fn open(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(CREATE_LOGS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogInsert) {
        let conn = self.conn.lock();
        // A failing log write has nowhere left to be reported.
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, connection_id, conversation_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.connection_id,
                record.conversation_id,
            ],
        );
    }

    /// Newest first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, level, target, message, fields, connection_id, conversation_id
             FROM logs
             WHERE (?1 IS NULL OR level = ?1) AND (?2 IS NULL OR conversation_id = ?2)
             ORDER BY id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![q.level, q.conversation_id, q.limit.unwrap_or(100)],
            |row| {
                Ok(LogRecord {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    level: row.get(2)?,
                    target: row.get(3)?,
                    message: row.get(4)?,
                    fields: row.get(5)?,
                    connection_id: row.get(6)?,
                    conversation_id: row.get(7)?,
                })
            },
        )?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    connection_id: Option<String>,
    conversation_id: Option<i64>,
}

/// tracing Layer that writes warn+ events to a [`WarnLogSink`].
pub struct WarnLogLayer {
    sink: Arc<WarnLogSink>,
}

impl WarnLogLayer {
    pub fn new(sink: Arc<WarnLogSink>) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    connection_id: Option<String>,
    conversation_id: Option<i64>,
}

impl FieldVisitor {
    /// Route a field into its dedicated slot, or into `fields`.
    fn put(&mut self, name: &str, value: serde_json::Value) {
        use serde_json::Value;
        match (name, value) {
            ("message", Value::String(s)) => self.message = Some(s),
            ("connection_id", Value::String(s)) => self.connection_id = Some(s),
            ("conversation_id", Value::Number(n)) => self.conversation_id = n.as_i64(),
            ("conversation_id", Value::String(s)) => self.conversation_id = s.parse().ok(),
            (name, value) => {
                let _ = self.fields.insert(name.to_owned(), value);
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        let rendered = match field.name() {
            "message" => rendered,
            _ => rendered.trim_matches('"').to_owned(),
        };
        self.put(field.name(), rendered.into());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field.name(), value.into());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field.name(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field.name(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field.name(), value.into());
    }
}

/// Stored on spans so child events inherit connection and conversation ids.
struct SpanFields {
    connection_id: Option<String>,
    conversation_id: Option<i64>,
}

impl<S> Layer<S> for WarnLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let scope = ctx.event_scope(event).into_iter().flatten();
        for span in scope {
            if visitor.connection_id.is_some() && visitor.conversation_id.is_some() {
                break;
            }
            if let Some(inherited) = span.extensions().get::<SpanFields>() {
                if visitor.connection_id.is_none() {
                    visitor.connection_id.clone_from(&inherited.connection_id);
                }
                visitor.conversation_id = visitor.conversation_id.or(inherited.conversation_id);
            }
        }

        let fields = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        self.sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            connection_id: visitor.connection_id,
            conversation_id: visitor.conversation_id,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        if visitor.connection_id.is_some() || visitor.conversation_id.is_some() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(SpanFields {
                    connection_id: visitor.connection_id,
                    conversation_id: visitor.conversation_id,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn capture<F: FnOnce()>(f: F) -> Arc<WarnLogSink> {
        let sink = Arc::new(WarnLogSink::in_memory().unwrap());
        let subscriber =
            tracing_subscriber::registry().with(WarnLogLayer::new(Arc::clone(&sink)));
        tracing::subscriber::with_default(subscriber, f);
        sink
    }

    #[test]
    fn info_events_are_not_persisted() {
        let sink = capture(|| {
            tracing::info!("connected");
            tracing::debug!("details");
        });
        assert_eq!(sink.count().unwrap(), 0);
    }

    #[test]
    fn warn_and_error_events_are_persisted() {
        let sink = capture(|| {
            tracing::warn!(conversation_id = 42_i64, error = "disk full", "failed to persist message");
            tracing::error!("backend unreachable");
        });
        assert_eq!(sink.count().unwrap(), 2);

        let warns = sink
            .query(&LogQuery {
                level: Some("WARN".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(warns.len(), 1);
        assert_eq!(warns[0].message, "failed to persist message");
        assert_eq!(warns[0].conversation_id, Some(42));
        assert!(warns[0].fields.as_deref().unwrap().contains("disk full"));
    }

    #[test]
    fn span_fields_propagate_to_events() {
        let sink = capture(|| {
            let span = tracing::info_span!("relay", connection_id = "conn_abc", conversation_id = 7_i64);
            let _enter = span.enter();
            tracing::warn!("send queue closed");
        });

        let records = sink
            .query(&LogQuery {
                conversation_id: Some(7),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].connection_id.as_deref(), Some("conn_abc"));
    }

    #[test]
    fn query_limit_returns_newest_first() {
        let sink = capture(|| {
            for i in 0..5 {
                tracing::warn!(attempt = i, "warning {i}");
            }
        });
        let records = sink
            .query(&LogQuery {
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, "warning 4");
    }

    #[test]
    fn file_sink_reopens() {
        let dir = std::env::temp_dir().join(format!("parley-logs-{}", uuid::Uuid::now_v7()));
        let path = dir.join("logs.db");
        {
            let sink = WarnLogSink::open(&path).unwrap();
            sink.insert(&LogInsert {
                timestamp: "2026-01-01T00:00:00Z".into(),
                level: "WARN".into(),
                target: "parley_server::relay".into(),
                message: "persist failed".into(),
                fields: None,
                connection_id: None,
                conversation_id: Some(1),
            });
        }
        let sink = WarnLogSink::open(&path).unwrap();
        assert_eq!(sink.count().unwrap(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
