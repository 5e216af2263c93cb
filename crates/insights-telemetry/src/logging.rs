use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A log record persisted to SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub span_id: Option<String>,
    pub run_id: Option<String>,
    pub thread_id: Option<String>,
    pub trace_id: Option<String>,
}

/// Query parameters for searching persisted logs.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub run_id: Option<String>,
    pub thread_id: Option<String>,
    pub trace_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite sink for persisted log events.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 span_id TEXT,
                 run_id TEXT,
                 thread_id TEXT,
                 trace_id TEXT,
                 created_at TEXT NOT NULL DEFAULT (datetime('now'))
             );
             CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
             CREATE INDEX IF NOT EXISTS idx_logs_run ON logs(run_id);
             CREATE INDEX IF NOT EXISTS idx_logs_trace ON logs(trace_id);
             CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogInsert) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, span_id, run_id, thread_id, trace_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.span_id,
                record.ids.run_id,
                record.ids.thread_id,
                record.ids.trace_id,
            ],
        );
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, span_id, run_id, thread_id, trace_id FROM logs WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(level) = &q.level {
            sql.push_str(&format!(" AND level = ?{}", params.len() + 1));
            params.push(Box::new(level.clone()));
        }
        if let Some(target) = &q.target {
            sql.push_str(&format!(" AND target LIKE ?{}", params.len() + 1));
            params.push(Box::new(format!("%{target}%")));
        }
        for (column, value) in [
            ("run_id", &q.run_id),
            ("thread_id", &q.thread_id),
            ("trace_id", &q.trace_id),
        ] {
            if let Some(value) = value {
                sql.push_str(&format!(" AND {column} = ?{}", params.len() + 1));
                params.push(Box::new(value.clone()));
            }
        }
        if let Some(since) = &q.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(since.clone()));
        }

        sql.push_str(" ORDER BY id DESC");

        let limit = q.limit.unwrap_or(100);
        sql.push_str(&format!(" LIMIT {limit}"));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                span_id: row.get(6)?,
                run_id: row.get(7)?,
                thread_id: row.get(8)?,
                trace_id: row.get(9)?,
            })
        })?;

        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

/// Correlation ids carried by events or inherited from enclosing spans.
#[derive(Clone, Debug, Default)]
struct CorrelationIds {
    run_id: Option<String>,
    thread_id: Option<String>,
    trace_id: Option<String>,
}

impl CorrelationIds {
    fn is_empty(&self) -> bool {
        self.run_id.is_none() && self.thread_id.is_none() && self.trace_id.is_none()
    }

    fn is_complete(&self) -> bool {
        self.run_id.is_some() && self.thread_id.is_some() && self.trace_id.is_some()
    }

    /// Fill gaps from an outer scope; inner values win.
    fn inherit(&mut self, outer: &CorrelationIds) {
        if self.run_id.is_none() {
            self.run_id.clone_from(&outer.run_id);
        }
        if self.thread_id.is_none() {
            self.thread_id.clone_from(&outer.thread_id);
        }
        if self.trace_id.is_none() {
            self.trace_id.clone_from(&outer.trace_id);
        }
    }

    fn set(&mut self, name: &str, value: String) -> bool {
        let slot = match name {
            "run_id" => &mut self.run_id,
            "thread_id" => &mut self.thread_id,
            "trace_id" => &mut self.trace_id,
            _ => return false,
        };
        *slot = Some(value);
        true
    }
}

struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    span_id: Option<String>,
    ids: CorrelationIds,
}

/// tracing Layer that writes events at or above a threshold to SQLite.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
    threshold: Level,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>, threshold: Level) -> Self {
        Self { sink, threshold }
    }
}

/// Visitor that extracts fields from a tracing event or span.
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    ids: CorrelationIds,
}

impl FieldVisitor {
    fn new() -> Self {
        Self {
            message: None,
            fields: serde_json::Map::new(),
            ids: CorrelationIds::default(),
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{:?}", value);
        match field.name() {
            "message" => self.message = Some(val),
            name => {
                let trimmed = val.trim_matches('"').to_string();
                if !self.ids.set(name, trimmed) {
                    self.fields
                        .insert(name.to_string(), serde_json::Value::String(val));
                }
            }
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            name => {
                if !self.ids.set(name, value.to_string()) {
                    self.fields
                        .insert(name.to_string(), serde_json::Value::String(value.to_string()));
                }
            }
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        // Level ordering: ERROR < WARN < INFO < DEBUG < TRACE
        let level = *event.metadata().level();
        if level > self.threshold {
            return;
        }

        let mut visitor = FieldVisitor::new();
        event.record(&mut visitor);

        if !visitor.ids.is_complete() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    let extensions = span.extensions();
                    if let Some(ids) = extensions.get::<CorrelationIds>() {
                        visitor.ids.inherit(ids);
                    }
                }
            }
        }

        let span_id = ctx
            .event_scope(event)
            .and_then(|mut scope| scope.next())
            .map(|span| format!("{:?}", span.id()));

        let fields_json = if visitor.fields.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&visitor.fields).unwrap_or_default())
        };

        let record = LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: fields_json,
            span_id,
            ids: visitor.ids,
        };

        self.sink.insert(&record);
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::new();
        attrs.record(&mut visitor);
        if !visitor.ids.is_empty() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(visitor.ids);
            }
        }
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        // Fields declared Empty and filled in later (e.g. run_id once the run starts).
        let mut visitor = FieldVisitor::new();
        values.record(&mut visitor);
        if visitor.ids.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            let mut extensions = span.extensions_mut();
            if let Some(existing) = extensions.get_mut::<CorrelationIds>() {
                let mut merged = visitor.ids;
                merged.inherit(existing);
                *existing = merged;
            } else {
                extensions.insert(visitor.ids);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn entry(level: &str, target: &str, message: &str) -> LogInsert {
        LogInsert {
            timestamp: "2026-02-14T12:00:00Z".into(),
            level: level.into(),
            target: target.into(),
            message: message.into(),
            fields: None,
            span_id: None,
            ids: CorrelationIds::default(),
        }
    }

    #[test]
    fn sink_insert_and_count() {
        let sink = SqliteLogSink::in_memory().unwrap();
        sink.insert(&entry("WARN", "insights_engine::driver", "cancel failed"));
        assert_eq!(sink.count().unwrap(), 1);
    }

    #[test]
    fn sink_on_disk() {
        let dir = std::env::temp_dir().join(format!("insights-logs-{}", uuid::Uuid::now_v7()));
        let sink = SqliteLogSink::new(&dir.join("logs.db")).unwrap();
        sink.insert(&entry("INFO", "t", "m"));
        assert_eq!(sink.count().unwrap(), 1);
    }

    #[test]
    fn query_by_level_and_target() {
        let sink = SqliteLogSink::in_memory().unwrap();
        sink.insert(&entry("WARN", "insights_llm::azure", "rate limited"));
        sink.insert(&entry("ERROR", "insights_engine::driver", "run failed"));

        let errors = sink
            .query(&LogQuery {
                level: Some("ERROR".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "run failed");

        let azure = sink
            .query(&LogQuery {
                target: Some("azure".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(azure.len(), 1);
        assert_eq!(azure[0].message, "rate limited");
    }

    #[test]
    fn query_by_run_and_limit() {
        let sink = SqliteLogSink::in_memory().unwrap();
        for i in 0..10 {
            let mut record = entry("INFO", "t", &format!("msg {i}"));
            record.timestamp = format!("2026-02-14T12:00:{i:02}Z");
            let run = if i % 2 == 0 { "run_a" } else { "run_b" };
            record.ids.run_id = Some(run.to_string());
            sink.insert(&record);
        }

        let results = sink
            .query(&LogQuery {
                run_id: Some("run_a".into()),
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 2);
        // Most recent first (ORDER BY id DESC)
        assert_eq!(results[0].message, "msg 8");

        let since = sink
            .query(&LogQuery {
                since: Some("2026-02-14T12:00:07Z".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(since.len(), 3);
    }

    #[test]
    fn layer_persists_ids_from_spans() {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry()
            .with(SqliteLogLayer::new(sink.clone(), Level::INFO));

        tracing::subscriber::with_default(subscriber, || {
            let outer = tracing::info_span!("trace_context", trace_id = "abc123");
            let _outer = outer.enter();
            let run = tracing::info_span!(
                "run",
                thread_id = "thread_1",
                run_id = tracing::field::Empty
            );
            let _run = run.enter();
            run.record("run_id", "run_9");
            tracing::info!(tokens = 42u64, "run completed");
            tracing::debug!("below threshold");
        });

        assert_eq!(sink.count().unwrap(), 1);
        let records = sink
            .query(&LogQuery {
                trace_id: Some("abc123".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.message, "run completed");
        assert_eq!(record.run_id.as_deref(), Some("run_9"));
        assert_eq!(record.thread_id.as_deref(), Some("thread_1"));
        assert!(record.fields.as_deref().unwrap().contains("42"));
    }

    #[test]
    fn visitor_routes_correlation_fields() {
        let mut visitor = FieldVisitor::new();
        assert!(visitor.ids.set("run_id", "run_1".into()));
        assert!(!visitor.ids.set("question", "q".into()));
        assert_eq!(visitor.ids.run_id.as_deref(), Some("run_1"));
        assert!(visitor.fields.is_empty());
        visitor.message = Some("m".into());
        assert_eq!(visitor.message.as_deref(), Some("m"));
    }
}
