mod logging;
mod trace;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};
pub use trace::{TraceContext, TraceParseError, TRACEPARENT};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "insights_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stderr instead of the human-readable format.
    pub json: bool,
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
    /// Events at or above this level are persisted to SQLite.
    pub persist_level: Level,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
            log_to_sqlite: false,
            log_db_path: data_dir().join("logs.db"),
            persist_level: Level::INFO,
        }
    }
}

impl TelemetryConfig {
    /// Directive string handed to `EnvFilter` when RUST_LOG is unset.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Keeps the log sink alive for the lifetime of the process.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    /// Access the log sink for querying persisted logs.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// Initialize the telemetry subsystem. Call once at startup; later calls
/// leave the first subscriber in place.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed()
    };

    let (sqlite_layer, sqlite_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                let layer = SqliteLogLayer::new(sink.clone(), config.persist_level);
                (Some(layer), Some(sink))
            }
            Err(e) => {
                eprintln!("insights-telemetry: failed to open log DB: {e}");
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
        eprintln!("insights-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard {
        log_sink: sqlite_sink,
    }
}

/// Fallback home dir for default paths.
fn data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".insights")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_is_level_only() {
        let config = TelemetryConfig::default();
        assert_eq!(config.filter_directives(), "info");
        assert!(!config.log_to_sqlite);
        assert!(config.log_db_path.ends_with(".insights/logs.db"));
    }

    #[test]
    fn module_overrides_appended() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![
                ("insights_engine".into(), Level::DEBUG),
                ("insights_llm".into(), Level::TRACE),
            ],
            ..Default::default()
        };
        assert_eq!(
            config.filter_directives(),
            "warn,insights_engine=debug,insights_llm=trace"
        );
    }
}
