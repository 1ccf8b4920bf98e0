// Logging module - structured NDJSON event log on standard output
//
// The sidecar's machine-readable log is one JSON object per line, which makes
// it easy to stream-process, grep, or feed to jq. Each record carries a
// millisecond RFC-3339 timestamp, a level, an event name, and event-specific
// fields. Diagnostic logging (tracing) goes to stderr and is separate from
// this stream.

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::io::Write;
use std::sync::Mutex;

/// Log level for event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

/// Writes newline-delimited JSON events.
///
/// The sink is behind a mutex so each record is emitted as a single `write`
/// call with its trailing newline; concurrent requests never interleave
/// partial lines. Write failures are swallowed - logging must never take
/// down the request path.
pub struct EventLogger {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl EventLogger {
    /// Logger writing to standard output (the normal mode).
    pub fn stdout() -> Self {
        Self::with_sink(Box::new(std::io::stdout()))
    }

    /// Logger writing to an arbitrary sink. Used by tests to capture output.
    pub fn with_sink(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    /// Emit one event record. `None` field values are omitted from the output.
    pub fn emit(&self, level: Level, event: &str, fields: Vec<(&str, Option<Value>)>) {
        let mut record = Map::new();
        record.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        record.insert("level".to_string(), Value::String(level.as_str().to_string()));
        record.insert("event".to_string(), Value::String(event.to_string()));
        for (key, value) in fields {
            if let Some(value) = value {
                record.insert(key.to_string(), value);
            }
        }

        let mut line = match serde_json::to_vec(&Value::Object(record)) {
            Ok(line) => line,
            Err(_) => return,
        };
        line.push(b'\n');

        let Ok(mut sink) = self.sink.lock() else {
            return;
        };
        let _ = sink.write_all(&line);
        let _ = sink.flush();
    }

    pub fn info(&self, event: &str, fields: Vec<(&str, Option<Value>)>) {
        self.emit(Level::Info, event, fields);
    }

    pub fn warn(&self, event: &str, fields: Vec<(&str, Option<Value>)>) {
        self.emit(Level::Warn, event, fields);
    }

    pub fn error(&self, event: &str, fields: Vec<(&str, Option<Value>)>) {
        self.emit(Level::Error, event, fields);
    }
}

/// Build the field list for [`EventLogger::emit`] with less punctuation at
/// the call sites. Values are anything `serde_json::json!` accepts; for a
/// field that may be absent, build the `(key, Option<Value>)` pair by hand.
#[macro_export]
macro_rules! log_fields {
    ($($key:literal => $value:expr),* $(,)?) => {
        vec![$(($key, Some(serde_json::json!($value)))),*]
    };
}
