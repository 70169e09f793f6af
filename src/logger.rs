//! Structured log entries for partition maintenance
//!
//! Partition drift is reported, not raised, so operators find out about it from logs.
//! Entries carry a message plus free-form key/value context and are written as one
//! JSON object per line.

use serde_json::{Map, Value};
use std::fmt;

pub const LOG_TARGET: &str = "lifeguard_partitioning";

/// A log message with key/value context
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub message: String,
    pub fields: Map<String, Value>,
}

impl LogEntry {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fields: Map::new(),
        }
    }

    /// Attach a context field
    #[must_use]
    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// The entry as a single JSON object, `message` first
    pub fn to_json(&self) -> Value {
        let mut object = Map::with_capacity(self.fields.len() + 1);
        object.insert("message".to_string(), Value::String(self.message.clone()));
        for (key, value) in &self.fields {
            object.insert(key.clone(), value.clone());
        }
        Value::Object(object)
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// Sink for structured partitioning log entries
pub trait PartitionLogger {
    fn info(&self, entry: LogEntry);
    fn warn(&self, entry: LogEntry);
    fn error(&self, entry: LogEntry);
}

/// Writes entries through the `log` facade as JSON lines
#[derive(Debug, Default, Clone, Copy)]
pub struct AppLogger;

impl PartitionLogger for AppLogger {
    fn info(&self, entry: LogEntry) {
        log::info!(target: LOG_TARGET, "{entry}");
    }

    fn warn(&self, entry: LogEntry) {
        log::warn!(target: LOG_TARGET, "{entry}");
    }

    fn error(&self, entry: LogEntry) {
        log::error!(target: LOG_TARGET, "{entry}");
    }
}
