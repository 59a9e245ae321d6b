//! Tracing setup and an in-memory tail of recent log events.
//!
//! This module provides:
//! - `init`: installs the global subscriber (env filter, fmt output, log tail)
//! - `LogBuffer`: a bounded ring of recent `LogEntry` values
//! - `LogTailLayer`: a tracing Layer that feeds the global `LogBuffer`
//! - `redact_token`: the only form in which auth tokens may reach a log line

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

static LOG_BUFFER: OnceLock<Arc<RwLock<LogBuffer>>> = OnceLock::new();

const DEFAULT_BUFFER_CAPACITY: usize = 500;

const CRATE_TARGET: &str = "printer_cloud_link";

/// A captured log event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub message: String,
    pub component: Option<String>,
    pub source: String,
}

impl LogEntry {
    pub fn new(level: &str, message: String, component: Option<String>, source: String) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            message,
            component,
            source,
        }
    }
}

/// Fixed-capacity ring of log entries, oldest evicted first.
#[derive(Debug)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// All entries, oldest first.
    pub fn get_all(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

pub fn get_log_buffer() -> Arc<RwLock<LogBuffer>> {
    LOG_BUFFER
        .get_or_init(|| Arc::new(RwLock::new(LogBuffer::default())))
        .clone()
}

/// Buffered log entries, oldest first.
pub fn recent_logs() -> Vec<LogEntry> {
    get_log_buffer().read().get_all()
}

/// Keep at most the first four characters of a token.
pub fn redact_token(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("{}…", prefix)
}

/// Install the global subscriber. `RUST_LOG` takes precedence over
/// `default_filter`. Calling this twice is harmless; the second call is a no-op.
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(LogTailLayer::new())
        .try_init();
}

/// Extracts the message and `component` field; other fields are appended to
/// the message as `name=value`.
struct LogVisitor {
    message: String,
    component: Option<String>,
}

impl LogVisitor {
    fn new() -> Self {
        Self {
            message: String::new(),
            component: None,
        }
    }

    fn set_message(&mut self, message: String) {
        if self.message.is_empty() {
            self.message = message;
        } else {
            self.message = format!("{}; {}", message, self.message);
        }
    }

    fn append(&mut self, name: &str, value: impl std::fmt::Display) {
        if !self.message.is_empty() {
            self.message.push_str("; ");
        }
        self.message.push_str(&format!("{}={}", name, value));
    }
}

impl Visit for LogVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.set_message(value.to_string()),
            "component" => self.component = Some(value.to_string()),
            name => self.append(name, value),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => self.set_message(format!("{:?}", value)),
            "component" => self.component = Some(format!("{:?}", value)),
            name => self.append(name, format!("{:?}", value)),
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.append(field.name(), value);
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.append(field.name(), value);
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.append(field.name(), value);
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.append(field.name(), value);
    }
}

fn source_of(target: &str) -> &str {
    match target.strip_prefix(CRATE_TARGET) {
        Some(rest) => rest
            .strip_prefix("::")
            .and_then(|module| module.split("::").next())
            .unwrap_or("link"),
        None => target.split("::").next().unwrap_or("system"),
    }
}

/// Copies every event into the global [`LogBuffer`].
pub struct LogTailLayer;

impl LogTailLayer {
    pub fn new() -> Self {
        let _ = get_log_buffer();
        Self
    }
}

impl Default for LogTailLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for LogTailLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LogVisitor::new();
        event.record(&mut visitor);

        let level = match *event.metadata().level() {
            Level::ERROR => "error",
            Level::WARN => "warn",
            Level::INFO => "info",
            Level::DEBUG => "debug",
            Level::TRACE => "trace",
        };
        let source = source_of(event.metadata().target());

        let entry = LogEntry::new(level, visitor.message, visitor.component, source.to_string());
        get_log_buffer().write().push(entry);
    }
}
