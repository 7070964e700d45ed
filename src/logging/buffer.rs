//! In-memory log buffer.
//!
//! A ring buffer fed by a tracing layer. Clients read the tail of it through
//! the `get-logs` event.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::LazyLock;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Default capacity for the log ring buffer (number of entries)
pub const DEFAULT_BUFFER_CAPACITY: usize = 2000;

/// Maximum buffer capacity
pub const MAX_BUFFER_CAPACITY: usize = 10_000;

/// Global log buffer instance
pub static LOG_BUFFER: LazyLock<LogBuffer> = LazyLock::new(LogBuffer::new);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl LogLevel {
    pub fn from_tracing(level: &Level) -> Self {
        match *level {
            Level::TRACE => LogLevel::Trace,
            Level::DEBUG => LogLevel::Debug,
            Level::INFO => LogLevel::Info,
            Level::WARN => LogLevel::Warn,
            Level::ERROR => LogLevel::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// A captured log entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub target: String,
    pub message: String,
}

impl LogEntry {
    /// Single-line rendering, as written to a plaintext log file.
    pub fn render(&self) -> String {
        format!(
            "{} [{}] {}: {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.level,
            self.target,
            self.message
        )
    }
}

/// Thread-safe ring buffer for log entries
pub struct LogBuffer {
    inner: RwLock<LogBufferInner>,
}

struct LogBufferInner {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    next_seq: u64,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_BUFFER_CAPACITY);
        Self {
            inner: RwLock::new(LogBufferInner {
                entries: VecDeque::with_capacity(capacity),
                capacity,
                next_seq: 1,
            }),
        }
    }

    /// Push a log entry, assigning a sequence number
    pub fn push_with_seq(&self, level: LogLevel, target: String, message: String) -> u64 {
        let mut inner = self.inner.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        if inner.entries.len() >= inner.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(LogEntry {
            seq,
            timestamp: Utc::now(),
            level,
            target,
            message,
        });
        seq
    }

    /// The most recent `count` entries, oldest first.
    pub fn tail(&self, count: usize) -> Vec<LogEntry> {
        let inner = self.inner.read();
        let skip = inner.entries.len().saturating_sub(count);
        inner.entries.iter().skip(skip).cloned().collect()
    }

    /// The most recent `count` entries rendered as newline-separated text.
    pub fn tail_text(&self, count: usize) -> String {
        self.tail(count)
            .iter()
            .map(LogEntry::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    pub fn clear(&self) {
        self.inner.write().entries.clear();
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects the `message` field plus any structured fields as `k=v` pairs.
#[derive(Default)]
struct FieldVisitor {
    message: String,
    extra: Vec<String>,
}

impl FieldVisitor {
    fn finish(self) -> String {
        if self.extra.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.extra.join(" "))
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.extra.push(format!("{}={:?}", field.name(), value));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.extra.push(format!("{}={}", field.name(), value));
        }
    }
}

/// Tracing layer that captures logs to the global buffer
#[derive(Default)]
pub struct LogBufferLayer;

impl LogBufferLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for LogBufferLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = LogLevel::from_tracing(event.metadata().level());
        let target = event.metadata().target().to_string();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        LOG_BUFFER.push_with_seq(level, target, visitor.finish());
    }
}
