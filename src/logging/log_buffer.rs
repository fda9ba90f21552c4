use super::{LogEntry, LogLevel};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

// Override with PADSERVE_LOG_BUFFER_CAPACITY=20000
const DEFAULT_LOG_CAPACITY: usize = 10_000;
const MAX_LOG_MESSAGE_SIZE: usize = 4096;

/// Ring buffer of the most recent log entries.
///
/// Failure details that are hidden from clients (see
/// `OperationError::client_message`) stay inspectable here.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
    sequence_counter: Arc<AtomicU64>,
}

impl LogBuffer {
    pub fn new() -> Self {
        let capacity = std::env::var("PADSERVE_LOG_BUFFER_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_LOG_CAPACITY);
        Self::with_capacity(capacity)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            sequence_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an entry, evicting the oldest ones past capacity.
    pub fn push(&self, mut entry: LogEntry) {
        entry.sequence = self.sequence_counter.fetch_add(1, Ordering::SeqCst);

        if let Ok(mut entries) = self.entries.lock() {
            entries.push_back(entry);
            while entries.len() > self.capacity {
                entries.pop_front();
            }
        }
    }

    /// The last `count` entries, oldest first.
    pub fn get_last(&self, count: usize) -> Vec<LogEntry> {
        match self.entries.lock() {
            Ok(entries) => {
                let skip = entries.len().saturating_sub(count);
                entries.iter().skip(skip).cloned().collect()
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn get_all(&self) -> Vec<LogEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn get_since_sequence(&self, since: u64, limit: usize) -> Vec<LogEntry> {
        match self.entries.lock() {
            Ok(entries) => entries
                .iter()
                .filter(|entry| entry.sequence > since)
                .take(limit)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Entries at `min_level` or above, oldest first.
    pub fn get_by_level(&self, min_level: LogLevel) -> Vec<LogEntry> {
        match self.entries.lock() {
            Ok(entries) => entries
                .iter()
                .filter(|entry| level_rank(entry.level) >= level_rank(min_level))
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn level_rank(level: LogLevel) -> u8 {
    match level {
        LogLevel::Trace => 0,
        LogLevel::Debug => 1,
        LogLevel::Info => 2,
        LogLevel::Warn => 3,
        LogLevel::Error => 4,
    }
}

/// Tracing layer feeding a [`LogBuffer`].
pub struct MemoryLogLayer {
    buffer: LogBuffer,
}

impl MemoryLogLayer {
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }

    pub fn buffer(&self) -> &LogBuffer {
        &self.buffer
    }

    fn convert_level(level: &tracing::Level) -> LogLevel {
        match *level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }

    fn format_message(event: &Event<'_>) -> String {
        struct MessageVisitor {
            message: String,
            fields: Vec<String>,
        }

        impl tracing::field::Visit for MessageVisitor {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.message = format!("{value:?}");
                } else {
                    self.fields.push(format!("{}={:?}", field.name(), value));
                }
            }

            fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
                if field.name() == "message" {
                    self.message = value.to_string();
                } else {
                    self.fields.push(format!("{}={}", field.name(), value));
                }
            }
        }

        let mut visitor = MessageVisitor {
            message: String::new(),
            fields: Vec::new(),
        };
        event.record(&mut visitor);

        let mut message = if visitor.message.is_empty() {
            event.metadata().target().to_string()
        } else {
            visitor.message
        };
        if !visitor.fields.is_empty() {
            message.push(' ');
            message.push_str(&visitor.fields.join(" "));
        }

        truncate_message(message)
    }
}

fn truncate_message(message: String) -> String {
    if message.len() <= MAX_LOG_MESSAGE_SIZE {
        return message;
    }
    let mut cut = MAX_LOG_MESSAGE_SIZE;
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}... [TRUNCATED - original size: {} chars]",
        &message[..cut],
        message.len()
    )
}

impl<S> Layer<S> for MemoryLogLayer
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let timestamp = chrono::Utc::now()
            .format("%Y-%m-%d %H:%M:%S%.3f UTC")
            .to_string();

        self.buffer.push(LogEntry {
            sequence: 0,
            timestamp,
            level: Self::convert_level(metadata.level()),
            target: metadata.target().to_string(),
            message: Self::format_message(event),
            file: metadata.file().map(|s| s.to_string()),
            line: metadata.line(),
        });
    }
}
