//! User-facing log records.
//!
//! Wire-level detail goes straight to `tracing`. Messages a user should see
//! ("Loading device info...", overlap warnings, the final error) go through a
//! [`Logger`] handle that is handed to the facade and both engines, so the UI
//! collaborator can capture them with its own [`LogSink`].

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};

/// Log level for user-facing records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Verbose = 2,
    Debug = 3,
    Info = 4,
    Warning = 5,
    Error = 6,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Verbose => "VERBOSE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// One formatted log entry.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub tag: String,
    pub message: String,
    /// `[yyyy-MM-dd HH:mm:ss.SSS] <thread> LEVEL tag: message`
    pub line: String,
}

impl LogRecord {
    pub fn new(level: LogLevel, tag: &str, message: String) -> Self {
        let timestamp = Local::now();
        let current = std::thread::current();
        let thread = current.name().unwrap_or("unnamed");
        let line = format!(
            "[{}] <{}> {} {}: {}",
            timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            thread,
            level,
            tag,
            message
        );
        Self {
            timestamp,
            level,
            tag: tag.to_string(),
            message,
            line,
        }
    }
}

/// Destination for user-facing log records.
pub trait LogSink: Send + Sync {
    fn write(&self, record: &LogRecord);
}

/// Discards everything.
pub struct NullSink;

impl LogSink for NullSink {
    fn write(&self, _record: &LogRecord) {}
}

/// Re-emits records through `tracing`.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, record: &LogRecord) {
        let tag = record.tag.as_str();
        match record.level {
            LogLevel::Verbose => tracing::trace!(tag, "{}", record.message),
            LogLevel::Debug => tracing::debug!(tag, "{}", record.message),
            LogLevel::Info => tracing::info!(tag, "{}", record.message),
            LogLevel::Warning => tracing::warn!(tag, "{}", record.message),
            LogLevel::Error => tracing::error!(tag, "{}", record.message),
        }
    }
}

/// Accumulates formatted lines until drained.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every accumulated line, leaving the sink empty.
    pub fn drain(&self) -> Vec<String> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.drain(..).map(|r| r.line).collect()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl LogSink for MemorySink {
    fn write(&self, record: &LogRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
    }
}

/// Fans records out to several sinks.
pub struct TeeSink(pub Vec<Arc<dyn LogSink>>);

impl LogSink for TeeSink {
    fn write(&self, record: &LogRecord) {
        for sink in &self.0 {
            sink.write(record);
        }
    }
}

/// Cloneable logging handle.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
    filter: LogLevel,
}

impl Logger {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink,
            filter: LogLevel::Info,
        }
    }

    pub fn null() -> Self {
        Self::new(Arc::new(NullSink))
    }

    /// Drop records below `level`.
    pub fn with_filter(mut self, level: LogLevel) -> Self {
        self.filter = level;
        self
    }

    pub fn filter(&self) -> LogLevel {
        self.filter
    }

    pub fn log(&self, level: LogLevel, tag: &str, message: impl Into<String>) {
        if level < self.filter {
            return;
        }
        self.sink.write(&LogRecord::new(level, tag, message.into()));
    }

    pub fn verbose(&self, tag: &str, message: impl Into<String>) {
        self.log(LogLevel::Verbose, tag, message);
    }

    pub fn debug(&self, tag: &str, message: impl Into<String>) {
        self.log(LogLevel::Debug, tag, message);
    }

    pub fn info(&self, tag: &str, message: impl Into<String>) {
        self.log(LogLevel::Info, tag, message);
    }

    pub fn warning(&self, tag: &str, message: impl Into<String>) {
        self.log(LogLevel::Warning, tag, message);
    }

    pub fn error(&self, tag: &str, message: impl Into<String>) {
        self.log(LogLevel::Error, tag, message);
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_drops_lower_levels() {
        let sink = Arc::new(MemorySink::new());
        let logger = Logger::new(sink.clone());
        logger.debug("BLE", "hidden");
        logger.info("BLE", "shown");
        logger.error("DFU", "also shown");

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].level, LogLevel::Info);
        assert_eq!(records[1].tag, "DFU");

        let verbose = Logger::new(sink.clone()).with_filter(LogLevel::Verbose);
        verbose.verbose("BLE", "now visible");
        assert_eq!(sink.records().len(), 3);
    }

    #[test]
    fn test_line_format() {
        let record = LogRecord::new(LogLevel::Warning, "DFU", "careful".into());
        assert!(record.line.starts_with('['));
        assert!(record.line.ends_with("WARNING DFU: careful"), "{}", record.line);
        // "[yyyy-MM-dd HH:mm:ss.SSS]" is 25 characters.
        assert_eq!(record.line.find(']'), Some(24));
    }

    #[test]
    fn test_drain_clears() {
        let sink = MemorySink::new();
        sink.write(&LogRecord::new(LogLevel::Info, "t", "one".into()));
        sink.write(&LogRecord::new(LogLevel::Info, "t", "two".into()));
        let lines = sink.drain();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with("t: two"));
        assert!(sink.drain().is_empty());
    }

    #[test]
    fn test_tee_sink_reaches_every_sink() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let logger = Logger::new(Arc::new(TeeSink(vec![a.clone(), b.clone(), Arc::new(NullSink)])));
        logger.info("t", "x");
        assert_eq!(a.records().len(), 1);
        assert_eq!(b.records().len(), 1);
    }
}
