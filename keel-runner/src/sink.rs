//! Output sinks
//!
//! Command output is streamed line by line while a command runs. A sink
//! receives every line as it arrives; the orchestrator uses a buffered sink
//! that is drained periodically into the run's log store.

use keel_core::domain::log::{LogEntry, LogLevel, LogStream};
use std::sync::{Arc, Mutex};

/// Receiver of command output and executor progress messages
pub trait OutputSink: Send + Sync {
    /// Called once per output line, without the trailing newline
    ///
    /// # Arguments
    /// * `stream` - Stream the line was read from
    /// * `line` - The line content
    fn line(&self, stream: LogStream, line: &str);

    /// Records a message produced by the engine itself
    fn system(&self, level: LogLevel, message: &str) {
        let _ = (level, message);
    }
}

/// Sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn line(&self, _stream: LogStream, _line: &str) {}
}

/// Thread-safe buffer of log entries
///
/// Written to during stage execution and periodically drained to persist
/// the entries. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct InMemoryLogBuffer {
    buffer: Arc<Mutex<Vec<LogEntry>>>,
}

impl InMemoryLogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&self, entry: LogEntry) {
        let mut buffer = self.buffer.lock().unwrap();
        buffer.push(entry);
    }

    /// Returns all buffered entries and clears the buffer
    pub fn drain(&self) -> Vec<LogEntry> {
        let mut buffer = self.buffer.lock().unwrap();
        buffer.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutputSink for InMemoryLogBuffer {
    fn line(&self, stream: LogStream, line: &str) {
        self.add_entry(LogEntry::output(stream, line));
    }

    fn system(&self, level: LogLevel, message: &str) {
        self.add_entry(LogEntry::system(level, message));
    }
}

/// Forwards to an inner sink while keeping a copy of the output
///
/// Used to keep partial output of a command that never completes.
pub(crate) struct CaptureSink<'a> {
    inner: &'a dyn OutputSink,
    stdout: Mutex<String>,
    stderr: Mutex<String>,
}

impl<'a> CaptureSink<'a> {
    pub(crate) fn new(inner: &'a dyn OutputSink) -> Self {
        Self {
            inner,
            stdout: Mutex::new(String::new()),
            stderr: Mutex::new(String::new()),
        }
    }

    /// Captured (stdout, stderr)
    pub(crate) fn take(&self) -> (String, String) {
        (
            std::mem::take(&mut *self.stdout.lock().unwrap()),
            std::mem::take(&mut *self.stderr.lock().unwrap()),
        )
    }
}

impl OutputSink for CaptureSink<'_> {
    fn line(&self, stream: LogStream, line: &str) {
        let target = match stream {
            LogStream::Stderr => &self.stderr,
            _ => &self.stdout,
        };
        {
            let mut captured = target.lock().unwrap();
            captured.push_str(line);
            captured.push('\n');
        }
        self.inner.line(stream, line);
    }

    fn system(&self, level: LogLevel, message: &str) {
        self.inner.system(level, message);
    }
}
