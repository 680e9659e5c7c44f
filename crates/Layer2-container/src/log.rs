//! Rolling log buffer
//!
//! Containers and task records each keep one. Lines are numbered from 1 in
//! push order; once `max_entries` is reached the oldest line is dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default buffer size
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
    /// Lifecycle messages (start, stop, etc.)
    System,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Stdout => "stdout",
            LogLevel::Stderr => "stderr",
            LogLevel::System => "system",
            LogLevel::Error => "error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, LogLevel::Stderr | LogLevel::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub content: String,
    /// Assigned by the buffer on push
    pub line_number: usize,
}

impl LogEntry {
    pub fn new(level: LogLevel, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            content: content.into(),
            line_number: 0,
        }
    }

    /// `[HH:MM:SS.mmm] [level] content`
    pub fn format_line(&self) -> String {
        format!(
            "[{}] [{}] {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.level.as_str(),
            self.content
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    max_entries: usize,
    line_count: usize,
}

impl LogBuffer {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries: max_entries.max(1),
            line_count: 0,
        }
    }

    pub fn push(&mut self, mut entry: LogEntry) {
        self.line_count += 1;
        entry.line_number = self.line_count;

        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn push_stdout(&mut self, content: impl Into<String>) {
        self.push(LogEntry::new(LogLevel::Stdout, content));
    }

    pub fn push_stderr(&mut self, content: impl Into<String>) {
        self.push(LogEntry::new(LogLevel::Stderr, content));
    }

    pub fn push_system(&mut self, content: impl Into<String>) {
        self.push(LogEntry::new(LogLevel::System, content));
    }

    pub fn push_error(&mut self, content: impl Into<String>) {
        self.push(LogEntry::new(LogLevel::Error, content));
    }

    /// Split captured command output into lines and append them
    pub fn push_output(&mut self, stdout: &str, stderr: &str) {
        for line in stdout.lines() {
            self.push_stdout(line);
        }
        for line in stderr.lines() {
            self.push_stderr(line);
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Last N entries, oldest first
    pub fn tail(&self, n: usize) -> Vec<&LogEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).collect()
    }

    pub fn errors(&self) -> Vec<&LogEntry> {
        self.entries.iter().filter(|e| e.level.is_error()).collect()
    }

    /// Retained lines as plain strings
    pub fn lines(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.content.clone()).collect()
    }

    /// Total lines pushed, including dropped ones
    pub fn line_count(&self) -> usize {
        self.line_count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}
