//! Access log sink.
//!
//! One line per connection outcome:
//!
//! ```text
//! 2024-05-01T10:00:00Z 203.0.113.7:51234 example.com ACCESS: connected
//! 2024-05-01T10:00:01Z 203.0.113.9:40112 - ERROR: TLS header - not TLS.
//! ```
//!
//! Absent fields are written as `-`. Each line goes out in a single
//! `write_all` under the sink mutex so concurrent handlers never interleave.

use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use tracing::warn;

/// Access log message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Access,
    Error,
    Debug,
}

impl MessageType {
    fn tag(self) -> &'static str {
        match self {
            MessageType::Access => "ACCESS:",
            MessageType::Error => "ERROR:",
            MessageType::Debug => "DEBUG:",
        }
    }
}

/// A single access log entry.
#[derive(Debug, Clone)]
pub struct LogEntry<'a> {
    pub remote: Option<SocketAddr>,
    pub hostname: &'a str,
    pub message_type: Option<MessageType>,
    pub message: &'a str,
}

impl fmt::Display for LogEntry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let remote = self
            .remote
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "-".to_string());
        let hostname = if self.hostname.is_empty() {
            "-"
        } else {
            self.hostname
        };
        let tag = self.message_type.map(MessageType::tag).unwrap_or("");
        let message = if self.message.is_empty() {
            "-"
        } else {
            self.message
        };

        write!(f, "{timestamp} {remote} {hostname} {tag} {message}")
    }
}

/// Append-only, line-oriented log sink shared by every connection.
pub struct AccessLog {
    sink: Mutex<Box<dyn Write + Send>>,
    debug: bool,
}

impl AccessLog {
    /// Create a log over any writer. DEBUG lines are dropped unless `debug` is set.
    pub fn new<W: Write + Send + 'static>(sink: W, debug: bool) -> Self {
        Self {
            sink: Mutex::new(Box::new(sink)),
            debug,
        }
    }

    /// Log a successful hand-off to the upstream.
    pub fn access(&self, hostname: &str, remote: Option<SocketAddr>) {
        self.write(&LogEntry {
            remote,
            hostname,
            message_type: Some(MessageType::Access),
            message: "connected",
        });
    }

    /// Log a connection failure.
    pub fn error(&self, message: &str, hostname: &str, remote: Option<SocketAddr>) {
        self.write(&LogEntry {
            remote,
            hostname,
            message_type: Some(MessageType::Error),
            message,
        });
    }

    /// Log a low-severity event. No-op unless debug logging is enabled.
    pub fn debug(&self, message: &str, hostname: &str, remote: Option<SocketAddr>) {
        if !self.debug {
            return;
        }
        self.write(&LogEntry {
            remote,
            hostname,
            message_type: Some(MessageType::Debug),
            message,
        });
    }

    fn write(&self, entry: &LogEntry<'_>) {
        let line = format!("{entry}\n");
        let mut sink = match self.sink.lock() {
            Ok(sink) => sink,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = sink.write_all(line.as_bytes()).and_then(|_| sink.flush()) {
            warn!(error = %e, "Failed to write access log line");
        }
    }
}

impl fmt::Debug for AccessLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessLog")
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

/// In-memory sink, cloneable so tests can read back what was logged.
#[derive(Debug, Clone, Default)]
pub struct MemorySink(std::sync::Arc<Mutex<Vec<u8>>>);

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded.
    pub fn contents(&self) -> String {
        let buf = match self.0.lock() {
            Ok(buf) => buf,
            Err(poisoned) => poisoned.into_inner(),
        };
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = match self.0.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> Option<SocketAddr> {
        Some("203.0.113.7:51234".parse().unwrap())
    }

    #[test]
    fn test_access_line_format() {
        let sink = MemorySink::new();
        let log = AccessLog::new(sink.clone(), false);
        log.access("example.com", remote());

        let contents = sink.contents();
        let line = contents.trim_end_matches('\n');
        let fields: Vec<&str> = line.splitn(5, ' ').collect();
        assert_eq!(fields.len(), 5);
        assert!(chrono::DateTime::parse_from_rfc3339(fields[0]).is_ok());
        assert_eq!(fields[1], "203.0.113.7:51234");
        assert_eq!(fields[2], "example.com");
        assert_eq!(fields[3], "ACCESS:");
        assert_eq!(fields[4], "connected");
    }

    #[test]
    fn test_absent_fields_use_dash() {
        let entry = LogEntry {
            remote: None,
            hostname: "",
            message_type: None,
            message: "",
        };
        let line = entry.to_string();
        assert!(line.ends_with(" - -  -"), "got {line:?}");
    }

    #[test]
    fn test_debug_lines_gated_by_flag() {
        let sink = MemorySink::new();
        let quiet = AccessLog::new(sink.clone(), false);
        quiet.debug("closing", "", None);
        assert!(sink.contents().is_empty());

        let verbose = AccessLog::new(sink.clone(), true);
        verbose.debug("closing", "", None);
        assert!(sink.contents().contains("DEBUG: closing"));
    }

    #[test]
    fn test_one_line_per_call() {
        let sink = MemorySink::new();
        let log = std::sync::Arc::new(AccessLog::new(sink.clone(), false));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = std::sync::Arc::clone(&log);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        log.error(&format!("failure {i}"), "example.com", None);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let contents = sink.contents();
        assert_eq!(contents.lines().count(), 400);
        assert!(contents
            .lines()
            .all(|l| l.contains(" - example.com ERROR: failure ")));
    }
}
