//! Log records as they travel from a log driver to the output sink

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::LogReadError;
use crate::stdcopy::StdStream;

pub type UtcDateTime = DateTime<Utc>;

/// Per-record key/value metadata ("details") attached by the log driver.
pub type LogAttributes = HashMap<String, String>;

/// The container stream a record was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }

    /// Output lane the record is routed to when multiplexing.
    pub fn lane(&self) -> StdStream {
        match self {
            LogStream::Stdout => StdStream::Stdout,
            LogStream::Stderr => StdStream::Stderr,
        }
    }
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record emitted by a log reader.
///
/// `line` is kept verbatim: the pipeline never adds or strips newlines, so
/// whatever framing the driver produced is what reaches the sink.
///
/// A message with `err` set is a terminal message. It carries no record data
/// and is always the last value of a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct LogMessage {
    pub source: LogStream,
    pub line: Bytes,
    pub timestamp: UtcDateTime,
    pub attrs: LogAttributes,
    pub err: Option<LogReadError>,
}

impl LogMessage {
    pub fn new(source: LogStream, line: impl Into<Bytes>, timestamp: UtcDateTime) -> Self {
        Self {
            source,
            line: line.into(),
            timestamp,
            attrs: LogAttributes::new(),
            err: None,
        }
    }

    pub fn with_attrs(mut self, attrs: LogAttributes) -> Self {
        self.attrs = attrs;
        self
    }

    /// Builds a terminal message. Only the error is copied so no partial
    /// record data leaks downstream.
    pub fn terminal(err: LogReadError) -> Self {
        Self {
            source: LogStream::Stderr,
            line: Bytes::new(),
            timestamp: UtcDateTime::default(),
            attrs: LogAttributes::new(),
            err: Some(err),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.err.is_some()
    }
}
