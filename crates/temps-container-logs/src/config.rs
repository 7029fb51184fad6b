//! Request and pipeline configuration

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::LogsError;
use crate::message::{LogStream, UtcDateTime};

/// Options for one log streaming session, as received from the request layer.
///
/// `tail` and `since` are kept as raw strings: `tail` is parsed leniently
/// ([`Tail::parse`]) while a bad `since` is rejected before streaming starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsRequest {
    #[serde(rename = "stdout", deserialize_with = "deserialize_flag")]
    pub show_stdout: bool,
    #[serde(rename = "stderr", deserialize_with = "deserialize_flag")]
    pub show_stderr: bool,
    #[serde(deserialize_with = "deserialize_flag")]
    pub follow: bool,
    pub tail: String,
    pub since: String,
    #[serde(deserialize_with = "deserialize_flag")]
    pub timestamps: bool,
    #[serde(deserialize_with = "deserialize_flag")]
    pub details: bool,
}

impl LogsRequest {
    /// Parses a request from an HTTP query string such as
    /// `stdout=1&stderr=1&follow=true&tail=100`.
    pub fn from_query(query: &str) -> Result<Self, LogsError> {
        serde_urlencoded::from_str(query).map_err(|e| LogsError::InvalidArgument(e.to_string()))
    }

    pub fn wants(&self, stream: LogStream) -> bool {
        match stream {
            LogStream::Stdout => self.show_stdout,
            LogStream::Stderr => self.show_stderr,
        }
    }

    pub fn write_config(&self, multiplex: bool) -> WriteConfig {
        WriteConfig {
            timestamps: self.timestamps,
            details: self.details,
            multiplex,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Text(String),
}

fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => Ok(value),
        Flag::Text(text) => match text.as_str() {
            "1" | "true" | "True" | "TRUE" => Ok(true),
            "" | "0" | "false" | "False" | "FALSE" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "invalid boolean value {:?}",
                other
            ))),
        },
    }
}

/// How many of the most recent records to return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Tail {
    #[default]
    All,
    Lines(usize),
}

impl Tail {
    /// Lenient parse: non-negative integers are line counts, everything else
    /// (negative numbers, `"all"`, garbage) means all records.
    pub fn parse(value: &str) -> Self {
        match value.parse::<i64>() {
            Ok(n) if n >= 0 => usize::try_from(n).map(Tail::Lines).unwrap_or(Tail::All),
            _ => Tail::All,
        }
    }
}

impl fmt::Display for Tail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tail::All => f.write_str("all"),
            Tail::Lines(n) => write!(f, "{}", n),
        }
    }
}

/// What a log reader is asked to produce.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadConfig {
    pub since: Option<UtcDateTime>,
    pub tail: Tail,
    pub follow: bool,
}

/// Rendering options for [`write_log_stream`](crate::write_log_stream).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteConfig {
    pub timestamps: bool,
    pub details: bool,
    pub multiplex: bool,
}

/// Pipeline tuning, loadable from the daemon's config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogStreamConfig {
    /// Capacity of the channel between the stream pump and the writer.
    pub channel_capacity: usize,
    /// Buffer size of each reader opened by the shipped log drivers.
    pub watcher_capacity: usize,
    /// Records retained per container by the in-memory log driver.
    pub memory_buffer_capacity: usize,
}

impl Default for LogStreamConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1,
            watcher_capacity: 256,
            memory_buffer_capacity: 10_000,
        }
    }
}

impl LogStreamConfig {
    /// Clamps every capacity to at least one; bounded channels reject zero.
    pub fn normalize(self) -> Self {
        Self {
            channel_capacity: self.channel_capacity.max(1),
            watcher_capacity: self.watcher_capacity.max(1),
            memory_buffer_capacity: self.memory_buffer_capacity.max(1),
        }
    }
}
