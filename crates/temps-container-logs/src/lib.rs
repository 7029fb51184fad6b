//! Temps Container Logs - log delivery pipeline for containers
//!
//! This crate streams a container's log records to a single output sink:
//!
//! ## Stream Pump (`pump`)
//! - Validating a logs request before any work starts
//! - Acquiring the container's log driver and reader
//! - Draining the reader into a bounded channel under a cancellation token
//! - Releasing readers and session-owned drivers exactly once
//!
//! ## Multiplexing Writer (`writer`)
//! - Applying timestamp and details prefixes
//! - Routing records to stdout/stderr lanes, errors to the system-error lane
//! - Framing lanes onto one byte stream (`stdcopy`)
//!
//! ## Log Sources
//! - The driver/reader contract (`source`)
//! - An in-memory driver and container registry (`memory`)
//! - A Docker engine backed backend (`docker_logs`)

pub mod config;
pub mod details;
pub mod docker_logs;
pub mod error;
pub mod memory;
pub mod message;
pub mod pump;
pub mod source;
pub mod stdcopy;
pub mod timestamps;
pub mod writer;

// Re-export the main types for convenience
pub use config::{LogStreamConfig, LogsRequest, ReadConfig, Tail, WriteConfig};
pub use details::{encode_details, parse_details, DetailsError};
pub use docker_logs::{DockerContainerBackend, DockerLogDriver};
pub use error::{ErrorKind, LogDriverError, LogReadError, LogsError};
pub use memory::{LogBuffer, MemoryContainers, MemoryLogDriver};
pub use message::{LogAttributes, LogMessage, LogStream, UtcDateTime};
pub use pump::LogStreamer;
pub use source::{
    AcquiredLogger, ContainerBackend, ContainerSnapshot, LogDriver, LogReader, LogWatcher,
    WatcherSender,
};
pub use stdcopy::{demultiplex, Demultiplexed, Frame, StdFrameCodec, StdStream};
pub use writer::write_log_stream;
