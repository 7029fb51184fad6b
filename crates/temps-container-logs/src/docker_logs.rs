//! Docker engine backed container backend
//!
//! Containers are inspected through the engine API and every session gets
//! its own [`DockerLogDriver`], which replays and follows `docker logs` with
//! timestamps enabled and splits the timestamp prefix back off each line.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum};
use bollard::query_parameters::{InspectContainerOptions, LogsOptions};
use bollard::Docker;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{LogStreamConfig, ReadConfig};
use crate::error::{LogDriverError, LogReadError, LogsError};
use crate::message::{LogMessage, LogStream, UtcDateTime};
use crate::source::{
    AcquiredLogger, ContainerBackend, ContainerSnapshot, LogDriver, LogReader, LogWatcher,
    WatcherSender,
};

pub const DOCKER_DRIVER: &str = "docker";

#[derive(Debug, Clone)]
pub struct DockerContainerBackend {
    docker: Arc<Docker>,
    config: LogStreamConfig,
}

impl DockerContainerBackend {
    pub fn new(docker: Arc<Docker>, config: LogStreamConfig) -> Self {
        DockerContainerBackend {
            docker,
            config: config.normalize(),
        }
    }
}

#[async_trait]
impl ContainerBackend for DockerContainerBackend {
    async fn inspect(&self, name: &str) -> Result<ContainerSnapshot, LogsError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(container) => Ok(snapshot_from(name, container)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(LogsError::NotFound {
                container: name.to_string(),
            }),
            Err(e) => Err(LogsError::Backend(e.to_string())),
        }
    }

    async fn acquire_logger(
        &self,
        container: &ContainerSnapshot,
    ) -> Result<AcquiredLogger, LogsError> {
        // The engine keeps the real logger; each session reads through its
        // own API stream, so the driver is always session owned.
        Ok(AcquiredLogger::owned(Arc::new(DockerLogDriver::new(
            self.docker.clone(),
            container.id.clone(),
            self.config.watcher_capacity,
        ))))
    }
}

fn snapshot_from(name: &str, container: ContainerInspectResponse) -> ContainerSnapshot {
    let state = container.state.unwrap_or_default();
    let status = state.status;
    let log_driver = container
        .host_config
        .and_then(|host| host.log_config)
        .and_then(|log_config| log_config.typ)
        .unwrap_or_default();

    ContainerSnapshot {
        id: container.id.unwrap_or_else(|| name.to_string()),
        name: container
            .name
            .unwrap_or_else(|| name.to_string())
            .trim_start_matches('/')
            .to_string(),
        running: state.running.unwrap_or(false),
        dead: state.dead.unwrap_or(false) || status == Some(ContainerStateStatusEnum::DEAD),
        removal_in_progress: status == Some(ContainerStateStatusEnum::REMOVING),
        log_driver,
    }
}

pub struct DockerLogDriver {
    docker: Arc<Docker>,
    container_id: String,
    watcher_capacity: usize,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl DockerLogDriver {
    pub fn new(docker: Arc<Docker>, container_id: String, watcher_capacity: usize) -> Self {
        DockerLogDriver {
            docker,
            container_id,
            watcher_capacity,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl LogDriver for DockerLogDriver {
    fn name(&self) -> &str {
        DOCKER_DRIVER
    }

    fn reader(&self) -> Option<&dyn LogReader> {
        Some(self)
    }

    async fn close(&self) -> Result<(), LogDriverError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(LogDriverError::AlreadyClosed);
        }
        self.shutdown.cancel();
        Ok(())
    }
}

impl LogReader for DockerLogDriver {
    fn read_logs(&self, config: ReadConfig) -> LogWatcher {
        let (watcher, sender) = LogWatcher::new(self.watcher_capacity);
        tokio::spawn(stream_engine_logs(
            self.docker.clone(),
            self.container_id.clone(),
            config,
            sender,
            self.shutdown.clone(),
        ));
        watcher
    }
}

async fn stream_engine_logs(
    docker: Arc<Docker>,
    container_id: String,
    config: ReadConfig,
    sender: WatcherSender,
    shutdown: CancellationToken,
) {
    let options = LogsOptions {
        follow: config.follow,
        stdout: true,
        stderr: true,
        timestamps: true,
        tail: config.tail.to_string(),
        since: config.since.map(|dt| dt.timestamp() as i32).unwrap_or(0),
        ..Default::default()
    };
    let mut logs = Box::pin(docker.logs(&container_id, Some(options)));

    loop {
        let next = tokio::select! {
            _ = sender.closed() => return,
            _ = shutdown.cancelled() => return,
            next = logs.next() => next,
        };

        match next {
            None => {
                debug!(container = %container_id, "engine log stream ended");
                return;
            }
            Some(Ok(output)) => {
                let Some(msg) = parse_output(output) else {
                    continue;
                };
                // The engine filters `since` at second granularity.
                if config.since.is_some_and(|since| msg.timestamp < since) {
                    continue;
                }
                if !sender.send(msg).await {
                    return;
                }
            }
            Some(Err(e)) => {
                sender.send_error(LogReadError::Docker(e.to_string()));
                return;
            }
        }
    }
}

fn parse_output(output: LogOutput) -> Option<LogMessage> {
    let (source, chunk) = match output {
        LogOutput::StdOut { message } => (LogStream::Stdout, message),
        LogOutput::StdErr { message } => (LogStream::Stderr, message),
        // TTY containers have a single combined stream.
        LogOutput::Console { message } => (LogStream::Stdout, message),
        LogOutput::StdIn { .. } => return None,
    };
    let (timestamp, line) = split_timestamp(chunk);
    Some(LogMessage::new(source, line, timestamp))
}

fn split_timestamp(chunk: Bytes) -> (UtcDateTime, Bytes) {
    let parsed = chunk.iter().position(|&b| b == b' ').and_then(|pos| {
        std::str::from_utf8(&chunk[..pos])
            .ok()
            .and_then(|prefix| DateTime::parse_from_rfc3339(prefix).ok())
            .map(|ts| (ts.with_timezone(&Utc), pos))
    });

    match parsed {
        Some((timestamp, pos)) => (timestamp, chunk.slice(pos + 1..)),
        None => {
            warn!("log line without timestamp prefix, using receive time");
            (Utc::now(), chunk)
        }
    }
}
