//! Stream pump: validates a logs request and drains a container's log reader
//! into a bounded output channel.
//!
//! Every failure up to the handoff is returned from [`LogStreamer::stream`]
//! and leaves nothing behind. After the handoff the call has already returned
//! `Ok`, so read failures can only be reported as a terminal message. The
//! output channel is closed exactly once, after the reader and any owned
//! driver have been released; a closed channel is the consumer's only end of
//! stream signal.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, Instrument};

use crate::config::{LogStreamConfig, LogsRequest, ReadConfig, Tail};
use crate::error::{LogReadError, LogsError};
use crate::message::LogMessage;
use crate::source::{AcquiredLogger, ContainerBackend, LogWatcher, NONE_DRIVER};
use crate::timestamps::parse_since;

pub struct LogStreamer {
    backend: Arc<dyn ContainerBackend>,
    config: LogStreamConfig,
}

impl LogStreamer {
    pub fn new(backend: Arc<dyn ContainerBackend>, config: LogStreamConfig) -> Self {
        Self {
            backend,
            config: config.normalize(),
        }
    }

    /// Starts streaming the logs of `container`.
    ///
    /// On `Ok` the returned channel yields the requested records until the
    /// reader is exhausted, a read error occurs (delivered as a final
    /// terminal message) or `ctx` is cancelled.
    pub async fn stream(
        &self,
        ctx: CancellationToken,
        container: &str,
        request: &LogsRequest,
    ) -> Result<mpsc::Receiver<LogMessage>, LogsError> {
        if !(request.show_stdout || request.show_stderr) {
            return Err(LogsError::InvalidArgument(
                "you must choose at least one stream".to_string(),
            ));
        }

        let snapshot = self.backend.inspect(container).await?;
        if snapshot.removal_in_progress || snapshot.dead {
            return Err(LogsError::Conflict {
                container: container.to_string(),
            });
        }
        if snapshot.log_driver == NONE_DRIVER {
            return Err(LogsError::Unsupported {
                driver: snapshot.log_driver,
            });
        }

        // Parsed before a logger is acquired so a bad filter cannot leak one.
        let read_config = ReadConfig {
            since: parse_since(&request.since)?,
            tail: Tail::parse(&request.tail),
            follow: request.follow && snapshot.running,
        };

        let logger = self.backend.acquire_logger(&snapshot).await?;
        if logger.driver.reader().is_none() {
            let driver = logger.driver.name().to_string();
            release_driver(&logger).await;
            return Err(LogsError::Unsupported { driver });
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let span = debug_span!("container_logs", container = %snapshot.name);
        tokio::spawn(run(ctx, logger, read_config, request.clone(), tx).instrument(span));
        Ok(rx)
    }
}

async fn run(
    ctx: CancellationToken,
    logger: AcquiredLogger,
    config: ReadConfig,
    request: LogsRequest,
    tx: mpsc::Sender<LogMessage>,
) {
    let watcher = logger.driver.reader().map(|reader| reader.read_logs(config));
    if let Some(mut watcher) = watcher {
        debug!("begin logs");
        forward(&ctx, &mut watcher, &request, &tx).await;
        watcher.close();
    }
    release_driver(&logger).await;
    // Last: the consumer must not see end of stream before cleanup is done.
    drop(tx);
}

async fn forward(
    ctx: &CancellationToken,
    watcher: &mut LogWatcher,
    request: &LogsRequest,
    tx: &mpsc::Sender<LogMessage>,
) {
    loop {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                debug!("logs: end stream, context cancelled");
                return;
            }
            _ = tx.closed() => {
                debug!("log consumer went away");
                return;
            }
            msg = watcher.msgs.recv() => match msg {
                Some(msg) => {
                    if !request.wants(msg.source) {
                        continue;
                    }
                    tokio::select! {
                        biased;
                        _ = ctx.cancelled() => return,
                        sent = tx.send(msg) => {
                            if sent.is_err() {
                                debug!("log consumer went away");
                                return;
                            }
                        }
                    }
                }
                None => {
                    // The reader is gone, so any error it reported is
                    // already buffered.
                    match watcher.errors.try_recv() {
                        Ok(err) => send_terminal(ctx, tx, err).await,
                        Err(_) => debug!("end logs"),
                    }
                    return;
                }
            },
            err = watcher.errors.recv() => {
                if let Some(err) = err {
                    send_terminal(ctx, tx, err).await;
                }
                return;
            }
        }
    }
}

async fn send_terminal(ctx: &CancellationToken, tx: &mpsc::Sender<LogMessage>, err: LogReadError) {
    error!(error = %err, "error streaming logs");
    tokio::select! {
        biased;
        _ = ctx.cancelled() => {}
        _ = tx.send(LogMessage::terminal(err)) => {}
    }
}

/// Closes the driver if this session opened it; cached drivers stay open.
async fn release_driver(logger: &AcquiredLogger) {
    if !logger.owned {
        return;
    }
    if let Err(e) = logger.driver.close().await {
        error!(driver = logger.driver.name(), error = %e, "error closing logger");
    }
}
