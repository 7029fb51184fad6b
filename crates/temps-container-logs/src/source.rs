//! Log source contract consumed by the stream pump
//!
//! A container's logging driver ([`LogDriver`]) may be able to replay and
//! follow its records ([`LogReader`]). Each read returns a [`LogWatcher`]: a
//! data channel, a separate error channel and a close operation. The owner of
//! a watcher must stop pulling data once an error has been observed and must
//! release the watcher exactly once on every exit path.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ReadConfig;
use crate::error::{LogDriverError, LogReadError, LogsError};
use crate::message::LogMessage;

/// Logging driver type that discards all output.
pub const NONE_DRIVER: &str = "none";

type CloseHook = Box<dyn FnOnce() + Send + Sync>;

/// Consumer half of a single log read.
pub struct LogWatcher {
    /// Records in non-decreasing timestamp order per stream. Closed when the
    /// reader has nothing more to send.
    pub msgs: mpsc::Receiver<LogMessage>,
    /// Yields at most one fatal read error.
    pub errors: mpsc::Receiver<LogReadError>,
    done: CancellationToken,
    on_close: Option<CloseHook>,
}

/// Producer half of a single log read, held by the driver.
pub struct WatcherSender {
    msgs: mpsc::Sender<LogMessage>,
    errors: mpsc::Sender<LogReadError>,
    done: CancellationToken,
}

impl LogWatcher {
    pub fn new(capacity: usize) -> (LogWatcher, WatcherSender) {
        let (msg_tx, msg_rx) = mpsc::channel(capacity.max(1));
        let (err_tx, err_rx) = mpsc::channel(1);
        let done = CancellationToken::new();

        let watcher = LogWatcher {
            msgs: msg_rx,
            errors: err_rx,
            done: done.clone(),
            on_close: None,
        };
        let sender = WatcherSender {
            msgs: msg_tx,
            errors: err_tx,
            done,
        };
        (watcher, sender)
    }

    /// Registers a callback run exactly once when the watcher is released.
    pub fn on_close(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    /// Releases the reader's resources.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.done.cancel();
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl Drop for LogWatcher {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for LogWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogWatcher")
            .field("closed", &self.done.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl WatcherSender {
    /// Sends a record, giving up if the watcher is closed first.
    /// Returns `false` once the consumer is gone.
    pub async fn send(&self, msg: LogMessage) -> bool {
        tokio::select! {
            biased;
            _ = self.done.cancelled() => false,
            sent = self.msgs.send(msg) => sent.is_ok(),
        }
    }

    /// Reports a fatal read error. Consumes the sender: nothing may follow.
    pub fn send_error(self, err: LogReadError) {
        // Capacity is one and this is the only send, so it never blocks.
        let _ = self.errors.try_send(err);
    }

    /// Resolves once the consumer has closed the watcher.
    pub async fn closed(&self) {
        self.done.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }
}

/// A logger able to replay and follow its records.
pub trait LogReader: Send + Sync {
    fn read_logs(&self, config: ReadConfig) -> LogWatcher;
}

/// A container logging driver instance.
#[async_trait]
pub trait LogDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Read capability, if the driver has one.
    fn reader(&self) -> Option<&dyn LogReader> {
        None
    }

    async fn close(&self) -> Result<(), LogDriverError>;
}

/// A log driver handed out for one session, with the caller's ownership of it.
///
/// `owned` is false when the driver is the container's long lived cached
/// instance; the session must then leave it open.
#[derive(Clone)]
pub struct AcquiredLogger {
    pub driver: Arc<dyn LogDriver>,
    pub owned: bool,
}

impl AcquiredLogger {
    pub fn cached(driver: Arc<dyn LogDriver>) -> Self {
        Self {
            driver,
            owned: false,
        }
    }

    pub fn owned(driver: Arc<dyn LogDriver>) -> Self {
        Self {
            driver,
            owned: true,
        }
    }
}

impl fmt::Debug for AcquiredLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquiredLogger")
            .field("driver", &self.driver.name())
            .field("owned", &self.owned)
            .finish()
    }
}

/// Point-in-time view of a container, as needed to serve its logs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSnapshot {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub dead: bool,
    pub removal_in_progress: bool,
    /// Configured logging driver type, e.g. `json-file` or `none`.
    pub log_driver: String,
}

/// Container lookup and logger acquisition.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Fails with [`LogsError::NotFound`] for unknown containers.
    async fn inspect(&self, name: &str) -> Result<ContainerSnapshot, LogsError>;

    async fn acquire_logger(
        &self,
        container: &ContainerSnapshot,
    ) -> Result<AcquiredLogger, LogsError>;
}
