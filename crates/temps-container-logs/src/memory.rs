//! In-process log driver backed by a bounded ring buffer
//!
//! [`MemoryContainers`] is a small container registry whose containers keep
//! their records in memory. A running container hands out its cached
//! [`MemoryLogDriver`]; a stopped one gets a fresh driver over the same
//! buffer, which the session then owns and closes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{LogStreamConfig, ReadConfig, Tail};
use crate::error::{LogDriverError, LogsError};
use crate::message::LogMessage;
use crate::source::{
    AcquiredLogger, ContainerBackend, ContainerSnapshot, LogDriver, LogReader, LogWatcher,
    WatcherSender,
};

pub const MEMORY_DRIVER: &str = "memory";

/// Bounded record history plus a live feed for followers.
pub struct LogBuffer {
    records: Mutex<VecDeque<LogMessage>>,
    live: broadcast::Sender<LogMessage>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (live, _) = broadcast::channel(capacity);
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            live,
            capacity,
        }
    }

    /// Appends a record, evicting the oldest one when full.
    pub fn append(&self, msg: LogMessage) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(msg.clone());
        // Sent under the lock so a reader never sees a record both in its
        // snapshot and on its live feed.
        let _ = self.live.send(msg);
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot_and_subscribe(&self) -> (Vec<LogMessage>, broadcast::Receiver<LogMessage>) {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let live = self.live.subscribe();
        (records.iter().cloned().collect(), live)
    }
}

pub struct MemoryLogDriver {
    buffer: Arc<LogBuffer>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    watcher_capacity: usize,
}

impl MemoryLogDriver {
    pub fn new(buffer: Arc<LogBuffer>, watcher_capacity: usize) -> Self {
        Self {
            buffer,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            watcher_capacity,
        }
    }

    pub fn log(&self, msg: LogMessage) -> Result<(), LogDriverError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LogDriverError::AlreadyClosed);
        }
        self.buffer.append(msg);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogDriver for MemoryLogDriver {
    fn name(&self) -> &str {
        MEMORY_DRIVER
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

impl LogReader for MemoryLogDriver {
    fn read_logs(&self, config: ReadConfig) -> LogWatcher {
        let (watcher, sender) = LogWatcher::new(self.watcher_capacity);
        let (history, live) = self.buffer.snapshot_and_subscribe();
        let shutdown = self.shutdown.clone();
        tokio::spawn(replay_and_follow(history, live, config, sender, shutdown));
        watcher
    }
}

fn in_range(msg: &LogMessage, config: &ReadConfig) -> bool {
    config.since.map_or(true, |since| msg.timestamp >= since)
}

async fn replay_and_follow(
    history: Vec<LogMessage>,
    mut live: broadcast::Receiver<LogMessage>,
    config: ReadConfig,
    sender: WatcherSender,
    shutdown: CancellationToken,
) {
    let skip = match config.tail {
        Tail::All => 0,
        Tail::Lines(n) => history.len().saturating_sub(n),
    };
    for msg in history.into_iter().skip(skip) {
        if in_range(&msg, &config) && !sender.send(msg).await {
            return;
        }
    }

    if !config.follow {
        return;
    }

    loop {
        tokio::select! {
            _ = sender.closed() => return,
            _ = shutdown.cancelled() => {
                debug!("memory log driver closed, ending follow");
                return;
            }
            received = live.recv() => match received {
                Ok(msg) => {
                    if in_range(&msg, &config) && !sender.send(msg).await {
                        return;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "memory log follower fell behind, records dropped");
                }
                Err(RecvError::Closed) => return,
            }
        }
    }
}

struct MemoryContainer {
    snapshot: ContainerSnapshot,
    buffer: Arc<LogBuffer>,
    driver: Option<Arc<MemoryLogDriver>>,
}

/// Container registry whose logs live in memory.
pub struct MemoryContainers {
    containers: RwLock<HashMap<String, MemoryContainer>>,
    config: LogStreamConfig,
}

impl MemoryContainers {
    pub fn new(config: LogStreamConfig) -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
            config: config.normalize(),
        }
    }

    /// Registers a stopped container using the given logging driver type.
    ///
    /// A name can only be registered once; the existing container and its
    /// cached driver are left untouched.
    pub fn create(&self, name: &str, log_driver: &str) -> Result<(), LogsError> {
        let mut containers = self.write();
        if containers.contains_key(name) {
            return Err(LogsError::Conflict {
                container: name.to_string(),
            });
        }
        let container = MemoryContainer {
            snapshot: ContainerSnapshot {
                id: name.to_string(),
                name: name.to_string(),
                log_driver: log_driver.to_string(),
                ..Default::default()
            },
            buffer: Arc::new(LogBuffer::new(self.config.memory_buffer_capacity)),
            driver: None,
        };
        containers.insert(name.to_string(), container);
        Ok(())
    }

    /// Marks the container running and caches a driver for it. Starting a
    /// running container keeps its current driver, which sessions may hold.
    pub fn start(&self, name: &str) -> Result<(), LogsError> {
        let watcher_capacity = self.config.watcher_capacity;
        self.update(name, |container| {
            container.snapshot.running = true;
            if container.driver.is_none() {
                container.driver = Some(Arc::new(MemoryLogDriver::new(
                    container.buffer.clone(),
                    watcher_capacity,
                )));
            }
        })
    }

    /// Marks the container stopped and closes its cached driver, which ends
    /// every follower.
    pub async fn stop(&self, name: &str) -> Result<(), LogsError> {
        let driver = self.update(name, |container| {
            container.snapshot.running = false;
            container.driver.take()
        })?;
        if let Some(driver) = driver {
            if let Err(e) = driver.close().await {
                warn!(container = %name, error = %e, "failed to close cached log driver");
            }
        }
        Ok(())
    }

    pub fn mark_removing(&self, name: &str) -> Result<(), LogsError> {
        self.update(name, |container| container.snapshot.removal_in_progress = true)
    }

    pub fn mark_dead(&self, name: &str) -> Result<(), LogsError> {
        self.update(name, |container| container.snapshot.dead = true)
    }

    /// Records a line for the container, through its cached driver while it
    /// is running.
    pub fn log(&self, name: &str, msg: LogMessage) -> Result<(), LogsError> {
        let (driver, buffer) =
            self.update(name, |container| (container.driver.clone(), container.buffer.clone()))?;
        match driver {
            Some(driver) => driver
                .log(msg)
                .map_err(|e| LogsError::Backend(format!("{}: {}", name, e))),
            None => {
                buffer.append(msg);
                Ok(())
            }
        }
    }

    fn update<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut MemoryContainer) -> T,
    ) -> Result<T, LogsError> {
        let mut containers = self.write();
        let container = containers.get_mut(name).ok_or_else(|| LogsError::NotFound {
            container: name.to_string(),
        })?;
        Ok(f(container))
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, MemoryContainer>> {
        self.containers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryContainers {
    fn default() -> Self {
        Self::new(LogStreamConfig::default())
    }
}

#[async_trait]
impl ContainerBackend for MemoryContainers {
    async fn inspect(&self, name: &str) -> Result<ContainerSnapshot, LogsError> {
        self.containers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|container| container.snapshot.clone())
            .ok_or_else(|| LogsError::NotFound {
                container: name.to_string(),
            })
    }

    async fn acquire_logger(
        &self,
        container: &ContainerSnapshot,
    ) -> Result<AcquiredLogger, LogsError> {
        let containers = self.containers.read().unwrap_or_else(PoisonError::into_inner);
        let entry = containers
            .get(&container.name)
            .ok_or_else(|| LogsError::NotFound {
                container: container.name.clone(),
            })?;

        match (&entry.driver, entry.snapshot.running) {
            (Some(driver), true) => Ok(AcquiredLogger::cached(driver.clone())),
            _ => Ok(AcquiredLogger::owned(Arc::new(MemoryLogDriver::new(
                entry.buffer.clone(),
                self.config.watcher_capacity,
            )))),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::message::{LogStream, UtcDateTime};

    fn at(secs: i64) -> UtcDateTime {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn line(n: i64) -> LogMessage {
        LogMessage::new(LogStream::Stdout, format!("line {}\n", n), at(n))
    }

    fn driver_with(lines: i64) -> MemoryLogDriver {
        let buffer = Arc::new(LogBuffer::new(100));
        for n in 0..lines {
            buffer.append(line(n));
        }
        MemoryLogDriver::new(buffer, 16)
    }

    async fn drain(mut watcher: LogWatcher) -> Vec<LogMessage> {
        let mut out = Vec::new();
        while let Some(msg) = watcher.msgs.recv().await {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_buffer_evicts_oldest() {
        let buffer = LogBuffer::new(2);
        buffer.append(line(1));
        buffer.append(line(2));
        buffer.append(line(3));
        let (records, _) = buffer.snapshot_and_subscribe();
        assert_eq!(records, vec![line(2), line(3)]);
    }

    #[tokio::test]
    async fn test_read_all_history() {
        let driver = driver_with(5);
        let got = drain(driver.read_logs(ReadConfig::default())).await;
        assert_eq!(got.len(), 5);
        assert_eq!(got[0], line(0));
        assert_eq!(got[4], line(4));
    }

    #[tokio::test]
    async fn test_read_tail() {
        let driver = driver_with(5);
        let got = drain(driver.read_logs(ReadConfig {
            tail: Tail::Lines(2),
            ..Default::default()
        }))
        .await;
        assert_eq!(got, vec![line(3), line(4)]);

        let got = drain(driver.read_logs(ReadConfig {
            tail: Tail::Lines(0),
            ..Default::default()
        }))
        .await;
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_read_since() {
        let driver = driver_with(5);
        let got = drain(driver.read_logs(ReadConfig {
            since: Some(at(3)),
            ..Default::default()
        }))
        .await;
        assert_eq!(got, vec![line(3), line(4)]);
    }

    #[tokio::test]
    async fn test_follow_receives_new_records_until_closed() {
        let driver = driver_with(1);
        let mut watcher = driver.read_logs(ReadConfig {
            follow: true,
            ..Default::default()
        });

        assert_eq!(watcher.msgs.recv().await, Some(line(0)));
        driver.log(line(1)).unwrap();
        assert_eq!(watcher.msgs.recv().await, Some(line(1)));

        driver.close().await.unwrap();
        assert_eq!(watcher.msgs.recv().await, None);
        assert!(matches!(
            driver.log(line(2)),
            Err(LogDriverError::AlreadyClosed)
        ));
    }

    #[tokio::test]
    async fn test_double_close_is_reported() {
        let driver = driver_with(0);
        driver.close().await.unwrap();
        assert!(matches!(
            driver.close().await,
            Err(LogDriverError::AlreadyClosed)
        ));
    }

    #[tokio::test]
    async fn test_registry_acquisition_ownership() {
        let containers = MemoryContainers::default();
        containers.create("web", MEMORY_DRIVER).unwrap();
        containers
            .log("web", LogMessage::new(LogStream::Stderr, "boot\n", Utc::now()))
            .unwrap();

        let stopped = containers.inspect("web").await.unwrap();
        assert!(!stopped.running);
        let logger = containers.acquire_logger(&stopped).await.unwrap();
        assert!(logger.owned);

        containers.start("web").unwrap();
        let running = containers.inspect("web").await.unwrap();
        let first = containers.acquire_logger(&running).await.unwrap();
        let second = containers.acquire_logger(&running).await.unwrap();
        assert!(!first.owned);
        assert!(Arc::ptr_eq(&first.driver, &second.driver));

        let history = drain(first.driver.reader().unwrap().read_logs(ReadConfig::default())).await;
        assert_eq!(history.len(), 1);
        assert_eq!(&history[0].line[..], b"boot\n");
    }

    #[tokio::test]
    async fn test_stop_ends_followers() {
        let containers = MemoryContainers::default();
        containers.create("web", MEMORY_DRIVER).unwrap();
        containers.start("web").unwrap();

        let running = containers.inspect("web").await.unwrap();
        let logger = containers.acquire_logger(&running).await.unwrap();
        let mut watcher = logger.driver.reader().unwrap().read_logs(ReadConfig {
            follow: true,
            since: Some(Utc::now() - Duration::hours(1)),
            ..Default::default()
        });

        containers.stop("web").await.unwrap();
        assert_eq!(watcher.msgs.recv().await, None);
        assert!(!containers.inspect("web").await.unwrap().running);
    }

    #[tokio::test]
    async fn test_restart_keeps_cached_driver() {
        let containers = MemoryContainers::default();
        containers.create("web", MEMORY_DRIVER).unwrap();
        containers.start("web").unwrap();

        let running = containers.inspect("web").await.unwrap();
        let logger = containers.acquire_logger(&running).await.unwrap();
        let mut watcher = logger.driver.reader().unwrap().read_logs(ReadConfig {
            follow: true,
            ..Default::default()
        });

        containers.start("web").unwrap();
        let again = containers.acquire_logger(&running).await.unwrap();
        assert!(Arc::ptr_eq(&logger.driver, &again.driver));

        containers
            .log("web", LogMessage::new(LogStream::Stdout, "still here\n", Utc::now()))
            .unwrap();
        let msg = watcher.msgs.recv().await.unwrap();
        assert_eq!(&msg.line[..], b"still here\n");

        containers.stop("web").await.unwrap();
        assert_eq!(watcher.msgs.recv().await, None);
    }

    #[tokio::test]
    async fn test_create_twice_is_a_conflict() {
        let containers = MemoryContainers::default();
        containers.create("web", MEMORY_DRIVER).unwrap();
        containers.start("web").unwrap();

        assert!(matches!(
            containers.create("web", "none"),
            Err(LogsError::Conflict { .. })
        ));
        let snapshot = containers.inspect("web").await.unwrap();
        assert!(snapshot.running);
        assert_eq!(snapshot.log_driver, MEMORY_DRIVER);
    }

    #[tokio::test]
    async fn test_unknown_container() {
        let containers = MemoryContainers::default();
        assert!(matches!(
            containers.inspect("ghost").await,
            Err(LogsError::NotFound { .. })
        ));
        assert!(matches!(containers.start("ghost"), Err(LogsError::NotFound { .. })));
    }
}
