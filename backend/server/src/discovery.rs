//! # Partition discovery
//!
//! Partitions only ever get added, so discovery is a periodic diff:
//!
//! 1. List the change log's partitions
//! 2. For each one not owned yet, open a cursor at the latest position (no backfill),
//!    start a [`Poller`] and a forwarder into the unified channel, mark it owned
//! 3. Owned partitions are never revisited, even if their poller has stopped
//!
//! On shutdown every poller is cancelled and the loop drops its unified sender. The unified
//! channel closes once the last forwarder drains its poller's channel.
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use tokio::{
    select,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{info, warn};

use crate::{
    config::PipelineConfig,
    model::{Cursor, PartitionId, RawChangeRecord},
    poller::{Poller, PollerExit},
    store::{ChangeLog, StartPosition},
    utils::cancelled,
};

struct PollerState {
    cancel: watch::Sender<bool>,
    poller: JoinHandle<PollerExit>,
    forwarder: JoinHandle<()>,
}

pub struct Discovery {
    log: Arc<dyn ChangeLog>,
    config: PipelineConfig,
    pollers: HashMap<PartitionId, PollerState>,
    unified: mpsc::Sender<RawChangeRecord>,
    active: Arc<AtomicUsize>,
}

impl Discovery {
    pub fn new(
        log: Arc<dyn ChangeLog>,
        config: PipelineConfig,
        unified: mpsc::Sender<RawChangeRecord>,
        active: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            log,
            config,
            pollers: HashMap::new(),
            unified,
            active,
        }
    }

    pub fn owns(&self, partition: &PartitionId) -> bool {
        self.pollers.contains_key(partition)
    }

    pub fn owned(&self) -> usize {
        self.pollers.len()
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.discovery_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                biased;
                _ = cancelled(&mut shutdown) => break,
                _ = ticker.tick() => {
                    self.discover().await;
                }
            }
        }

        self.shutdown();
    }

    /// One discovery pass, returns how many pollers it started.
    pub async fn discover(&mut self) -> usize {
        let partitions = match self.log.list_partitions().await {
            Ok(partitions) => partitions,
            Err(e) => {
                warn!("Failed to list change log partitions, retrying next tick: {e}");
                return 0;
            }
        };

        let mut started = 0;
        for partition in partitions {
            if self.owns(&partition) {
                continue;
            }

            let cursor = match self.log.open_cursor(&partition, StartPosition::Latest).await {
                Ok(cursor) => cursor,
                Err(e) => {
                    warn!(partition = %partition, "Failed to open cursor, retrying next tick: {e}");
                    continue;
                }
            };

            info!(partition = %partition, "Processing new partition");
            let state = self.spawn(partition.clone(), cursor);
            self.pollers.insert(partition, state);
            started += 1;
        }

        info!(
            "{} partition pollers active, {} owned",
            self.active.load(Ordering::Relaxed),
            self.pollers.len()
        );

        started
    }

    fn spawn(&self, partition: PartitionId, cursor: Cursor) -> PollerState {
        let (output, mut records) = mpsc::channel(self.config.poller_buffer.max(1));
        let (cancel, cancel_rx) = watch::channel(false);

        let poller = Poller {
            log: self.log.clone(),
            partition: partition.clone(),
            fetch_batch: self.config.fetch_batch.max(1),
            empty_backoff: self.config.empty_poll_backoff,
        };

        self.active.fetch_add(1, Ordering::Relaxed);
        let poller = tokio::spawn(poller.run(cursor, output, cancel_rx));

        let unified = self.unified.clone();
        let active = self.active.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(record) = records.recv().await {
                if unified.send(record).await.is_err() {
                    break;
                }
            }

            active.fetch_sub(1, Ordering::Relaxed);
            info!(partition = %partition, "Closed records");
        });

        PollerState {
            cancel,
            poller,
            forwarder,
        }
    }

    fn shutdown(self) {
        for (partition, state) in &self.pollers {
            state.cancel.send_replace(true);

            if state.poller.is_finished() && !state.forwarder.is_finished() {
                info!(partition = %partition, "Poller already stopped, forwarder draining");
            }
        }

        info!(
            "Stopped discovery, cancelled {} partition pollers",
            self.pollers.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::time::timeout;

    use super::*;
    use crate::store::{Fetched, StoreError, StoreResult};

    /// Lists whatever partitions the test sets, never yields records.
    #[derive(Default)]
    struct ListedLog {
        partitions: Mutex<Vec<PartitionId>>,
        cursor_failures: Mutex<usize>,
        opened: Mutex<Vec<PartitionId>>,
    }

    #[async_trait]
    impl ChangeLog for ListedLog {
        async fn list_partitions(&self) -> StoreResult<Vec<PartitionId>> {
            Ok(self.partitions.lock().clone())
        }

        async fn open_cursor(
            &self,
            partition: &PartitionId,
            _start: StartPosition,
        ) -> StoreResult<Cursor> {
            let mut failures = self.cursor_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(StoreError::Unavailable("describe failed".to_string()));
            }

            self.opened.lock().push(partition.clone());
            Ok(Cursor::new("0"))
        }

        async fn fetch_next(
            &self,
            _partition: &PartitionId,
            cursor: &Cursor,
            _max: usize,
        ) -> StoreResult<Fetched> {
            Ok(Fetched {
                records: Vec::new(),
                next: Some(cursor.clone()),
            })
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            discovery_interval: Duration::from_millis(10),
            empty_poll_backoff: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn discovery(log: Arc<ListedLog>) -> (Discovery, mpsc::Receiver<RawChangeRecord>) {
        let (unified, records) = mpsc::channel(8);
        let discovery = Discovery::new(log, config(), unified, Arc::default());

        (discovery, records)
    }

    #[tokio::test]
    async fn test_same_partition_polled_once() {
        let log = Arc::new(ListedLog::default());
        *log.partitions.lock() = vec![PartitionId::new("hearts:changes:0")];
        let (mut discovery, _records) = discovery(log.clone());

        assert_eq!(discovery.discover().await, 1);
        assert_eq!(discovery.discover().await, 0);

        assert_eq!(*log.opened.lock(), vec![PartitionId::new("hearts:changes:0")]);
        assert_eq!(discovery.owned(), 1);
        assert_eq!(discovery.active.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_new_partitions_picked_up() {
        let log = Arc::new(ListedLog::default());
        *log.partitions.lock() = vec![PartitionId::new("hearts:changes:0")];
        let (mut discovery, _records) = discovery(log.clone());
        discovery.discover().await;

        log.partitions
            .lock()
            .push(PartitionId::new("hearts:changes:1"));
        assert_eq!(discovery.discover().await, 1);

        assert!(discovery.owns(&PartitionId::new("hearts:changes:0")));
        assert!(discovery.owns(&PartitionId::new("hearts:changes:1")));
    }

    #[tokio::test]
    async fn test_cursor_failure_retried_next_tick() {
        let log = Arc::new(ListedLog {
            cursor_failures: Mutex::new(1),
            ..Default::default()
        });
        *log.partitions.lock() = vec![PartitionId::new("hearts:changes:0")];
        let (mut discovery, _records) = discovery(log.clone());

        assert_eq!(discovery.discover().await, 0);
        assert_eq!(discovery.owned(), 0);
        assert_eq!(discovery.discover().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_unified() {
        let log = Arc::new(ListedLog::default());
        *log.partitions.lock() = vec![
            PartitionId::new("hearts:changes:0"),
            PartitionId::new("hearts:changes:1"),
        ];
        let (discovery, mut records) = discovery(log);
        let active = discovery.active.clone();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(discovery.run(shutdown_rx));
        while active.load(Ordering::Relaxed) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        shutdown.send_replace(true);
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        assert!(
            timeout(Duration::from_secs(5), records.recv())
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(active.load(Ordering::Relaxed), 0);
    }
}
