//! # Partition poller
//!
//! One task per change log partition.
//!
//! - Fetch the next batch from the cursor, push records one at a time into the output channel
//! - Empty batch: sleep, then poll again (polling, not a long poll)
//! - Full output channel: wait, the merge stage sets the pace
//! - Fetch error: log and stop, that partition is left alone from then on
//! - Cancel: stop where we are, in-flight fetches are abandoned
//!
//! Returning drops the output sender, which is how downstream sees the poller finish.
use std::{sync::Arc, time::Duration};

use tokio::{
    select,
    sync::{mpsc, watch},
    time::sleep,
};
use tracing::{info, warn};

use crate::{
    model::{Cursor, PartitionId, RawChangeRecord},
    store::ChangeLog,
    utils::cancelled,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollerExit {
    Cancelled,
    /// The partition was closed by the store and fully drained.
    Exhausted,
    FetchFailed,
    OutputClosed,
}

pub struct Poller {
    pub log: Arc<dyn ChangeLog>,
    pub partition: PartitionId,
    pub fetch_batch: usize,
    pub empty_backoff: Duration,
}

impl Poller {
    pub async fn run(
        self,
        mut cursor: Cursor,
        output: mpsc::Sender<RawChangeRecord>,
        mut cancel: watch::Receiver<bool>,
    ) -> PollerExit {
        let partition = &self.partition;

        loop {
            if *cancel.borrow() {
                return PollerExit::Cancelled;
            }

            let fetched = select! {
                biased;
                _ = cancelled(&mut cancel) => return PollerExit::Cancelled,
                fetched = self.log.fetch_next(partition, &cursor, self.fetch_batch) => fetched,
            };

            let fetched = match fetched {
                Ok(fetched) => fetched,
                Err(e) => {
                    warn!(partition = %partition, "Failed to get records: {e}");
                    return PollerExit::FetchFailed;
                }
            };

            let empty = fetched.records.is_empty();

            for record in fetched.records {
                #[cfg(feature = "verbose")]
                info!(partition = %partition, id = %record.id, "Polled record");

                select! {
                    biased;
                    _ = cancelled(&mut cancel) => return PollerExit::Cancelled,
                    sent = output.send(record) => {
                        if sent.is_err() {
                            return PollerExit::OutputClosed;
                        }
                    }
                }
            }

            match fetched.next {
                Some(next) => cursor = next,
                None => {
                    info!(partition = %partition, "Partition closed, poller done");
                    return PollerExit::Exhausted;
                }
            }

            if empty {
                select! {
                    _ = cancelled(&mut cancel) => return PollerExit::Cancelled,
                    _ = sleep(self.empty_backoff) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use tokio::time::timeout;

    use super::*;
    use crate::{
        memory::MemoryStore,
        model::{CounterKey, CounterRecord},
        store::{CounterStore, Fetched, StartPosition, StoreError, StoreResult},
    };

    const WAIT: Duration = Duration::from_secs(5);

    struct BrokenLog;

    #[async_trait]
    impl ChangeLog for BrokenLog {
        async fn list_partitions(&self) -> StoreResult<Vec<PartitionId>> {
            Ok(Vec::new())
        }

        async fn open_cursor(
            &self,
            _partition: &PartitionId,
            _start: StartPosition,
        ) -> StoreResult<Cursor> {
            Ok(Cursor::new("0"))
        }

        async fn fetch_next(
            &self,
            _partition: &PartitionId,
            _cursor: &Cursor,
            _max: usize,
        ) -> StoreResult<Fetched> {
            Err(StoreError::Unavailable("expired iterator".to_string()))
        }
    }

    fn poller(log: Arc<dyn ChangeLog>, partition: PartitionId) -> Poller {
        Poller {
            log,
            partition,
            fetch_batch: 2,
            empty_backoff: Duration::from_millis(5),
        }
    }

    async fn seeded(key: &str, increments: usize) -> (Arc<MemoryStore>, PartitionId) {
        let store = Arc::new(MemoryStore::new("hearts:changes", 1));
        let key = CounterKey::from(key);
        for _ in 0..increments {
            store.increment(&key).await.unwrap();
        }
        let partition = store.partition_for(&key);

        (store, partition)
    }

    #[tokio::test]
    async fn test_records_in_partition_order() {
        let (store, partition) = seeded("cereal", 5).await;
        let (tx, mut rx) = mpsc::channel(16);
        let (cancel, cancel_rx) = watch::channel(false);

        let task = tokio::spawn(poller(store.clone(), partition).run(
            Cursor::new("0"),
            tx,
            cancel_rx,
        ));

        let mut counts = Vec::new();
        for _ in 0..5 {
            let record = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            counts.push(record.fields["count"].clone());
        }
        assert_eq!(counts, vec!["1", "2", "3", "4", "5"]);

        cancel.send_replace(true);
        assert_eq!(timeout(WAIT, task).await.unwrap().unwrap(), PollerExit::Cancelled);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_fetch_error_stops_poller() {
        let (tx, mut rx) = mpsc::channel(16);
        let (_cancel, cancel_rx) = watch::channel(false);

        let exit = timeout(
            WAIT,
            poller(Arc::new(BrokenLog), PartitionId::new("hearts:changes:0")).run(
                Cursor::new("0"),
                tx,
                cancel_rx,
            ),
        )
        .await
        .unwrap();

        assert_eq!(exit, PollerExit::FetchFailed);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_partition_exhausts() {
        let (store, partition) = seeded("muffin", 3).await;
        store.close_partition(&partition);
        let (tx, mut rx) = mpsc::channel(16);
        let (_cancel, cancel_rx) = watch::channel(false);

        let exit = timeout(WAIT, poller(store, partition).run(Cursor::new("0"), tx, cancel_rx))
            .await
            .unwrap();

        assert_eq!(exit, PollerExit::Exhausted);
        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[tokio::test]
    async fn test_cancel_while_output_full() {
        let (store, partition) = seeded("oatmeal", 4).await;
        let (tx, mut rx) = mpsc::channel(1);
        let (cancel, cancel_rx) = watch::channel(false);

        let task = tokio::spawn(poller(store, partition).run(Cursor::new("0"), tx, cancel_rx));

        // Nobody drains: the poller parks on the second send
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        cancel.send_replace(true);
        assert_eq!(timeout(WAIT, task).await.unwrap().unwrap(), PollerExit::Cancelled);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_partition_keeps_polling() {
        let store = Arc::new(MemoryStore::new("hearts:changes", 1));
        let key = CounterKey::from("yogurt");
        store
            .batch_put(&[CounterRecord::new("yogurt", 0)])
            .await
            .unwrap();
        let partition = store.partition_for(&key);
        let cursor = store
            .open_cursor(&partition, StartPosition::Latest)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(poller(store.clone(), partition.clone()).run(cursor, tx, cancel_rx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.increment(&key).await.unwrap();

        let record = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(record.partition, partition);
        assert_eq!(
            record.fields,
            HashMap::from([
                ("key".to_string(), "yogurt".to_string()),
                ("count".to_string(), "1".to_string()),
            ])
        );

        cancel.send_replace(true);
        assert_eq!(timeout(WAIT, task).await.unwrap().unwrap(), PollerExit::Cancelled);
    }
}
