//! # Bulk writes
//!
//! Best effort: every chunk is attempted, but an item that still fails after its
//! single individual retry is logged and dropped. Callers never see per-item errors.
//!
//! ## Policies
//! - [`RetryPolicy::UntilSuccess`]: a failed chunk is retried as-is after a fixed backoff,
//!   for as long as it takes
//! - [`RetryPolicy::Isolate`]: a failed chunk is not retried, its items are each retried alone
//!
//! Either way, items the store reports as unprocessed get one individual retry.
use std::sync::Arc;

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::{config::WriterConfig, model::CounterRecord, store::CounterStore};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    #[default]
    UntilSuccess,
    Isolate,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub chunks: usize,
    pub attempts: usize,
    pub isolated: usize,
    pub dropped: usize,
}

pub struct BatchWriter {
    store: Arc<dyn CounterStore>,
    config: WriterConfig,
    policy: RetryPolicy,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn CounterStore>, config: WriterConfig) -> Self {
        Self {
            store,
            config,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub async fn put_all(&self, records: &[CounterRecord]) -> WriteSummary {
        let limit = self.config.chunk_limit.max(1);
        let total = records.len().div_ceil(limit);

        let mut summary = WriteSummary::default();
        let mut isolated = Vec::new();
        let mut remaining = records.len();

        for (index, chunk) in records.chunks(limit).enumerate() {
            self.put_chunk(chunk, &mut summary, &mut isolated).await;

            remaining -= chunk.len();
            summary.chunks += 1;
            info!(
                "Batch put ({}/{}): {} items remaining",
                index + 1,
                total,
                remaining
            );
        }

        summary.isolated = isolated.len();
        for record in isolated {
            if let Err(e) = self.store.put(&record).await {
                error!("Dropping {} after individual retry: {e}", record.key);
                summary.dropped += 1;
            }
        }

        info!(
            "Batch put done: {} chunks, {} attempts, {} isolated, {} dropped",
            summary.chunks, summary.attempts, summary.isolated, summary.dropped
        );

        summary
    }

    async fn put_chunk(
        &self,
        chunk: &[CounterRecord],
        summary: &mut WriteSummary,
        isolated: &mut Vec<CounterRecord>,
    ) {
        loop {
            summary.attempts += 1;

            let e = match self.store.batch_put(chunk).await {
                Ok(unprocessed) => {
                    isolated.extend(unprocessed);
                    return;
                }
                Err(e) => e,
            };

            match self.policy {
                RetryPolicy::UntilSuccess => {
                    error!("Error batch putting items {e}");
                    error!("Retrying...");
                    sleep(self.config.chunk_backoff).await;
                }
                RetryPolicy::Isolate => {
                    warn!("Error batch putting items {e}, retrying each item alone");
                    isolated.extend_from_slice(chunk);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        model::CounterKey,
        store::{StoreError, StoreResult},
    };

    /// Fails the first `chunk_failures` batch calls and any `put` of a key in `bad_keys`.
    #[derive(Default)]
    struct ScriptedStore {
        chunk_failures: Mutex<usize>,
        unprocessed: Mutex<Vec<CounterRecord>>,
        bad_keys: Vec<CounterKey>,
        batches: Mutex<Vec<Vec<CounterRecord>>>,
        puts: Mutex<Vec<CounterRecord>>,
    }

    #[async_trait]
    impl CounterStore for ScriptedStore {
        async fn increment(&self, _key: &CounterKey) -> StoreResult<u64> {
            Ok(1)
        }

        async fn batch_get(&self, keys: &[CounterKey]) -> StoreResult<Vec<Option<u64>>> {
            Ok(vec![None; keys.len()])
        }

        async fn batch_put(&self, chunk: &[CounterRecord]) -> StoreResult<Vec<CounterRecord>> {
            self.batches.lock().push(chunk.to_vec());

            let mut failures = self.chunk_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(StoreError::Unavailable("throttled".to_string()));
            }

            Ok(std::mem::take(&mut *self.unprocessed.lock()))
        }

        async fn put(&self, record: &CounterRecord) -> StoreResult<()> {
            self.puts.lock().push(record.clone());

            if self.bad_keys.contains(&record.key) {
                return Err(StoreError::Unavailable("throttled".to_string()));
            }

            Ok(())
        }
    }

    fn records(n: usize) -> Vec<CounterRecord> {
        (0..n)
            .map(|i| CounterRecord::new(format!("food {i}").as_str(), i as u64))
            .collect()
    }

    fn writer(store: Arc<ScriptedStore>) -> BatchWriter {
        BatchWriter::new(
            store,
            WriterConfig {
                chunk_limit: 25,
                chunk_backoff: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn test_chunks_to_limit() {
        let store = Arc::new(ScriptedStore::default());
        let summary = writer(store.clone()).put_all(&records(37)).await;

        let batches = store.batches.lock();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 25);
        assert_eq!(batches[1].len(), 12);
        assert_eq!(batches[0][0].key, CounterKey::from("food 0"));
        assert_eq!(summary.chunks, 2);
        assert_eq!(summary.attempts, 2);
    }

    #[tokio::test]
    async fn test_failed_chunk_retried_whole() {
        let store = Arc::new(ScriptedStore {
            chunk_failures: Mutex::new(2),
            ..Default::default()
        });
        let input = records(10);
        let summary = writer(store.clone()).put_all(&input).await;

        let batches = store.batches.lock();
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|batch| *batch == input));
        assert!(store.puts.lock().is_empty());
        assert_eq!(
            summary,
            WriteSummary {
                chunks: 1,
                attempts: 3,
                isolated: 0,
                dropped: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_isolate_retries_each_item_once() {
        let store = Arc::new(ScriptedStore {
            chunk_failures: Mutex::new(1),
            bad_keys: vec![CounterKey::from("food 1")],
            ..Default::default()
        });
        let summary = writer(store.clone())
            .with_policy(RetryPolicy::Isolate)
            .put_all(&records(3))
            .await;

        assert_eq!(store.batches.lock().len(), 1);
        assert_eq!(*store.puts.lock(), records(3));
        assert_eq!(summary.isolated, 3);
        assert_eq!(summary.dropped, 1);
    }

    #[tokio::test]
    async fn test_unprocessed_items_retried_alone() {
        let leftover = CounterRecord::new("food 4", 4);
        let store = Arc::new(ScriptedStore {
            unprocessed: Mutex::new(vec![leftover.clone()]),
            ..Default::default()
        });
        let summary = writer(store.clone()).put_all(&records(5)).await;

        assert_eq!(*store.puts.lock(), vec![leftover]);
        assert_eq!(summary.isolated, 1);
        assert_eq!(summary.dropped, 0);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let store = Arc::new(ScriptedStore::default());
        let summary = writer(store.clone()).put_all(&[]).await;

        assert!(store.batches.lock().is_empty());
        assert_eq!(summary, WriteSummary::default());
    }
}
