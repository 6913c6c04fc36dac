//! # In-process store
//!
//! Same contract as Redis without the network: one counter map and a change
//! log split into partitions. Partitions appear the first time a key hashed to
//! them is written, which matches how streams appear in Redis.
//!
//! A closed partition takes no more writes. Its shard moves on to a successor
//! partition (`{prefix}:{shard}.{generation}`) that discovery picks up like any other.
//!
//! Used for local runs (`STORE_BACKEND=memory`) and end-to-end tests.
use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    model::{CounterKey, CounterRecord, Cursor, PartitionId, RawChangeRecord},
    store::{
        ChangeLog, CounterStore, Fetched, StartPosition, StoreError, StoreResult, partition_index,
    },
};

pub struct MemoryStore {
    prefix: String,
    inner: Mutex<Inner>,
}

struct Inner {
    partitions: usize,
    counts: HashMap<CounterKey, u64>,
    logs: HashMap<PartitionId, Log>,
    /// Shard index to its current generation, absent means 0.
    generations: HashMap<usize, usize>,
}

#[derive(Default)]
struct Log {
    records: Vec<RawChangeRecord>,
    closed: bool,
}

impl MemoryStore {
    pub fn new(prefix: &str, partitions: usize) -> Self {
        Self {
            prefix: prefix.to_string(),
            inner: Mutex::new(Inner {
                partitions: partitions.max(1),
                counts: HashMap::new(),
                logs: HashMap::new(),
                generations: HashMap::new(),
            }),
        }
    }

    /// Partition the next write of `key` lands in.
    pub fn partition_for(&self, key: &CounterKey) -> PartitionId {
        let inner = self.inner.lock();
        self.current(&inner, partition_index(key, inner.partitions))
    }

    /// Changes the shard count for future writes. Existing partitions stay.
    pub fn reshard(&self, partitions: usize) {
        self.inner.lock().partitions = partitions.max(1);
    }

    /// Stops a partition from accepting writes; pollers see it as finished once drained.
    /// Later writes for its shard go to a fresh successor partition.
    pub fn close_partition(&self, partition: &PartitionId) {
        let mut inner = self.inner.lock();
        match inner.logs.get_mut(partition) {
            Some(log) => log.closed = true,
            None => return,
        }

        let shards: Vec<usize> = (0..inner.partitions)
            .filter(|&index| self.current(&inner, index) == *partition)
            .collect();
        for index in shards {
            *inner.generations.entry(index).or_default() += 1;
        }
    }

    /// Appends a record as-is, including ones that do not decode.
    pub fn append_raw(&self, partition: &PartitionId, fields: HashMap<String, String>) {
        let mut inner = self.inner.lock();
        let log = inner.logs.entry(partition.clone()).or_default();
        let id = log.records.len().to_string();

        log.records.push(RawChangeRecord {
            partition: partition.clone(),
            id,
            fields,
        });
    }

    fn current(&self, inner: &Inner, index: usize) -> PartitionId {
        match inner.generations.get(&index).copied().unwrap_or(0) {
            0 => PartitionId::new(format!("{}:{}", self.prefix, index)),
            generation => PartitionId::new(format!("{}:{}.{}", self.prefix, index, generation)),
        }
    }

    fn write(&self, inner: &mut Inner, record: &CounterRecord) {
        let partition = self.current(inner, partition_index(&record.key, inner.partitions));
        let log = inner.logs.entry(partition.clone()).or_default();
        let id = log.records.len().to_string();

        log.records
            .push(RawChangeRecord::new_image(partition, id, record));
        inner.counts.insert(record.key.clone(), record.count);
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &CounterKey) -> StoreResult<u64> {
        let mut inner = self.inner.lock();
        let count = inner
            .counts
            .get(key)
            .copied()
            .unwrap_or(0)
            .checked_add(1)
            .ok_or_else(|| StoreError::Overflow(key.clone()))?;

        self.write(&mut inner, &CounterRecord::new(key.clone(), count));

        Ok(count)
    }

    async fn batch_get(&self, keys: &[CounterKey]) -> StoreResult<Vec<Option<u64>>> {
        let inner = self.inner.lock();

        Ok(keys.iter().map(|key| inner.counts.get(key).copied()).collect())
    }

    async fn batch_put(&self, chunk: &[CounterRecord]) -> StoreResult<Vec<CounterRecord>> {
        let mut inner = self.inner.lock();
        for record in chunk {
            self.write(&mut inner, record);
        }

        Ok(Vec::new())
    }

    async fn put(&self, record: &CounterRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        self.write(&mut inner, record);

        Ok(())
    }
}

#[async_trait]
impl ChangeLog for MemoryStore {
    async fn list_partitions(&self) -> StoreResult<Vec<PartitionId>> {
        let mut partitions: Vec<PartitionId> = self.inner.lock().logs.keys().cloned().collect();
        partitions.sort();

        Ok(partitions)
    }

    async fn open_cursor(
        &self,
        partition: &PartitionId,
        start: StartPosition,
    ) -> StoreResult<Cursor> {
        let inner = self.inner.lock();
        let log = inner
            .logs
            .get(partition)
            .ok_or_else(|| StoreError::UnknownPartition(partition.clone()))?;

        let position = match start {
            StartPosition::Latest => log.records.len(),
            StartPosition::Earliest => 0,
        };

        Ok(Cursor::new(position.to_string()))
    }

    async fn fetch_next(
        &self,
        partition: &PartitionId,
        cursor: &Cursor,
        max: usize,
    ) -> StoreResult<Fetched> {
        let position: usize = cursor
            .as_str()
            .parse()
            .map_err(|_| StoreError::InvalidCursor(cursor.as_str().to_string()))?;

        let inner = self.inner.lock();
        let log = inner
            .logs
            .get(partition)
            .ok_or_else(|| StoreError::UnknownPartition(partition.clone()))?;

        let end = log.records.len().min(position.saturating_add(max));
        let records = log.records.get(position..end).unwrap_or_default().to_vec();

        let next = if log.closed && end >= log.records.len() {
            None
        } else {
            Some(Cursor::new(end.max(position).to_string()))
        };

        Ok(Fetched { records, next })
    }
}
