//! # Store
//!
//! Seams between the pipeline and whatever holds the counters.
//!
//! - [`CounterStore`]: counter reads/writes, atomic increments
//! - [`ChangeLog`]: append-only partitions of every counter write
//!
//! Both are implemented by Redis ([`crate::database::RedisStore`]) and by an
//! in-process store ([`crate::memory::MemoryStore`]).
use async_trait::async_trait;
use thiserror::Error;

use crate::model::{CounterKey, CounterRecord, Cursor, PartitionId, RawChangeRecord};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown partition: {0}")]
    UnknownPartition(PartitionId),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Count for {0} would overflow")]
    Overflow(CounterKey),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartPosition {
    /// Only records written after the cursor was opened.
    Latest,
    Earliest,
}

#[derive(Debug, Default)]
pub struct Fetched {
    pub records: Vec<RawChangeRecord>,
    /// `None` once the partition is closed and will never yield again.
    pub next: Option<Cursor>,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Adds one to `key` (starting from zero) and returns the new count.
    async fn increment(&self, key: &CounterKey) -> StoreResult<u64>;

    /// One entry per key, `None` where the key was never written.
    async fn batch_get(&self, keys: &[CounterKey]) -> StoreResult<Vec<Option<u64>>>;

    /// Writes one chunk, returning the records the store left unprocessed.
    async fn batch_put(&self, chunk: &[CounterRecord]) -> StoreResult<Vec<CounterRecord>>;

    async fn put(&self, record: &CounterRecord) -> StoreResult<()>;
}

#[async_trait]
pub trait ChangeLog: Send + Sync {
    async fn list_partitions(&self) -> StoreResult<Vec<PartitionId>>;

    async fn open_cursor(
        &self,
        partition: &PartitionId,
        start: StartPosition,
    ) -> StoreResult<Cursor>;

    async fn fetch_next(
        &self,
        partition: &PartitionId,
        cursor: &Cursor,
        max: usize,
    ) -> StoreResult<Fetched>;
}

/// Stable shard for a key, FNV-1a so every process agrees on it.
pub fn partition_index(key: &CounterKey, partitions: usize) -> usize {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in key.as_str().bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }

    (hash % partitions.max(1) as u64) as usize
}
