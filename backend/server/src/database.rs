//! # Redis
//!
//! RAM database.
//!
//! Core purpose is to store food heart counts and publish every change to live listeners.
//!
//! ## Requirements
//!
//! - Fast lookups and atomic increments
//! - Decent number of food-int pairs ~2000 as an estimated n
//! - Every write visible to the change log, per food in write order
//!
//! ## Implementation
//!
//! - Redis hash: 1 big key (`hearts`), then food-count pairs
//! - Change log: N Redis streams (`hearts:changes:{n}`), food hashed onto one of them
//! - Each stream entry is the new image of the counter: `key` + `count`
//! - Streams register themselves in a set (`hearts:changes:partitions`) on first write,
//!   so new partitions show up as soon as they are written to
//! - Increment is a Lua script, counter and change log move together
use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use redis::{
    AsyncCommands, Client, RedisError, Script,
    aio::{ConnectionManager, ConnectionManagerConfig},
    from_redis_value,
    streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply},
};
use tracing::warn;

use crate::{
    config::StoreConfig,
    model::{COUNT_FIELD, CounterKey, CounterRecord, Cursor, KEY_FIELD, PartitionId, RawChangeRecord},
    store::{ChangeLog, CounterStore, Fetched, StartPosition, StoreResult, partition_index},
};

const INCREMENT_SCRIPT: &str = r#"
    local count = redis.call('HINCRBY', KEYS[1], ARGV[1], 1)
    redis.call('XADD', KEYS[2], '*', 'key', ARGV[1], 'count', count)
    redis.call('SADD', KEYS[3], KEYS[2])
    return count
"#;

const STREAM_START: &str = "0-0";

pub async fn init_redis(redis_url: &str) -> Result<ConnectionManager, RedisError> {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(100));

    let client = Client::open(redis_url)?;

    client.get_connection_manager_with_config(config).await
}

pub struct RedisStore {
    connection: ConnectionManager,
    hearts_table: String,
    change_log: String,
    partition_set: String,
    partitions: usize,
    increment_script: Script,
}

impl RedisStore {
    pub fn new(connection: ConnectionManager, config: &StoreConfig) -> Self {
        Self {
            connection,
            hearts_table: config.hearts_table.clone(),
            change_log: config.change_log.clone(),
            partition_set: format!("{}:partitions", config.change_log),
            partitions: config.partitions,
            increment_script: Script::new(INCREMENT_SCRIPT),
        }
    }

    fn stream_for(&self, key: &CounterKey) -> String {
        format!(
            "{}:{}",
            self.change_log,
            partition_index(key, self.partitions)
        )
    }

    async fn write(&self, records: &[CounterRecord]) -> StoreResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();

        for record in records {
            let stream = self.stream_for(&record.key);
            let count = record.count.to_string();

            pipe.hset(&self.hearts_table, record.key.as_str(), record.count)
                .ignore()
                .xadd(
                    &stream,
                    "*",
                    &[(KEY_FIELD, record.key.as_str()), (COUNT_FIELD, count.as_str())],
                )
                .ignore()
                .sadd(&self.partition_set, &stream)
                .ignore();
        }

        let mut connection = self.connection.clone();
        pipe.query_async::<()>(&mut connection).await?;

        Ok(())
    }
}

fn to_raw(partition: &PartitionId, entry: StreamId) -> RawChangeRecord {
    let fields = entry
        .map
        .iter()
        .filter_map(|(field, value)| match from_redis_value::<String>(value) {
            Ok(value) => Some((field.clone(), value)),
            Err(e) => {
                warn!(partition = %partition, id = %entry.id, "Skipping field {field}: {e}");
                None
            }
        })
        .collect::<HashMap<_, _>>();

    RawChangeRecord {
        partition: partition.clone(),
        id: entry.id,
        fields,
    }
}

/// Newest entry of an `XREVRANGE ... COUNT 1` reply, or the stream start when empty.
fn latest_cursor(reply: StreamRangeReply) -> Cursor {
    let last = reply
        .ids
        .into_iter()
        .next()
        .map(|entry| entry.id)
        .unwrap_or_else(|| STREAM_START.to_string());

    Cursor::new(last)
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &CounterKey) -> StoreResult<u64> {
        let stream = self.stream_for(key);
        let mut connection = self.connection.clone();

        let count: u64 = self
            .increment_script
            .key(&self.hearts_table)
            .key(&stream)
            .key(&self.partition_set)
            .arg(key.as_str())
            .invoke_async(&mut connection)
            .await?;

        Ok(count)
    }

    async fn batch_get(&self, keys: &[CounterKey]) -> StoreResult<Vec<Option<u64>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let fields: Vec<&str> = keys.iter().map(CounterKey::as_str).collect();
        let mut connection = self.connection.clone();

        let counts: Vec<Option<u64>> = redis::cmd("HMGET")
            .arg(&self.hearts_table)
            .arg(&fields)
            .query_async(&mut connection)
            .await?;

        Ok(counts)
    }

    async fn batch_put(&self, chunk: &[CounterRecord]) -> StoreResult<Vec<CounterRecord>> {
        // MULTI/EXEC is all or nothing, nothing is ever left unprocessed
        self.write(chunk).await?;

        Ok(Vec::new())
    }

    async fn put(&self, record: &CounterRecord) -> StoreResult<()> {
        self.write(std::slice::from_ref(record)).await
    }
}

#[async_trait]
impl ChangeLog for RedisStore {
    async fn list_partitions(&self) -> StoreResult<Vec<PartitionId>> {
        let mut connection = self.connection.clone();
        let mut streams: Vec<String> = connection.smembers(&self.partition_set).await?;
        streams.sort();

        Ok(streams.into_iter().map(PartitionId::new).collect())
    }

    async fn open_cursor(
        &self,
        partition: &PartitionId,
        start: StartPosition,
    ) -> StoreResult<Cursor> {
        if start == StartPosition::Earliest {
            return Ok(Cursor::new(STREAM_START));
        }

        let mut connection = self.connection.clone();
        let reply: StreamRangeReply = connection
            .xrevrange_count(partition.as_str(), "+", "-", 1)
            .await?;

        Ok(latest_cursor(reply))
    }

    async fn fetch_next(
        &self,
        partition: &PartitionId,
        cursor: &Cursor,
        max: usize,
    ) -> StoreResult<Fetched> {
        let options = StreamReadOptions::default().count(max);
        let mut connection = self.connection.clone();

        let reply: Option<StreamReadReply> = connection
            .xread_options(&[partition.as_str()], &[cursor.as_str()], &options)
            .await?;

        let records: Vec<RawChangeRecord> = reply
            .map(|reply| reply.keys)
            .unwrap_or_default()
            .into_iter()
            .flat_map(|stream| stream.ids)
            .map(|entry| to_raw(partition, entry))
            .collect();

        let next = records
            .last()
            .map(|record| Cursor::new(record.id.clone()))
            .unwrap_or_else(|| cursor.clone());

        // Streams are never closed, a cursor always exists
        Ok(Fetched {
            records,
            next: Some(next),
        })
    }
}
