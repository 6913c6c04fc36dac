use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    client::CounterClient,
    config::{Backend, Config},
    database::{RedisStore, init_redis},
    error::AppError,
    memory::MemoryStore,
    model::{CounterKey, CounterRecord},
    registry::{Registry, Subscription},
    store::{ChangeLog, CounterStore, StoreError},
    writer::{BatchWriter, WriteSummary},
};

pub struct State {
    pub config: Config,
    pub client: CounterClient,
    pub writer: BatchWriter,
    pub registry: Arc<Registry>,
    pub change_log: Arc<dyn ChangeLog>,
}

impl State {
    pub async fn new(config: Config) -> Result<Arc<Self>, AppError> {
        match config.backend {
            Backend::Redis => {
                let connection = init_redis(&config.store.redis_url)
                    .await
                    .map_err(StoreError::from)?;
                let store = Arc::new(RedisStore::new(connection, &config.store));

                Ok(Self::with_stores(config, store.clone(), store))
            }
            Backend::Memory => {
                warn!("Using the in-memory store, hearts are lost on restart");
                let store = Arc::new(MemoryStore::new(
                    &config.store.change_log,
                    config.store.partitions,
                ));

                Ok(Self::with_stores(config, store.clone(), store))
            }
        }
    }

    pub fn with_stores(
        config: Config,
        store: Arc<dyn CounterStore>,
        change_log: Arc<dyn ChangeLog>,
    ) -> Arc<Self> {
        let registry = Arc::new(Registry::new(config.pipeline.subscriber_buffer));

        Arc::new(Self {
            client: CounterClient::new(store.clone()),
            writer: BatchWriter::new(store, config.writer.clone()),
            registry,
            change_log,
            config,
        })
    }

    pub fn subscribe(&self, keys: Vec<CounterKey>) -> Subscription {
        self.registry.subscribe(keys)
    }

    pub async fn increment(&self, key: &CounterKey) -> Result<CounterRecord, AppError> {
        Ok(self.client.increment(key).await?)
    }

    pub async fn lookup(&self, keys: &[CounterKey]) -> Result<Vec<CounterRecord>, AppError> {
        Ok(self.client.batch_lookup(keys).await?)
    }

    pub async fn put_all(&self, records: &[CounterRecord]) -> WriteSummary {
        info!("Putting {} heart counts", records.len());

        self.writer.put_all(records).await
    }
}
