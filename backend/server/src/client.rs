use std::sync::Arc;

use crate::{
    model::{CounterKey, CounterRecord},
    store::{CounterStore, StoreError},
};

/// Typed access to single counters.
#[derive(Clone)]
pub struct CounterClient {
    store: Arc<dyn CounterStore>,
}

impl CounterClient {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    pub async fn increment(&self, key: &CounterKey) -> Result<CounterRecord, StoreError> {
        let count = self.store.increment(key).await?;

        Ok(CounterRecord {
            key: key.clone(),
            count,
        })
    }

    /// One record per key in order, unknown keys come back with a zero count.
    pub async fn batch_lookup(&self, keys: &[CounterKey]) -> Result<Vec<CounterRecord>, StoreError> {
        let counts = self.store.batch_get(keys).await?;

        Ok(keys
            .iter()
            .enumerate()
            .map(|(index, key)| CounterRecord {
                key: key.clone(),
                count: counts.get(index).copied().flatten().unwrap_or(0),
            })
            .collect())
    }
}
