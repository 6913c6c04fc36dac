//! # Hearts
//!
//! Shapes shared by the store, the change log pipeline and the routes.
//!
//! - A food is identified by its sanitized name, the **key**
//! - A food's **count** is its number of hearts, only ever incremented by users
//! - Every counter write lands in one change log partition as a raw record with
//!   the new image of the counter: `key` (**string**) and `count` (**int**)
use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};

pub const KEY_FIELD: &str = "key";
pub const COUNT_FIELD: &str = "count";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CounterKey(String);

impl CounterKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CounterKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    pub key: CounterKey,
    pub count: u64,
}

impl CounterRecord {
    pub fn new(key: impl Into<CounterKey>, count: u64) -> Self {
        Self {
            key: key.into(),
            count,
        }
    }
}

/// Decoded unit of delivery to live observers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CounterChangeEvent {
    pub key: CounterKey,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(String);

impl PartitionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position inside one partition. Records strictly after it are fetched next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(position: impl Into<String>) -> Self {
        Self(position.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One entry of a change log partition, fields exactly as the store wrote them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawChangeRecord {
    pub partition: PartitionId,
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl RawChangeRecord {
    pub fn new_image(partition: PartitionId, id: impl Into<String>, record: &CounterRecord) -> Self {
        let fields = HashMap::from([
            (KEY_FIELD.to_string(), record.key.as_str().to_string()),
            (COUNT_FIELD.to_string(), record.count.to_string()),
        ]);

        Self {
            partition,
            id: id.into(),
            fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_record_json() {
        let record: CounterRecord =
            serde_json::from_str(r#"{"key": "fried rice", "count": 12}"#).unwrap();
        assert_eq!(record, CounterRecord::new("fried rice", 12));

        let event = CounterChangeEvent {
            key: record.key,
            count: 13,
        };
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"key":"fried rice","count":13}"#
        );
    }
}
