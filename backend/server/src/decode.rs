use crate::{
    error::DecodeError,
    model::{COUNT_FIELD, CounterChangeEvent, CounterKey, KEY_FIELD, RawChangeRecord},
};

/// Reads the new image of a counter out of a change log record.
pub fn decode(record: &RawChangeRecord) -> Result<CounterChangeEvent, DecodeError> {
    let key = record
        .fields
        .get(KEY_FIELD)
        .filter(|key| !key.is_empty())
        .ok_or(DecodeError::MissingField(KEY_FIELD))?;

    let count = record
        .fields
        .get(COUNT_FIELD)
        .ok_or(DecodeError::MissingField(COUNT_FIELD))?;

    let count = count
        .trim()
        .parse::<u64>()
        .map_err(|_| DecodeError::InvalidCount(count.clone()))?;

    Ok(CounterChangeEvent {
        key: CounterKey::new(key.as_str()),
        count,
    })
}
