use tokio::sync::watch;

use crate::model::CounterKey;

/// Resolves once the signal is raised or its sender is gone.
pub async fn cancelled(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|raised| *raised).await;
}

/// Keys from clients are matched case and spacing insensitive.
pub fn normalize_key(input: &str) -> Option<CounterKey> {
    let key = input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    if key.is_empty() {
        return None;
    }

    Some(CounterKey::new(key))
}

pub fn normalize_keys<'a>(inputs: impl IntoIterator<Item = &'a str>) -> Vec<CounterKey> {
    let mut keys: Vec<CounterKey> = Vec::new();

    for key in inputs.into_iter().filter_map(normalize_key) {
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    keys
}

/// Comma separated keys from a query string.
pub fn parse_keys(query: &str) -> Vec<CounterKey> {
    normalize_keys(query.split(','))
}
