use std::sync::Arc;

use axum::{
    Json,
    extract::{self, Query},
    http::StatusCode,
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::{Stream, stream};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{
    error::AppError,
    model::CounterRecord,
    state::State,
    utils::{normalize_key, parse_keys},
};

#[derive(Deserialize)]
pub struct HeartsRequest {
    pub keys: Vec<String>,
}

#[derive(Deserialize)]
pub struct KeysQuery {
    pub keys: String,
}

#[derive(Deserialize)]
pub struct PutRequest {
    pub records: Vec<CounterRecord>,
}

#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct HeartsReply {
    pub counts: Vec<CounterRecord>,
}

pub async fn add_hearts_handler(
    extract::State(state): extract::State<Arc<State>>,
    Json(payload): Json<HeartsRequest>,
) -> Result<Json<HeartsReply>, AppError> {
    // One heart per listed key, repeats included
    let keys: Vec<_> = payload
        .keys
        .iter()
        .map(String::as_str)
        .filter_map(normalize_key)
        .collect();
    if keys.is_empty() {
        return Err(AppError::MalformedPayload);
    }
    info!("AddHeart {} keys", keys.len());

    let mut counts = Vec::with_capacity(keys.len());
    let mut last_error = None;

    for key in &keys {
        match state.increment(key).await {
            Ok(record) => counts.push(record),
            Err(e) => {
                error!("Error adding heart to {key}: {e}");
                last_error = Some(e);
            }
        }
    }

    // Nothing was written at all, let the caller know
    if let Some(e) = last_error.filter(|_| counts.is_empty()) {
        return Err(e);
    }

    Ok(Json(HeartsReply { counts }))
}

pub async fn get_hearts_handler(
    extract::State(state): extract::State<Arc<State>>,
    Query(query): Query<KeysQuery>,
) -> Result<Json<HeartsReply>, AppError> {
    let keys = parse_keys(&query.keys);
    if keys.is_empty() {
        return Err(AppError::MalformedPayload);
    }

    let counts = state.lookup(&keys).await?;

    Ok(Json(HeartsReply { counts }))
}

pub async fn put_hearts_handler(
    extract::State(state): extract::State<Arc<State>>,
    Json(payload): Json<PutRequest>,
) -> impl IntoResponse {
    let summary = state.put_all(&payload.records).await;
    info!("PutHearts {} records, {} dropped", payload.records.len(), summary.dropped);

    StatusCode::NO_CONTENT
}

pub async fn stream_hearts_handler(
    extract::State(state): extract::State<Arc<State>>,
    Query(query): Query<KeysQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let keys = parse_keys(&query.keys);
    if keys.is_empty() {
        return Err(AppError::MalformedPayload);
    }

    let subscription = state.subscribe(keys);
    info!("StreamHearts opened {}", subscription.id());

    // Dropping the stream on disconnect drops the subscription, which unregisters it
    let events = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;

        Some((Event::default().json_data(&event), subscription))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
