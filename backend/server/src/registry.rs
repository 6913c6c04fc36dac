//! # Heart streams
//!
//! Live observers of heart counts, each interested in a handful of foods.
//!
//! ## Delivery
//! - Read lock over all subscribers, one `try_send` per interested subscriber
//! - Each subscriber has its own bounded buffer, a slow one never holds up the others
//! - A failed send raises that subscriber's cancel signal, nothing is removed under the read lock
//!
//! ## Teardown
//! Every subscriber gets a reaper task that waits on its cancel signal and then takes the
//! write lock to unregister it. Cancel is raised by a failed delivery, by
//! [`Subscription::close`], or by dropping the [`Subscription`].
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Weak},
};

use parking_lot::RwLock;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    error::DeliveryError,
    model::{CounterChangeEvent, CounterKey},
    utils::cancelled,
};

/// What to do when a subscriber's buffer is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    #[default]
    Disconnect,
    DropEvent,
}

struct Subscriber {
    interest: HashSet<CounterKey>,
    sink: mpsc::Sender<CounterChangeEvent>,
    cancel: Arc<watch::Sender<bool>>,
}

impl Subscriber {
    fn send(&self, event: &CounterChangeEvent) -> Result<(), DeliveryError> {
        self.sink.try_send(event.clone()).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

pub struct Registry {
    subscribers: RwLock<HashMap<String, Subscriber>>,
    buffer: usize,
    overflow: OverflowPolicy,
}

impl Registry {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
            overflow: OverflowPolicy::default(),
        }
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    pub fn subscribe(self: &Arc<Self>, interest: impl IntoIterator<Item = CounterKey>) -> Subscription {
        let id = Uuid::new_v4().to_string();
        let (sink, events) = mpsc::channel(self.buffer);
        let (cancel, mut cancel_rx) = watch::channel(false);
        let cancel = Arc::new(cancel);

        self.subscribers.write().insert(
            id.clone(),
            Subscriber {
                interest: interest.into_iter().collect(),
                sink,
                cancel: cancel.clone(),
            },
        );
        info!("Opening heart stream {id}");

        let registry = Arc::downgrade(self);
        let reaper_id = id.clone();
        tokio::spawn(async move {
            cancelled(&mut cancel_rx).await;

            if let Some(registry) = registry.upgrade() {
                registry.unsubscribe(&reaper_id);
            }
        });

        Subscription {
            id,
            events,
            cancel,
            registry: Arc::downgrade(self),
        }
    }

    /// Removes a subscriber, `false` if it was already gone.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let removed = self.subscribers.write().remove(id);

        match removed {
            Some(subscriber) => {
                subscriber.cancel.send_replace(true);
                info!("Closing heart stream {id}");
                true
            }
            None => false,
        }
    }

    /// Hands the event to every interested subscriber, returns how many took it.
    pub fn deliver(&self, event: &CounterChangeEvent) -> usize {
        let subscribers = self.subscribers.read();
        let mut delivered = 0;

        for (id, subscriber) in subscribers
            .iter()
            .filter(|(_, subscriber)| subscriber.interest.contains(&event.key))
        {
            match subscriber.send(event) {
                Ok(()) => {
                    #[cfg(feature = "verbose")]
                    info!("Sent {} to stream {id}", event.key);

                    delivered += 1;
                }
                Err(DeliveryError::Full) if self.overflow == OverflowPolicy::DropEvent => {
                    warn!("Heart stream {id} is full, dropping {} event", event.key);
                }
                Err(e) => {
                    error!("Error sending to stream {id}: {e}");
                    subscriber.cancel.send_replace(true);
                }
            }
        }

        delivered
    }

    /// Cancels every subscriber, used when the server is going away.
    pub fn close_all(&self) {
        let drained: Vec<(String, Subscriber)> = self.subscribers.write().drain().collect();

        for (_, subscriber) in &drained {
            subscriber.cancel.send_replace(true);
        }
        info!("Closed {} heart streams", drained.len());
    }
}

/// An observer's end of a heart stream.
pub struct Subscription {
    id: String,
    events: mpsc::Receiver<CounterChangeEvent>,
    cancel: Arc<watch::Sender<bool>>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next event, `None` once the subscription is torn down and its buffer drained.
    pub async fn recv(&mut self) -> Option<CounterChangeEvent> {
        self.events.recv().await
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Unregisters right away: once this returns no new event reaches the buffer.
    pub fn close(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.id);
        }

        self.cancel.send_replace(true);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}
