//! # Change stream
//!
//! Discovery and polling feed one unified channel, a router task decodes each record and
//! hands it to the [`Registry`].
//!
//! ```text
//! partition pollers ─► forwarders ─► unified channel ─► decode ─► registry ─► subscribers
//! ```
//!
//! Records keep their order within a partition, there is no order across partitions.
//! Shutdown cascades: signal ─► pollers cancelled ─► forwarders drain ─► unified closes ─► router exits.
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{error, info, warn};

use crate::{
    config::PipelineConfig, decode::decode, discovery::Discovery, model::RawChangeRecord,
    registry::Registry, store::ChangeLog,
};

pub struct Pipeline {
    shutdown: watch::Sender<bool>,
    discovery: JoinHandle<()>,
    router: JoinHandle<RouteStats>,
    active: Arc<AtomicUsize>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RouteStats {
    pub decoded: usize,
    pub dropped: usize,
    pub deliveries: usize,
}

impl Pipeline {
    pub fn start(log: Arc<dyn ChangeLog>, registry: Arc<Registry>, config: PipelineConfig) -> Self {
        let (unified, records) = mpsc::channel(config.unified_buffer.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let active = Arc::new(AtomicUsize::new(0));

        let discovery = Discovery::new(log, config, unified, active.clone());
        let discovery = tokio::spawn(discovery.run(shutdown_rx));
        let router = tokio::spawn(route(records, registry));

        Self {
            shutdown,
            discovery,
            router,
            active,
        }
    }

    /// Pollers whose records are still flowing into the unified channel.
    pub fn active_pollers(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub async fn shutdown(self) -> RouteStats {
        info!("Shutting down change stream...");
        self.shutdown.send_replace(true);

        if let Err(e) = self.discovery.await {
            error!("Discovery task failed: {e}");
        }

        match self.router.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Router task failed: {e}");
                RouteStats::default()
            }
        }
    }
}

async fn route(mut records: mpsc::Receiver<RawChangeRecord>, registry: Arc<Registry>) -> RouteStats {
    let mut stats = RouteStats::default();

    while let Some(record) = records.recv().await {
        match decode(&record) {
            Ok(event) => {
                stats.decoded += 1;
                stats.deliveries += registry.deliver(&event);

                #[cfg(feature = "verbose")]
                info!("Published heart count {} = {}", event.key, event.count);
            }
            Err(e) => {
                stats.dropped += 1;
                warn!(
                    partition = %record.partition,
                    id = %record.id,
                    "Could not decode heart count: {e}"
                );
            }
        }
    }

    info!(
        "Change stream closed: {} decoded, {} dropped, {} deliveries",
        stats.decoded, stats.dropped, stats.deliveries
    );

    stats
}
