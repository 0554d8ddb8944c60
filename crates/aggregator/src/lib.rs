use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

pub mod cache;
mod error;
pub mod exporter;
pub mod leaderboard;
pub mod names;
pub mod server;
pub mod settings;
pub mod storage;
pub mod writer;

pub use error::{Error, Result};

use cache::StatsCache;
use names::{NameResolver, NameService};
use server::AppState;
use settings::Settings;
use storage::Storage;
use writer::{CacheWriter, UpdateQueue};

/// Wires a writer, its queue and the HTTP state around `storage`.
///
/// The writer must be run for the returned state to become ready.
pub fn assemble(
    settings: &Settings,
    resolver: Arc<dyn NameResolver>,
    storage: Arc<dyn Storage>,
    prometheus: PrometheusHandle,
) -> (CacheWriter, UpdateQueue, Arc<AppState>) {
    let (queue, rx) = UpdateQueue::channel();
    let writer = CacheWriter::new(
        StatsCache::new(settings.liveness_expiry_ms()),
        NameService::new(resolver, &settings.name_resolution),
        storage,
        rx,
        settings.idle_tick(),
        settings.snapshot_refresh(),
    );

    let state = Arc::new(AppState {
        queue: queue.clone(),
        snapshots: writer.subscribe(),
        ready: writer.ready_flag(),
        shared_secret: settings.shared_secret.clone(),
        prometheus,
    });

    (writer, queue, state)
}
