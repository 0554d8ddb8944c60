//! Single-writer update loop.
//!
//! HTTP handlers and the leaderboard poller only enqueue [`UpdateTask`]s.
//! One [`CacheWriter`] drains the queue in submission order, mutates the
//! [`StatsCache`], mirrors each change into the metrics registry, publishes
//! immutable [`Snapshot`]s for readers and persists dirty state while idle.

use crate::{
    Error, Result,
    cache::{NodeRecord, ProbeUpdate, StatsCache, normalize_node_id},
    exporter,
    leaderboard::LeaderboardStats,
    names::{NameCache, NameService},
    storage::{NAME_CACHE_KEY, STATS_CACHE_KEY, Storage, load_record},
};
use orchwatch_types::{StatsReport, now_millis};
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{
        mpsc::{self, error::TryRecvError},
        oneshot, watch,
    },
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub enum UpdateTask {
    /// Every node of one submitted report, applied without interleaving.
    Batch(Vec<ProbeUpdate>),
    ExternalScores {
        node_id: String,
        stats: LeaderboardStats,
    },
    /// Answered once every earlier task is applied and a snapshot published.
    Sync(oneshot::Sender<()>),
}

/// Producer side of the writer queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct UpdateQueue {
    tx: mpsc::UnboundedSender<UpdateTask>,
}

impl UpdateQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UpdateTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn from_sender(tx: mpsc::UnboundedSender<UpdateTask>) -> Self {
        Self { tx }
    }

    pub fn submit(&self, task: UpdateTask) -> Result<()> {
        self.tx.send(task).map_err(|_| Error::QueueClosed)
    }

    /// Queues a validated report as a single task, so readers and storage
    /// never observe part of a batch.
    pub fn submit_report(&self, report: StatsReport) -> Result<usize> {
        let StatsReport {
            batch_results,
            tag,
            region,
            external_regions,
            ..
        } = report;

        let updates: Vec<ProbeUpdate> = batch_results
            .into_iter()
            .map(|(node_id, node_report)| ProbeUpdate {
                node_id,
                report: node_report,
                region: region.clone(),
                tag: tag.clone(),
                external_regions: external_regions.clone(),
            })
            .collect();
        let count = updates.len();
        self.submit(UpdateTask::Batch(updates))?;
        Ok(count)
    }

    /// Waits until everything submitted before this call is visible to readers.
    pub async fn sync(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.submit(UpdateTask::Sync(tx))?;
        rx.await.map_err(|_| Error::QueueClosed)
    }
}

/// Immutable view of the cache handed to readers.
#[derive(Debug)]
pub struct Snapshot {
    pub nodes: BTreeMap<String, NodeRecord>,
    /// Pre-rendered JSON of the nodes without measurement arrays.
    pub lite_json: String,
    pub taken_at: i64,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            nodes: BTreeMap::new(),
            lite_json: "{}".to_string(),
            taken_at: 0,
        }
    }
}

impl Snapshot {
    pub fn capture(cache: &StatsCache, now: i64) -> Result<Self> {
        Ok(Self {
            nodes: cache.nodes().clone(),
            lite_json: serde_json::to_string(&cache.lite_view())?,
            taken_at: now,
        })
    }

    pub fn full_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.nodes)?)
    }
}

pub type SnapshotReceiver = watch::Receiver<Arc<Snapshot>>;

pub struct CacheWriter {
    cache: StatsCache,
    names: NameService,
    storage: Arc<dyn Storage>,
    rx: mpsc::UnboundedReceiver<UpdateTask>,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
    ready: Arc<AtomicBool>,
    idle_tick: Duration,
    snapshot_refresh: Duration,
    cache_dirty: bool,
    snapshot_stale: bool,
    last_published: Instant,
    last_flush: Instant,
}

impl CacheWriter {
    pub fn new(
        cache: StatsCache,
        names: NameService,
        storage: Arc<dyn Storage>,
        rx: mpsc::UnboundedReceiver<UpdateTask>,
        idle_tick: Duration,
        snapshot_refresh: Duration,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(Snapshot::default()));
        Self {
            cache,
            names,
            storage,
            rx,
            snapshot_tx,
            ready: Arc::new(AtomicBool::new(false)),
            idle_tick,
            snapshot_refresh,
            cache_dirty: false,
            snapshot_stale: false,
            last_published: Instant::now(),
            last_flush: Instant::now(),
        }
    }

    pub fn subscribe(&self) -> SnapshotReceiver {
        self.snapshot_tx.subscribe()
    }

    /// Set once persisted state is loaded; reports are refused until then.
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        self.restore().await?;
        info!(nodes = self.cache.len(), "cache writer ready");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.rx.try_recv() {
                Ok(task) => {
                    self.apply(task).await;
                    if self.snapshot_stale && self.last_published.elapsed() >= self.snapshot_refresh {
                        self.publish();
                    }
                    continue;
                }
                Err(TryRecvError::Empty) => self.on_idle().await,
                Err(TryRecvError::Disconnected) => break,
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                task = self.rx.recv() => match task {
                    Some(task) => self.apply(task).await,
                    None => break,
                },
                _ = sleep(self.idle_tick) => {}
            }
        }

        if self.snapshot_stale {
            self.publish();
        }
        self.flush().await;
        info!("cache writer stopped");

        Ok(())
    }

    /// Loads persisted state and rebuilds exporter state from it.
    async fn restore(&mut self) -> Result<()> {
        let storage = self.storage.clone();
        let (nodes, names) = tokio::task::spawn_blocking(move || -> Result<_> {
            let nodes: BTreeMap<String, NodeRecord> = load_record(&*storage, STATS_CACHE_KEY)?;
            let names: NameCache = load_record(&*storage, NAME_CACHE_KEY)?;
            Ok((nodes, names))
        })
        .await??;

        info!(nodes = nodes.len(), names = names.len(), "loaded persisted state");
        self.cache.restore(nodes);
        self.names.restore(names);

        for node in self.cache.nodes().values() {
            exporter::publish_node(node);
        }
        self.publish();
        self.ready.store(true, Ordering::Release);

        Ok(())
    }

    async fn apply(&mut self, task: UpdateTask) {
        match task {
            UpdateTask::Batch(updates) => {
                for update in updates {
                    self.apply_probe(update).await;
                }
            }
            UpdateTask::ExternalScores { node_id, stats } => {
                let changed = self.cache.apply_external_scores(&node_id, &stats, now_millis());
                if let Some(node) = self.cache.get(&node_id) {
                    if !changed.is_empty() {
                        debug!(%node_id, regions = ?changed, "external scores updated");
                        exporter::publish_external(node, &changed);
                        self.mark_dirty();
                    }
                }
            }
            UpdateTask::Sync(reply) => {
                self.publish();
                let _ = reply.send(());
            }
        }
        metrics::counter!("orchwatch_tasks_applied").increment(1);
    }

    async fn apply_probe(&mut self, update: ProbeUpdate) {
        let node_id = normalize_node_id(&update.node_id);
        if node_id.is_empty() {
            warn!(tag = %update.tag, "dropping probe result without node id");
            return;
        }

        let now = now_millis();
        // Blocks the queue while the resolver retries
        let display_name = self.names.display_name(&node_id, now).await;
        let applied = self.cache.apply_probe(&update, display_name, now);

        exporter::observe_latency(&applied.region, update.report.discovery.measured_latency());
        if let Some(node) = self.cache.get(&applied.node_id) {
            exporter::publish_probe(node, &applied.region, &applied.instance);
        }
        self.mark_dirty();
    }

    fn mark_dirty(&mut self) {
        self.cache_dirty = true;
        self.snapshot_stale = true;
    }

    async fn on_idle(&mut self) {
        if self.snapshot_stale {
            self.publish();
        }
        if self.last_flush.elapsed() >= self.idle_tick {
            self.flush().await;
        }
    }

    fn publish(&mut self) {
        match Snapshot::capture(&self.cache, now_millis()) {
            Ok(snapshot) => {
                self.snapshot_tx.send_replace(Arc::new(snapshot));
                self.snapshot_stale = false;
                self.last_published = Instant::now();
            }
            Err(err) => error!(?err, "failed to capture cache snapshot"),
        }
    }

    /// Writes dirty records; failed records stay dirty for the next tick.
    async fn flush(&mut self) {
        self.last_flush = Instant::now();

        let mut records: Vec<(&'static str, Vec<u8>)> = Vec::new();
        if self.cache_dirty {
            match serde_json::to_vec(self.cache.nodes()) {
                Ok(bytes) => records.push((STATS_CACHE_KEY, bytes)),
                Err(err) => error!(?err, "failed to serialize stats cache"),
            }
        }
        if self.names.is_dirty() {
            match serde_json::to_vec(self.names.entries()) {
                Ok(bytes) => records.push((NAME_CACHE_KEY, bytes)),
                Err(err) => error!(?err, "failed to serialize name cache"),
            }
        }
        if records.is_empty() {
            return;
        }

        let storage = self.storage.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            records
                .into_iter()
                .map(|(key, bytes)| (key, storage.put(key, &bytes)))
                .collect::<Vec<_>>()
        })
        .await;

        let results = match outcome {
            Ok(results) => results,
            Err(err) => {
                error!(?err, "persistence task failed");
                metrics::counter!("orchwatch_flush_failed").increment(1);
                return;
            }
        };

        for (key, result) in results {
            match result {
                Ok(()) => {
                    debug!(key, "persisted record");
                    match key {
                        STATS_CACHE_KEY => self.cache_dirty = false,
                        NAME_CACHE_KEY => self.names.mark_clean(),
                        _ => {}
                    }
                }
                Err(err) => {
                    error!(key, ?err, "failed to persist record; will retry on next idle tick");
                    metrics::counter!("orchwatch_flush_failed").increment(1);
                }
            }
        }
    }
}
