use crate::{
    Error, Result,
    error::http_with_retry,
    writer::{SnapshotReceiver, UpdateQueue, UpdateTask},
};
use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// One transcoding test result published by the external leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardSample {
    #[serde(default)]
    pub region: String,
    /// Seconds since the unix epoch.
    pub timestamp: f64,
    pub success_rate: f64,
    pub round_trip_time: f64,
    pub seg_duration: f64,
}

impl LeaderboardSample {
    pub fn is_newer_than(&self, last_sync_ms: i64) -> bool {
        self.timestamp * 1000.0 > last_sync_ms as f64
    }
}

/// External region → samples, as returned by `raw_stats`.
pub type LeaderboardStats = BTreeMap<String, Vec<LeaderboardSample>>;

#[automock]
#[async_trait]
pub trait LeaderboardSource: Send + Sync {
    async fn raw_stats(&self, node_id: &str) -> Result<LeaderboardStats>;
}

pub struct HttpLeaderboard {
    client: reqwest::Client,
    stats_url: Url,
}

impl HttpLeaderboard {
    pub fn new(base_url: &Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            stats_url: base_url.join("api/raw_stats")?,
        })
    }
}

#[async_trait]
impl LeaderboardSource for HttpLeaderboard {
    async fn raw_stats(&self, node_id: &str) -> Result<LeaderboardStats> {
        http_with_retry(
            || async {
                Ok::<_, Error>(self
                    .client
                    .get(self.stats_url.clone())
                    .query(&[("orchestrator", node_id)])
                    .send()
                    .await?
                    .error_for_status()?
                    .json::<LeaderboardStats>()
                    .await?)
            },
            "leaderboard_raw_stats",
        )
        .await
    }
}

/// Periodically pulls leaderboard scores for every known node and queues
/// them for the writer.
pub struct ScorePoller {
    source: Arc<dyn LeaderboardSource>,
    queue: UpdateQueue,
    snapshots: SnapshotReceiver,
    poll_interval: Duration,
}

impl ScorePoller {
    pub fn new(
        source: Arc<dyn LeaderboardSource>,
        queue: UpdateQueue,
        snapshots: SnapshotReceiver,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            queue,
            snapshots,
            poll_interval,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        // Persisted nodes are only known once the writer has published
        let mut loaded = self.snapshots.clone();
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            published = async { loaded.wait_for(|snapshot| snapshot.taken_at > 0).await.is_ok() } => {
                if !published {
                    info!("cache writer gone before first snapshot; leaderboard poller exiting");
                    return Ok(());
                }
            }
        }

        let mut poll_timer = interval(self.poll_interval);
        poll_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("leaderboard poller shutting down");
                    break;
                }
                _ = poll_timer.tick() => {
                    self.poll_once(&shutdown).await?;
                }
            }
        }

        Ok(())
    }

    /// Fetches scores for every node in the current snapshot; a failing node
    /// is skipped until the next cycle.
    pub async fn poll_once(&self, shutdown: &CancellationToken) -> Result<()> {
        let node_ids: Vec<String> = self.snapshots.borrow().nodes.keys().cloned().collect();
        debug!(nodes = node_ids.len(), "polling leaderboard scores");

        for node_id in node_ids {
            if shutdown.is_cancelled() {
                break;
            }
            match self.source.raw_stats(&node_id).await {
                Ok(stats) if stats.is_empty() => {}
                Ok(stats) => {
                    self.queue.submit(UpdateTask::ExternalScores { node_id, stats })?;
                }
                Err(err) => {
                    warn!(%node_id, ?err, "failed to fetch leaderboard scores; skipping node this cycle");
                    metrics::counter!("orchwatch_leaderboard_fetch_failed").increment(1);
                }
            }
        }

        Ok(())
    }
}
