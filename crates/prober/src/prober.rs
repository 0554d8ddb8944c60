//! Drains a cycle's target queue with a fixed number of probes in flight.

use crate::{
    enrichment::EnrichmentCache,
    transport::{NodeProbe, ProbeError},
};
use orchwatch_types::{NodeReport, ProbeResult, Target};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, info, warn};

pub type Batch = BTreeMap<String, NodeReport>;

enum Outcome {
    Report(NodeReport),
    Excluded,
}

pub struct BoundedProber {
    transport: Arc<dyn NodeProbe>,
    enrichment: Arc<EnrichmentCache>,
    concurrency: usize,
    deadline: Duration,
}

impl BoundedProber {
    pub fn new(
        transport: Arc<dyn NodeProbe>,
        enrichment: Arc<EnrichmentCache>,
        concurrency: usize,
        deadline: Duration,
    ) -> Self {
        Self {
            transport,
            enrichment,
            concurrency: concurrency.max(1),
            deadline,
        }
    }

    /// Probes every target in `queue`, returning once all of them settled.
    ///
    /// Nodes refusing to quote for lack of reserve are left out of the batch.
    pub async fn probe_all(&self, mut queue: VecDeque<Target>) -> Batch {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        let total = queue.len();

        info!(total, concurrency = self.concurrency, "probing targets");

        while let Some(target) = queue.pop_front() {
            if !target.is_well_formed() {
                warn!(id = %target.id, uri = %target.service_uri, "skipping malformed target");
                metrics::counter!("orchwatch_probes_skipped").increment(1);
                continue;
            }

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let transport = self.transport.clone();
            let enrichment = self.enrichment.clone();
            let deadline = self.deadline;

            set.spawn(async move {
                let _permit = permit;
                let resolv = enrichment.resolve(&target).await;
                let outcome = match probe_one(transport.as_ref(), &target, deadline).await {
                    Some(discovery) => Outcome::Report(NodeReport { discovery, resolv }),
                    None => Outcome::Excluded,
                };
                (target.id, outcome)
            });
        }

        let mut batch = Batch::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, Outcome::Report(report))) => {
                    batch.insert(id, report);
                }
                Ok((id, Outcome::Excluded)) => {
                    debug!(%id, "left out of batch");
                }
                Err(err) => warn!(?err, "probe task failed"),
            }
        }

        info!(total, reported = batch.len(), "probe cycle settled");
        batch
    }
}

/// One status request under an absolute deadline. `None` drops the node.
async fn probe_one(transport: &dyn NodeProbe, target: &Target, deadline: Duration) -> Option<ProbeResult> {
    let started = Instant::now();
    let outcome = tokio::time::timeout(deadline, transport.discover(&target.service_uri)).await;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;

    let result = match outcome {
        Ok(Ok(status)) => {
            metrics::counter!("orchwatch_probes", "outcome" => "success").increment(1);
            ProbeResult::success(elapsed_ms, status.price_info, status.version)
        }
        Ok(Err(ProbeError::InsufficientReserve)) => {
            metrics::counter!("orchwatch_probes", "outcome" => "excluded").increment(1);
            return None;
        }
        Ok(Err(err)) => {
            debug!(id = %target.id, %err, "probe failed");
            metrics::counter!("orchwatch_probes", "outcome" => "failed").increment(1);
            ProbeResult::failure(err.to_string())
        }
        Err(_) => {
            debug!(id = %target.id, deadline_ms = deadline.as_millis(), "probe timed out");
            metrics::counter!("orchwatch_probes", "outcome" => "timeout").increment(1);
            ProbeResult::failure(format!("no response within {}ms", deadline.as_millis()))
        }
    };
    Some(result)
}
