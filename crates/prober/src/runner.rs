use crate::{pool::TargetPool, prober::BoundedProber, report::ReportSink};
use orchwatch_types::{StatsReport, SubmitResponse};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Identity stamped on every batch this prober submits.
#[derive(Debug, Clone)]
pub struct ReporterIdentity {
    pub tag: String,
    pub region: String,
    pub external_regions: Vec<String>,
    pub key: String,
}

/// Paces probe cycles: refresh, shuffle, probe, submit.
pub struct CycleRunner {
    pool: TargetPool,
    prober: BoundedProber,
    sink: Arc<dyn ReportSink>,
    identity: ReporterIdentity,
    round: Duration,
    sleep: Duration,
    last_round_start: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleSummary {
    pub reported: usize,
    pub response: Option<SubmitResponse>,
}

impl CycleRunner {
    pub fn new(
        pool: TargetPool,
        prober: BoundedProber,
        sink: Arc<dyn ReportSink>,
        identity: ReporterIdentity,
        round: Duration,
        sleep: Duration,
    ) -> Self {
        Self {
            pool,
            prober,
            sink,
            identity,
            round,
            sleep,
            last_round_start: None,
        }
    }

    fn round_due(&self) -> bool {
        self.last_round_start.is_none_or(|at| at.elapsed() > self.round)
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            tag = %self.identity.tag,
            region = %self.identity.region,
            round_secs = self.round.as_secs(),
            "prober started"
        );

        loop {
            if self.round_due() {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = self.run_cycle() => {}
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.sleep) => {}
            }
        }

        info!("prober stopped");
    }

    /// One full cycle. Submission failures are logged and never propagate.
    pub async fn run_cycle(&mut self) -> CycleSummary {
        let started = Instant::now();
        self.last_round_start = Some(started);

        self.pool.refresh().await;
        let queue = self.pool.next_cycle();
        let batch = self.prober.probe_all(queue).await;
        let reported = batch.len();

        let report = StatsReport {
            batch_results: batch,
            tag: self.identity.tag.clone(),
            key: self.identity.key.clone(),
            region: self.identity.region.clone(),
            external_regions: self.identity.external_regions.clone(),
        };

        let response = match self.sink.submit(&report).await {
            Ok(response) => {
                match response {
                    SubmitResponse::Accepted => info!(reported, "batch accepted"),
                    SubmitResponse::Busy => warn!(reported, "aggregator busy, batch dropped"),
                    SubmitResponse::Rejected => warn!(reported, "batch rejected"),
                }
                Some(response)
            }
            Err(err) => {
                error!(?err, reported, "batch submission failed");
                metrics::counter!("orchwatch_submit_failed").increment(1);
                None
            }
        };

        let elapsed = started.elapsed();
        metrics::histogram!("orchwatch_cycle_duration_seconds").record(elapsed.as_secs_f64());
        debug!(elapsed_ms = elapsed.as_millis(), "cycle finished");

        CycleSummary { reported, response }
    }
}
