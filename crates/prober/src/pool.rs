//! Working set of targets, refreshed from the population source.

use crate::error::{Error, Result, http_with_retry};
use async_trait::async_trait;
use mockall::automock;
use orchwatch_types::Target;
use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_json::json;
use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{info, warn};
use url::Url;

const ACTIVE_TRANSCODERS_QUERY: &str =
    "{ transcoders(where: {active: true}, first: 1000) { id serviceURI } }";

#[automock]
#[async_trait]
pub trait TargetSource: Send + Sync {
    async fn fetch_targets(&self) -> Result<Vec<Target>>;
}

/// Reads the active orchestrator set from a GraphQL subgraph.
pub struct SubgraphSource {
    client: reqwest::Client,
    url: Url,
}

#[derive(Debug, Deserialize)]
struct GraphResponse {
    data: Option<TranscoderData>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TranscoderData {
    transcoders: Vec<Transcoder>,
}

#[derive(Debug, Deserialize)]
struct Transcoder {
    id: String,
    #[serde(rename = "serviceURI")]
    service_uri: Option<String>,
}

impl From<Transcoder> for Target {
    fn from(transcoder: Transcoder) -> Self {
        Target::new(transcoder.id, transcoder.service_uri.unwrap_or_default())
    }
}

impl SubgraphSource {
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }

    async fn query(&self) -> Result<Vec<Target>> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&json!({ "query": ACTIVE_TRANSCODERS_QUERY }))
            .send()
            .await?
            .error_for_status()?
            .json::<GraphResponse>()
            .await?;

        let Some(data) = response.data else {
            return Err(Error::Population(format!(
                "subgraph returned no data ({} errors)",
                response.errors.len()
            )));
        };

        Ok(data.transcoders.into_iter().map(Target::from).collect())
    }
}

#[async_trait]
impl TargetSource for SubgraphSource {
    async fn fetch_targets(&self) -> Result<Vec<Target>> {
        http_with_retry(|| self.query(), "population").await
    }
}

pub struct TargetPool {
    source: Arc<dyn TargetSource>,
    targets: Vec<Target>,
    ttl: Duration,
    last_refresh: Option<Instant>,
}

impl TargetPool {
    pub fn new(source: Arc<dyn TargetSource>, ttl: Duration) -> Self {
        Self {
            source,
            targets: Vec::new(),
            ttl,
            last_refresh: None,
        }
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    fn is_stale(&self) -> bool {
        self.last_refresh.is_none_or(|at| at.elapsed() > self.ttl)
    }

    /// Refetches the population once the TTL has lapsed. A failed fetch keeps
    /// the previous list and is retried on the next call.
    pub async fn refresh(&mut self) {
        if !self.is_stale() {
            return;
        }

        match self.source.fetch_targets().await {
            Ok(targets) => {
                info!(count = targets.len(), "target population refreshed");
                self.targets = targets;
                self.last_refresh = Some(Instant::now());
            }
            Err(err) => {
                warn!(?err, stale = self.targets.len(), "population refresh failed, keeping previous list");
                metrics::counter!("orchwatch_population_refresh_failed").increment(1);
            }
        }
    }

    /// A freshly shuffled queue holding every known target exactly once.
    pub fn next_cycle(&self) -> VecDeque<Target> {
        let mut targets = self.targets.clone();
        targets.shuffle(&mut rand::thread_rng());
        targets.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn targets(n: usize) -> Vec<Target> {
        (0..n)
            .map(|i| Target::new(format!("0x{i:02x}"), format!("https://node{i}:8935")))
            .collect()
    }

    #[tokio::test]
    async fn test_refresh_fetches_once_within_ttl() {
        let mut source = MockTargetSource::new();
        source.expect_fetch_targets().times(1).returning(|| Ok(targets(3)));

        let mut pool = TargetPool::new(Arc::new(source), Duration::from_secs(60));
        pool.refresh().await;
        pool.refresh().await;

        assert_eq!(pool.targets().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_stale_list() {
        let mut source = MockTargetSource::new();
        let mut seq = mockall::Sequence::new();
        source
            .expect_fetch_targets()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(targets(4)));
        source
            .expect_fetch_targets()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(Error::Population("subgraph down".into())));

        let mut pool = TargetPool::new(Arc::new(source), Duration::ZERO);
        pool.refresh().await;
        std::thread::sleep(Duration::from_millis(2));
        pool.refresh().await;

        assert_eq!(pool.targets().len(), 4);
    }

    #[tokio::test]
    async fn test_failed_first_refresh_is_retried() {
        let mut source = MockTargetSource::new();
        let mut seq = mockall::Sequence::new();
        source
            .expect_fetch_targets()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(Error::Population("subgraph down".into())));
        source
            .expect_fetch_targets()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(targets(2)));

        let mut pool = TargetPool::new(Arc::new(source), Duration::from_secs(3_600));
        pool.refresh().await;
        assert!(pool.targets().is_empty());
        pool.refresh().await;
        assert_eq!(pool.targets().len(), 2);
    }

    #[tokio::test]
    async fn test_next_cycle_is_a_permutation() {
        let mut source = MockTargetSource::new();
        source.expect_fetch_targets().returning(|| Ok(targets(50)));

        let mut pool = TargetPool::new(Arc::new(source), Duration::from_secs(60));
        pool.refresh().await;

        let expected: BTreeSet<_> = targets(50).into_iter().map(|t| t.id).collect();
        for _ in 0..5 {
            let cycle = pool.next_cycle();
            assert_eq!(cycle.len(), 50);
            let seen: BTreeSet<_> = cycle.into_iter().map(|t| t.id).collect();
            assert_eq!(seen, expected);
        }
    }

    #[test]
    fn test_transcoder_without_service_uri_becomes_malformed_target() {
        let body = r#"{"data":{"transcoders":[
            {"id":"0xabc","serviceURI":"https://a:8935"},
            {"id":"0xdef","serviceURI":null}
        ]}}"#;
        let response: GraphResponse = serde_json::from_str(body).unwrap();
        let targets: Vec<Target> = response
            .data
            .unwrap()
            .transcoders
            .into_iter()
            .map(Target::from)
            .collect();

        assert!(targets[0].is_well_formed());
        assert!(!targets[1].is_well_formed());
    }
}
