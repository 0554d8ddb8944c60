use crate::{Error, Result, settings::NameResolutionSettings};
use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use leaky_bucket::RateLimiter;
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, warn};
use url::Url;

/// Looks up the human readable alias registered for a node address.
#[automock]
#[async_trait]
pub trait NameResolver: Send + Sync {
    /// `Ok(None)` means the address has no alias.
    async fn lookup_name(&self, address: &str) -> Result<Option<String>>;
}

#[derive(Debug, Deserialize)]
struct NameLookupResponse {
    #[serde(default)]
    domain: Option<String>,
}

/// Resolver backed by `GET {base}/{address}` answering `{"domain": ...}`,
/// limited to `requests_per_second` lookups.
pub struct HttpNameResolver {
    client: reqwest::Client,
    base_url: Url,
    limiter: RateLimiter,
}

impl HttpNameResolver {
    pub fn new(base_url: Url, timeout: Duration, requests_per_second: usize) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let rps = requests_per_second.max(1);
        let limiter = RateLimiter::builder()
            .max(rps)
            .initial(rps)
            .refill(rps)
            .interval(Duration::from_secs(1))
            .build();
        Ok(Self {
            client,
            base_url,
            limiter,
        })
    }
}

#[async_trait]
impl NameResolver for HttpNameResolver {
    async fn lookup_name(&self, address: &str) -> Result<Option<String>> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .push(address);

        self.limiter.acquire_one().await;
        let response: NameLookupResponse = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.domain.filter(|domain| !domain.is_empty()))
    }
}

/// Used when no resolver endpoint is configured: every node keeps its address.
pub struct NoAliasResolver;

#[async_trait]
impl NameResolver for NoAliasResolver {
    async fn lookup_name(&self, _address: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameEntry {
    pub domain: Option<String>,
    pub address: String,
    pub timestamp: i64,
}

impl NameEntry {
    pub fn display_name(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.address)
    }
}

/// Address → last resolved alias. Persisted as its own record.
pub type NameCache = BTreeMap<String, NameEntry>;

pub struct NameService {
    resolver: Arc<dyn NameResolver>,
    entries: NameCache,
    ttl_ms: i64,
    retry_delay: Duration,
    max_retries: usize,
    dirty: bool,
}

impl NameService {
    pub fn new(resolver: Arc<dyn NameResolver>, settings: &NameResolutionSettings) -> Self {
        Self {
            resolver,
            entries: NameCache::new(),
            ttl_ms: settings.ttl_secs.saturating_mul(1000) as i64,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
            max_retries: settings.max_retries,
            dirty: false,
        }
    }

    pub fn restore(&mut self, entries: NameCache) {
        self.entries = entries;
        self.dirty = false;
    }

    pub fn entries(&self) -> &NameCache {
        &self.entries
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Alias for `address`, falling back to the address itself.
    ///
    /// Entries younger than the TTL are served from the cache. Otherwise the
    /// resolver is queried, rate limited and retried with a constant delay;
    /// once retries run out the last known alias is used without refreshing
    /// the entry, so the next update tries again.
    pub async fn display_name(&mut self, address: &str, now: i64) -> String {
        let cached = self.entries.get(address).cloned();
        if let Some(entry) = cached.as_ref() {
            if now - entry.timestamp < self.ttl_ms {
                return entry.display_name().to_string();
            }
        }

        match self.lookup(address).await {
            Ok(found) => {
                // A missing alias never erases one we already know
                let domain = found.or_else(|| cached.and_then(|entry| entry.domain));
                debug!(%address, ?domain, "refreshed node alias");
                let entry = NameEntry {
                    domain,
                    address: address.to_string(),
                    timestamp: now,
                };
                let name = entry.display_name().to_string();
                self.entries.insert(address.to_string(), entry);
                self.dirty = true;
                name
            }
            Err(err) => {
                warn!(%address, ?err, "alias lookup failed after retries; using last known name");
                metrics::counter!("orchwatch_name_lookup_failed").increment(1);
                cached
                    .map(|entry| entry.display_name().to_string())
                    .unwrap_or_else(|| address.to_string())
            }
        }
    }

    async fn lookup(&self, address: &str) -> Result<Option<String>> {
        let backoff = ConstantBuilder::default()
            .with_delay(self.retry_delay)
            .with_max_times(self.max_retries);
        let resolver = &self.resolver;

        (|| resolver.lookup_name(address))
        .retry(backoff)
        .notify(|err: &Error, delay: Duration| {
            warn!(%address, ?err, retry_in = ?delay, "alias lookup failed; retrying");
        })
        .await
    }
}
