//! Per-node DNS and geolocation enrichment with its own TTL.

use crate::{
    error::{Error, Result},
    transport::service_url,
};
use async_trait::async_trait;
use mockall::automock;
use orchwatch_types::{EnrichmentRecord, GeoLocation, Target, now_millis};
use retainer::Cache;
use serde::Deserialize;
use std::{net::IpAddr, sync::Arc, time::Duration};
use tracing::{debug, warn};
use url::{Host, Url};

#[automock]
#[async_trait]
pub trait HostLocator: Send + Sync {
    async fn resolve_host(&self, host: &str) -> Result<IpAddr>;
    async fn locate(&self, ip: IpAddr) -> Result<Option<GeoLocation>>;
}

/// System resolver plus an ipinfo-style geolocation endpoint.
pub struct NetLocator {
    client: reqwest::Client,
    geo_url: Option<Url>,
    geo_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpInfo {
    loc: Option<String>,
}

impl NetLocator {
    pub fn new(geo_url: Option<Url>, geo_token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            geo_url,
            geo_token,
        })
    }
}

/// Parses ipinfo's `"lat,lon"` location string.
fn parse_loc(loc: &str) -> Option<GeoLocation> {
    let (lat, lon) = loc.split_once(',')?;
    let latitude = lat.trim().parse::<f64>().ok()?;
    let longitude = lon.trim().parse::<f64>().ok()?;
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return None;
    }
    Some(GeoLocation { latitude, longitude })
}

/// `{base}/{ip}`, keeping every segment of `base`.
fn geo_lookup_url(base: &Url, ip: IpAddr) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| Error::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
        .pop_if_empty()
        .push(&ip.to_string());
    Ok(url)
}

#[async_trait]
impl HostLocator for NetLocator {
    async fn resolve_host(&self, host: &str) -> Result<IpAddr> {
        let mut addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|source| Error::Dns {
                host: host.to_string(),
                source,
            })?;
        addrs
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| Error::NoAddress(host.to_string()))
    }

    async fn locate(&self, ip: IpAddr) -> Result<Option<GeoLocation>> {
        let Some(base) = &self.geo_url else {
            return Ok(None);
        };
        let url = geo_lookup_url(base, ip)?;
        let mut request = self.client.get(url);
        if let Some(token) = &self.geo_token {
            request = request.bearer_auth(token);
        }
        let info: IpInfo = request.send().await?.error_for_status()?.json().await?;
        Ok(info.loc.as_deref().and_then(parse_loc))
    }
}

pub struct EnrichmentCache {
    locator: Arc<dyn HostLocator>,
    entries: Arc<Cache<String, EnrichmentRecord>>,
    ttl: Duration,
    tag: String,
}

impl EnrichmentCache {
    pub fn new(locator: Arc<dyn HostLocator>, ttl: Duration, tag: impl Into<String>) -> Self {
        Self {
            locator,
            entries: Arc::new(Cache::new()),
            ttl,
            tag: tag.into(),
        }
    }

    /// Evicts expired entries in the background, sampling every `interval`.
    pub fn spawn_monitor(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let entries = self.entries.clone();
        tokio::spawn(async move {
            entries.monitor(5, 0.25, interval).await;
        })
    }

    /// Cached record for `target`, looked up again once the TTL lapses.
    /// Failed lookups are cached too, with empty address and location.
    pub async fn resolve(&self, target: &Target) -> EnrichmentRecord {
        let key = target.id.trim().to_lowercase();
        if let Some(cached) = self.entries.get(&key).await {
            return EnrichmentRecord::clone(&cached);
        }

        let record = self.lookup(target).await;
        self.entries.insert(key, record.clone(), self.ttl).await;
        record
    }

    async fn lookup(&self, target: &Target) -> EnrichmentRecord {
        let mut record = EnrichmentRecord {
            geo_from: Some(self.tag.clone()),
            last_time: now_millis(),
            ..Default::default()
        };

        let url = match service_url(&target.service_uri) {
            Ok(url) => url,
            Err(err) => {
                warn!(node = %target.id, %err, "cannot enrich target");
                return record;
            }
        };
        record.original_target = Some(url.origin().ascii_serialization());

        let ip = match url.host() {
            Some(Host::Ipv4(ip)) => IpAddr::V4(ip),
            Some(Host::Ipv6(ip)) => IpAddr::V6(ip),
            Some(Host::Domain(domain)) => match self.locator.resolve_host(domain).await {
                Ok(ip) => ip,
                Err(err) => {
                    warn!(node = %target.id, domain, ?err, "dns lookup failed");
                    metrics::counter!("orchwatch_enrichment_failed", "stage" => "dns").increment(1);
                    return record;
                }
            },
            None => return record,
        };
        record.resolved_target = Some(ip.to_string());

        match self.locator.locate(ip).await {
            Ok(geo) => record.geo_lookup = geo,
            Err(err) => {
                warn!(node = %target.id, %ip, ?err, "geo lookup failed");
                metrics::counter!("orchwatch_enrichment_failed", "stage" => "geo").increment(1);
            }
        }

        debug!(node = %target.id, resolved = ?record.resolved_target, geo = ?record.geo_lookup, "enriched");
        record
    }
}
