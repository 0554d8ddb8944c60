use orchwatch_types::{GeoLocation, ProbeResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key → last time it was seen, in milliseconds.
pub type LivenessMap = BTreeMap<String, i64>;

fn prune(map: &mut LivenessMap, now: i64, expiry_ms: i64) {
    map.retain(|_, seen| now - *seen <= expiry_ms);
}

/// Metadata for one network address a node was reached at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceRecord {
    /// Price per pixel from the last successful quote.
    pub price: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub version: Option<String>,
    /// Prober tag → last seen.
    pub probed_from: LivenessMap,
    /// Prober region → last seen.
    pub regions: LivenessMap,
    /// External leaderboard region → last seen.
    pub external_regions: LivenessMap,
}

impl InstanceRecord {
    /// Drops liveness entries older than `expiry_ms`.
    pub fn prune(&mut self, now: i64, expiry_ms: i64) {
        prune(&mut self.probed_from, now, expiry_ms);
        prune(&mut self.regions, now, expiry_ms);
        prune(&mut self.external_regions, now, expiry_ms);
    }

    pub fn stamp(&mut self, tag: &str, region: &str, external_regions: &[String], now: i64) {
        self.probed_from.insert(tag.to_string(), now);
        self.regions.insert(region.to_string(), now);
        for external in external_regions {
            self.external_regions.insert(external.clone(), now);
        }
    }

    /// Takes price, version and coordinates from a probe, never clearing a
    /// known value with a missing one.
    pub fn absorb(&mut self, probe: &ProbeResult, geo: Option<&GeoLocation>) {
        if let Some(price) = probe.price_info.as_ref().and_then(|p| p.price_per_pixel()) {
            self.price = Some(price);
        }
        if let Some(version) = probe.version.as_ref().filter(|v| !v.is_empty()) {
            self.version = Some(version.clone());
        }
        if let Some(geo) = geo {
            self.latitude = Some(geo.latitude);
            self.longitude = Some(geo.longitude);
        }
    }

    pub fn location(&self) -> Option<GeoLocation> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoLocation {
                latitude,
                longitude,
            }),
            _ => None,
        }
    }
}
