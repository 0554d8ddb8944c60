//! Statistics cache: node identity → per-region rolling windows, instance
//! metadata and external leaderboard scores.
//!
//! The cache is owned by the writer task; nothing else mutates it. Readers
//! get cloned snapshots published by the writer.

pub mod instance;
pub mod window;

pub use instance::{InstanceRecord, LivenessMap};
pub use window::{Measurement, RegionalStats, WINDOW_CAPACITY};

use crate::leaderboard::{LeaderboardSample, LeaderboardStats};
use orchwatch_types::{GeoLocation, NodeReport};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

pub const UNKNOWN_INSTANCE: &str = "unknown";

/// Node identities are case-insensitive addresses.
pub fn normalize_node_id(id: &str) -> String {
    id.trim().to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalScore {
    /// Round trip time relative to segment duration.
    pub rtr: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExternalScoreCache {
    pub last_sync_time: i64,
    pub per_region: BTreeMap<String, ExternalScore>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeRecord {
    pub display_name: String,
    pub regional_stats: BTreeMap<String, RegionalStats>,
    pub instances: BTreeMap<String, InstanceRecord>,
    pub external_score_cache: ExternalScoreCache,
}

impl NodeRecord {
    fn new(display_name: String, now: i64) -> Self {
        Self {
            display_name,
            external_score_cache: ExternalScoreCache {
                last_sync_time: now,
                per_region: BTreeMap::new(),
            },
            ..Default::default()
        }
    }

    /// Coordinates of an instance last probed from `region`.
    pub fn location_for_region(&self, region: &str) -> Option<GeoLocation> {
        self.instances
            .values()
            .filter(|instance| instance.regions.contains_key(region))
            .find_map(InstanceRecord::location)
    }

    /// Coordinates of an instance advertised to the external `region`.
    pub fn location_for_external(&self, region: &str) -> Option<GeoLocation> {
        self.instances
            .values()
            .filter(|instance| instance.external_regions.contains_key(region))
            .find_map(InstanceRecord::location)
    }

    /// Copy without the per-region measurement arrays.
    pub fn lite(&self) -> Self {
        let mut lite = self.clone();
        for stats in lite.regional_stats.values_mut() {
            stats.measurements.clear();
        }
        lite
    }
}

/// One node's entry from a submitted batch, queued for the writer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeUpdate {
    pub node_id: String,
    pub report: NodeReport,
    pub region: String,
    pub tag: String,
    pub external_regions: Vec<String>,
}

impl ProbeUpdate {
    /// Address the node answered on, used to key its instance record.
    pub fn instance_key(&self) -> String {
        let resolv = &self.report.resolv;
        if let Some(resolved) = resolv.resolved_target.as_deref().filter(|r| !r.is_empty()) {
            return resolved.to_string();
        }
        resolv
            .original_target
            .as_deref()
            .and_then(|origin| Url::parse(origin).ok())
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| UNKNOWN_INSTANCE.to_string())
    }
}

/// Keys touched by one applied probe update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedProbe {
    pub node_id: String,
    pub region: String,
    pub instance: String,
}

#[derive(Debug, Clone)]
pub struct StatsCache {
    nodes: BTreeMap<String, NodeRecord>,
    liveness_expiry_ms: i64,
}

impl StatsCache {
    pub fn new(liveness_expiry_ms: i64) -> Self {
        Self {
            nodes: BTreeMap::new(),
            liveness_expiry_ms,
        }
    }

    /// Replaces the cache content with records loaded from storage.
    pub fn restore(&mut self, nodes: BTreeMap<String, NodeRecord>) {
        self.nodes = nodes
            .into_iter()
            .map(|(id, mut record)| {
                for stats in record.regional_stats.values_mut() {
                    stats.enforce_capacity();
                }
                (normalize_node_id(&id), record)
            })
            .collect();
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeRecord> {
        self.nodes.get(&normalize_node_id(node_id))
    }

    pub fn nodes(&self) -> &BTreeMap<String, NodeRecord> {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn lite_view(&self) -> BTreeMap<String, NodeRecord> {
        self.nodes
            .iter()
            .map(|(id, record)| (id.clone(), record.lite()))
            .collect()
    }

    /// Appends one probe outcome to the node's regional window and refreshes
    /// the instance it was reached at.
    pub fn apply_probe(&mut self, update: &ProbeUpdate, display_name: String, now: i64) -> AppliedProbe {
        let node_id = normalize_node_id(&update.node_id);
        let instance_key = update.instance_key();

        let record = self
            .nodes
            .entry(node_id.clone())
            .or_insert_with(|| NodeRecord::new(display_name.clone(), now));
        record.display_name = display_name;

        record
            .regional_stats
            .entry(update.region.clone())
            .or_default()
            .record(update.report.discovery.measured_latency(), now);

        let instance = record.instances.entry(instance_key.clone()).or_default();
        instance.prune(now, self.liveness_expiry_ms);
        instance.stamp(&update.tag, &update.region, &update.external_regions, now);
        instance.absorb(&update.report.discovery, update.report.resolv.geo_lookup.as_ref());

        AppliedProbe {
            node_id,
            region: update.region.clone(),
            instance: instance_key,
        }
    }

    /// Folds leaderboard samples newer than the node's last sync into its
    /// external score cache and returns the external regions that changed.
    ///
    /// Unknown nodes are ignored.
    pub fn apply_external_scores(&mut self, node_id: &str, stats: &LeaderboardStats, now: i64) -> Vec<String> {
        let Some(record) = self.nodes.get_mut(&normalize_node_id(node_id)) else {
            return Vec::new();
        };
        let cache = &mut record.external_score_cache;

        let mut changed = Vec::new();
        for (key, samples) in stats {
            let Some(newest) = samples
                .iter()
                .max_by(|a, b| a.timestamp.total_cmp(&b.timestamp))
            else {
                continue;
            };
            if !newest.is_newer_than(cache.last_sync_time) {
                continue;
            }
            let Some(score) = external_score(newest) else {
                continue;
            };
            let region = if newest.region.is_empty() {
                key.clone()
            } else {
                newest.region.clone()
            };
            cache.per_region.insert(region.clone(), score);
            changed.push(region);
        }

        if !changed.is_empty() {
            cache.last_sync_time = now;
        }
        changed
    }
}

fn external_score(sample: &LeaderboardSample) -> Option<ExternalScore> {
    (sample.seg_duration > 0.0).then(|| ExternalScore {
        rtr: sample.round_trip_time / sample.seg_duration,
        success_rate: sample.success_rate,
    })
}
