//! Mirrors statistics cache state into the metrics registry.
//!
//! Gauges carry the node's display name and coordinates as labels so
//! dashboards can map them; nodes without a known location are labelled
//! `unknown`.

use crate::cache::NodeRecord;
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use orchwatch_types::GeoLocation;

pub const LATENCY_SUMMARY: &str = "orch_latency";
pub const LATEST_LATENCY: &str = "orch_latest_latency";
pub const AVERAGE_LATENCY: &str = "orch_average_latency";
pub const UPTIME_SCORE: &str = "orch_uptime_score";
pub const LATEST_PRICE: &str = "orch_latest_ppp";
pub const LATEST_RTR: &str = "orch_latest_rtr";
pub const LATEST_SUCCESS_RATE: &str = "orch_latest_success_rate";

/// Quantiles rendered for the latency summary.
pub const LATENCY_QUANTILES: &[f64] = &[0.01, 0.1, 0.9, 0.99];

const UNKNOWN: &str = "unknown";

pub fn describe() {
    describe_histogram!(LATENCY_SUMMARY, "Discovery latency of successful probes, per probing region");
    describe_gauge!(LATEST_LATENCY, "Latest discovery latency seen from a region");
    describe_gauge!(AVERAGE_LATENCY, "Average discovery latency over the rolling window");
    describe_gauge!(UPTIME_SCORE, "Fraction of observed time the node answered probes");
    describe_gauge!(LATEST_PRICE, "Latest advertised price per pixel");
    describe_gauge!(LATEST_RTR, "Latest leaderboard round trip ratio");
    describe_gauge!(LATEST_SUCCESS_RATE, "Latest leaderboard success rate");
    describe_counter!("orchwatch_reports_accepted", "Probe reports accepted");
    describe_counter!("orchwatch_reports_rejected", "Probe reports rejected");
    describe_counter!("orchwatch_tasks_applied", "Update tasks applied by the writer");
    describe_counter!("orchwatch_flush_failed", "Failed attempts to persist state");
}

fn coordinates(location: Option<GeoLocation>) -> (String, String) {
    match location {
        Some(geo) => (geo.latitude.to_string(), geo.longitude.to_string()),
        None => (UNKNOWN.to_string(), UNKNOWN.to_string()),
    }
}

/// Records one probe outcome in the latency summary.
pub fn observe_latency(region: &str, latency: Option<f64>) {
    if let Some(latency) = latency {
        histogram!(LATENCY_SUMMARY, "region" => region.to_string()).record(latency);
    }
}

/// Publishes the gauges touched by a probe applied to `region` / `instance`.
pub fn publish_probe(node: &NodeRecord, region: &str, instance: &str) {
    if let Some(stats) = node.regional_stats.get(region) {
        let (latitude, longitude) = coordinates(node.location_for_region(region));
        let labels = [
            ("region", region.to_string()),
            ("orchestrator", node.display_name.clone()),
            ("latitude", latitude.clone()),
            ("longitude", longitude.clone()),
        ];
        if stats.latest_latency > 0.0 {
            gauge!(LATEST_LATENCY, &labels).set(stats.latest_latency);
        }
        if stats.avg_latency > 0.0 {
            gauge!(AVERAGE_LATENCY, &labels).set(stats.avg_latency);
        }
        gauge!(
            UPTIME_SCORE,
            "instance" => instance.to_string(),
            "region" => region.to_string(),
            "orchestrator" => node.display_name.clone(),
            "latitude" => latitude,
            "longitude" => longitude
        )
        .set(stats.uptime_ratio);
    }

    if let Some(record) = node.instances.get(instance) {
        if let Some(price) = record.price {
            let (latitude, longitude) = coordinates(record.location());
            gauge!(
                LATEST_PRICE,
                "instance" => instance.to_string(),
                "orchestrator" => node.display_name.clone(),
                "latitude" => latitude,
                "longitude" => longitude
            )
            .set(price);
        }
    }
}

pub fn publish_external(node: &NodeRecord, regions: &[String]) {
    for region in regions {
        let Some(score) = node.external_score_cache.per_region.get(region) else {
            continue;
        };
        let (latitude, longitude) = coordinates(node.location_for_external(region));
        let labels = [
            ("external_region", region.clone()),
            ("orchestrator", node.display_name.clone()),
            ("latitude", latitude),
            ("longitude", longitude),
        ];
        gauge!(LATEST_RTR, &labels).set(score.rtr);
        gauge!(LATEST_SUCCESS_RATE, &labels).set(score.success_rate);
    }
}

/// Publishes every gauge derivable from `node`, used after loading state.
pub fn publish_node(node: &NodeRecord) {
    for region in node.regional_stats.keys() {
        let instances: Vec<&String> = node
            .instances
            .iter()
            .filter(|(_, instance)| instance.regions.contains_key(region))
            .map(|(key, _)| key)
            .collect();
        if instances.is_empty() {
            publish_probe(node, region, crate::cache::UNKNOWN_INSTANCE);
        }
        for instance in instances {
            publish_probe(node, region, instance);
        }
    }
    let regions: Vec<String> = node.external_score_cache.per_region.keys().cloned().collect();
    publish_external(node, &regions);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ExternalScore, InstanceRecord, RegionalStats};
    use metrics_exporter_prometheus::PrometheusBuilder;

    fn node() -> NodeRecord {
        let mut node = NodeRecord {
            display_name: "orch.eth".into(),
            ..Default::default()
        };
        let mut stats = RegionalStats::default();
        stats.record(Some(120.0), 1_000);
        node.regional_stats.insert("eu".into(), stats);

        let mut instance = InstanceRecord {
            price: Some(0.001),
            latitude: Some(10.0),
            longitude: Some(20.0),
            ..Default::default()
        };
        instance.stamp("eu-1", "eu", &["FRA".into()], 1_000);
        node.instances.insert("1.2.3.4".into(), instance);
        node.external_score_cache.per_region.insert(
            "FRA".into(),
            ExternalScore {
                rtr: 0.25,
                success_rate: 0.9,
            },
        );
        node
    }

    fn value_of(rendered: &str, metric: &str, label: &str) -> Option<f64> {
        rendered
            .lines()
            .filter(|line| line.starts_with(metric) && line.contains(label))
            .find_map(|line| line.rsplit(' ').next()?.parse().ok())
    }

    #[test]
    fn test_publish_node_renders_all_gauges() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || publish_node(&node()));
        let rendered = handle.render();

        assert_eq!(value_of(&rendered, LATEST_LATENCY, "region=\"eu\""), Some(120.0));
        assert_eq!(value_of(&rendered, AVERAGE_LATENCY, "orchestrator=\"orch.eth\""), Some(120.0));
        assert_eq!(value_of(&rendered, UPTIME_SCORE, "instance=\"1.2.3.4\""), Some(1.0));
        assert_eq!(value_of(&rendered, LATEST_PRICE, "latitude=\"10\""), Some(0.001));
        assert_eq!(value_of(&rendered, LATEST_RTR, "external_region=\"FRA\""), Some(0.25));
        assert_eq!(value_of(&rendered, LATEST_SUCCESS_RATE, "longitude=\"20\""), Some(0.9));
    }

    #[test]
    fn test_failed_probe_leaves_latency_gauges_unset() {
        let mut node = node();
        node.instances.clear();
        let mut stats = RegionalStats::default();
        stats.record(None, 1_000);
        node.regional_stats.insert("us".into(), stats);

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || publish_probe(&node, "us", "5.6.7.8"));
        let rendered = handle.render();

        assert_eq!(value_of(&rendered, LATEST_LATENCY, "region=\"us\""), None);
        assert_eq!(value_of(&rendered, UPTIME_SCORE, "latitude=\"unknown\""), Some(1.0));
    }
}
