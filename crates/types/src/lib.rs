//! Wire types exchanged between probers and the aggregator.
//!
//! Field names follow the JSON produced by probers in the field, so every
//! struct here is `camelCase` on the wire and tolerant of missing optional
//! fields.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Error string reported by nodes that are reachable but refuse to quote
/// because the probing account has no reserve deposited.
pub const INSUFFICIENT_RESERVE: &str = "insufficient sender reserve";

/// Milliseconds since the unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A node to be probed, as published by the population source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    #[serde(rename = "serviceURI")]
    pub service_uri: String,
}

impl Target {
    pub fn new(id: impl Into<String>, service_uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            service_uri: service_uri.into(),
        }
    }

    /// Both fields must be non-empty for the target to be probed.
    pub fn is_well_formed(&self) -> bool {
        !self.id.trim().is_empty() && !self.service_uri.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceInfo {
    pub price_per_unit: f64,
    pub pixels_per_unit: f64,
}

impl PriceInfo {
    /// Price of a single pixel, or `None` when the quote is degenerate.
    pub fn price_per_pixel(&self) -> Option<f64> {
        if self.pixels_per_unit > 0.0 && self.price_per_unit.is_finite() {
            Some(self.price_per_unit / self.pixels_per_unit)
        } else {
            None
        }
    }
}

/// Outcome of a single probe attempt.
///
/// `latency` is `None` whenever `error` is set or the attempt timed out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProbeResult {
    pub latency: Option<f64>,
    pub price_info: Option<PriceInfo>,
    pub version: Option<String>,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn success(latency_ms: f64, price_info: Option<PriceInfo>, version: Option<String>) -> Self {
        Self {
            latency: Some(latency_ms),
            price_info,
            version,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Latency usable for statistics: present and strictly positive.
    pub fn measured_latency(&self) -> Option<f64> {
        match (self.error.as_deref(), self.latency) {
            (None, Some(latency)) if latency > 0.0 => Some(latency),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// DNS and geolocation data for a node, as resolved by one prober.
///
/// A failed lookup leaves `resolved_target` and `geo_lookup` empty; such a
/// record is still cached by the prober until its TTL lapses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnrichmentRecord {
    pub original_target: Option<String>,
    pub resolved_target: Option<String>,
    pub geo_lookup: Option<GeoLocation>,
    pub geo_from: Option<String>,
    pub last_time: i64,
}

/// Per-node entry of a submitted batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeReport {
    pub discovery: ProbeResult,
    pub resolv: EnrichmentRecord,
}

/// Batch of probe results submitted by one prober after a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub batch_results: BTreeMap<String, NodeReport>,
    pub tag: String,
    pub key: String,
    pub region: String,
    pub external_regions: Vec<String>,
}

/// Aggregator answer to a report submission.
///
/// Serialized as `true`, `false` or `"busy"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitResponse {
    Accepted,
    Rejected,
    Busy,
}

impl fmt::Display for SubmitResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "true"),
            Self::Rejected => write!(f, "false"),
            Self::Busy => write!(f, "busy"),
        }
    }
}

impl FromStr for SubmitResponse {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_matches('"') {
            "true" => Ok(Self::Accepted),
            "false" => Ok(Self::Rejected),
            "busy" => Ok(Self::Busy),
            other => Err(format!("unexpected submit response: {other}")),
        }
    }
}

impl Serialize for SubmitResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Accepted => serializer.serialize_bool(true),
            Self::Rejected => serializer.serialize_bool(false),
            Self::Busy => serializer.serialize_str("busy"),
        }
    }
}

impl<'de> Deserialize<'de> for SubmitResponse {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Flag(true) => Ok(Self::Accepted),
            Raw::Flag(false) => Ok(Self::Rejected),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_report_parses_partial_fields() {
        let body = json!({
            "batchResults": {
                "0xabc": {
                    "discovery": {
                        "latency": 120,
                        "priceInfo": { "pricePerUnit": 1, "pixelsPerUnit": 1000 },
                        "error": null
                    },
                    "resolv": {
                        "resolvedTarget": "1.2.3.4",
                        "geoLookup": { "latitude": 10, "longitude": 20 }
                    }
                }
            },
            "tag": "eu1",
            "key": "secret",
            "region": "eu",
            "externalRegions": ["FRA"]
        });

        let report: StatsReport = serde_json::from_value(body).unwrap();
        let node = &report.batch_results["0xabc"];
        assert_eq!(node.discovery.latency, Some(120.0));
        assert_eq!(node.discovery.version, None);
        assert_eq!(
            node.discovery.price_info.and_then(|p| p.price_per_pixel()),
            Some(0.001)
        );
        assert_eq!(node.resolv.resolved_target.as_deref(), Some("1.2.3.4"));
        assert_eq!(node.resolv.last_time, 0);
        assert_eq!(report.external_regions, vec!["FRA".to_string()]);
    }

    #[test]
    fn test_measured_latency_requires_success() {
        assert_eq!(ProbeResult::success(42.0, None, None).measured_latency(), Some(42.0));
        assert_eq!(ProbeResult::success(0.0, None, None).measured_latency(), None);
        assert_eq!(ProbeResult::failure("timeout").measured_latency(), None);

        let contradictory = ProbeResult {
            latency: Some(10.0),
            error: Some("refused".into()),
            ..Default::default()
        };
        assert_eq!(contradictory.measured_latency(), None);
    }

    #[test]
    fn test_degenerate_price_is_ignored() {
        let price = PriceInfo {
            price_per_unit: 5.0,
            pixels_per_unit: 0.0,
        };
        assert_eq!(price.price_per_pixel(), None);
    }

    #[test]
    fn test_submit_response_wire_format() {
        assert_eq!(serde_json::to_string(&SubmitResponse::Accepted).unwrap(), "true");
        assert_eq!(serde_json::to_string(&SubmitResponse::Rejected).unwrap(), "false");
        assert_eq!(serde_json::to_string(&SubmitResponse::Busy).unwrap(), "\"busy\"");

        assert_eq!("true".parse::<SubmitResponse>(), Ok(SubmitResponse::Accepted));
        assert_eq!(" busy\n".parse::<SubmitResponse>(), Ok(SubmitResponse::Busy));
        assert_eq!("\"busy\"".parse::<SubmitResponse>(), Ok(SubmitResponse::Busy));
        assert!("maybe".parse::<SubmitResponse>().is_err());

        let parsed: SubmitResponse = serde_json::from_str("false").unwrap();
        assert_eq!(parsed, SubmitResponse::Rejected);
    }

    #[test]
    fn test_target_well_formed() {
        assert!(Target::new("0xabc", "https://node:8935").is_well_formed());
        assert!(!Target::new("", "https://node:8935").is_well_formed());
        assert!(!Target::new("0xabc", "  ").is_well_formed());
    }
}
