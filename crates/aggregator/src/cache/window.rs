use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Number of measurements kept per (node, region) series.
pub const WINDOW_CAPACITY: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub latency: Option<f64>,
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
    /// Milliseconds since the previous measurement of the series, zero for the first.
    pub duration: i64,
}

impl Measurement {
    pub fn is_up(&self) -> bool {
        matches!(self.latency, Some(latency) if latency > 0.0)
    }
}

/// Rolling latency and availability of one node as seen from one region.
///
/// Every derived field is recomputed from `measurements` after each append,
/// never adjusted on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionalStats {
    #[serde(default, skip_serializing_if = "VecDeque::is_empty")]
    pub measurements: VecDeque<Measurement>,
    pub avg_latency: f64,
    pub uptime_ratio: f64,
    pub latest_latency: f64,
}

impl Default for RegionalStats {
    fn default() -> Self {
        Self {
            measurements: VecDeque::with_capacity(WINDOW_CAPACITY),
            avg_latency: -1.0,
            uptime_ratio: 1.0,
            latest_latency: -1.0,
        }
    }
}

impl RegionalStats {
    /// Appends a measurement taken at `now`, evicting the oldest beyond capacity.
    pub fn record(&mut self, latency: Option<f64>, now: i64) {
        let duration = self
            .measurements
            .back()
            .map(|previous| (now - previous.timestamp).max(0))
            .unwrap_or(0);

        self.measurements.push_back(Measurement {
            latency,
            timestamp: now,
            duration,
        });
        while self.measurements.len() > WINDOW_CAPACITY {
            self.measurements.pop_front();
        }

        self.recompute();
    }

    /// Derives average latency and uptime from the stored window.
    ///
    /// The uptime ratio keeps its previous value while the window holds no
    /// elapsed time, which is the case after the first measurement of a series.
    pub fn recompute(&mut self) {
        let Some(latest) = self.measurements.back() else {
            return;
        };
        let latest_latency = latest.latency.unwrap_or(0.0);

        let mut uptime = 0i64;
        let mut downtime = 0i64;
        let mut latency_sum = 0.0;
        let mut latency_entries = 0usize;
        for measurement in &self.measurements {
            match measurement.latency {
                Some(latency) if latency > 0.0 => {
                    uptime += measurement.duration;
                    latency_sum += latency;
                    latency_entries += 1;
                }
                _ => downtime += measurement.duration,
            }
        }

        self.latest_latency = latest_latency;
        self.avg_latency = if latency_entries > 0 {
            latency_sum / latency_entries as f64
        } else {
            latest_latency
        };

        let observed = uptime + downtime;
        if observed > 0 {
            self.uptime_ratio = uptime as f64 / observed as f64;
        }
    }

    /// Drops measurements beyond capacity from records loaded off disk.
    pub(crate) fn enforce_capacity(&mut self) {
        let excess = self.measurements.len().saturating_sub(WINDOW_CAPACITY);
        if excess > 0 {
            self.measurements.drain(..excess);
            self.recompute();
        }
    }
}
