//! Load sensors: measure how stalled and how busy the protected runtime is.

mod lag;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub use lag::{LagMonitor, MonitorConfig};

/// A measurement of the protected resource over one sampling window.
///
/// Windows never overlap: a sensor resets its accumulators as soon as it
/// produces a sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// When the sample was taken, in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Distribution of stall durations observed during the window.
    pub latency: LatencySummary,
    /// Fraction of the window the resource was busy, in `[0, 1]`.
    pub utilization: f64,
}

/// Stall duration percentiles, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    pub mean: f64,
    pub max: f64,
}

/// Something that can measure load on the protected resource.
///
/// `start` and `stop` are idempotent. Each call to `sample` covers the
/// time since the previous call (or since `start`) and resets the
/// accumulated measurements.
pub trait Sensor {
    fn start(&mut self);
    fn stop(&mut self);
    fn sample(&mut self) -> Sample;
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
