//! Turning load measurements into admission control decisions.

mod aimd;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use aimd::{Controller, ControllerConfig};

/// Steepness of the latency sigmoid, per millisecond.
pub const LAG_STEEPNESS: f64 = 0.05;
/// Steepness of the utilization sigmoid.
pub const UTILIZATION_STEEPNESS: f64 = 10.0;
/// Smoothed pressure above which new submissions start being shed.
pub const SHED_THRESHOLD: f64 = 0.5;

/// The output of a [Controller], applied by a [Limiter](crate::Limiter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Copied from the [Sample](crate::Sample) which produced this decision.
    pub timestamp: u64,
    pub pressure: Pressure,
    /// How many tasks may run at once.
    pub target_concurrency: usize,
    /// Probability in `[0, 1]` that a new submission is rejected outright.
    pub shed_probability: f64,
    /// Why the decision came out the way it did. Diagnostic only.
    pub reasons: Vec<Reason>,
}

/// Smoothed composite load, and the normalized signals it was built from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pressure {
    pub value: f64,
    pub components: PressureComponents,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PressureComponents {
    pub latency: f64,
    pub utilization: f64,
}

/// A tag explaining part of a [Decision].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reason {
    #[serde(rename = "pressure rising: multiplicative decrease")]
    PressureRising,
    #[serde(rename = "pressure falling: additive increase")]
    PressureFalling,
    #[serde(rename = "dominant signal: lag")]
    DominantLag,
    #[serde(rename = "dominant signal: elu")]
    DominantUtilization,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::PressureRising => "pressure rising: multiplicative decrease",
            Reason::PressureFalling => "pressure falling: additive increase",
            Reason::DominantLag => "dominant signal: lag",
            Reason::DominantUtilization => "dominant signal: elu",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logistic curve centred on `threshold`.
///
/// ```text
/// normalize(x) = 1 / (1 + e^(-steepness * (x - threshold)))
/// ```
///
/// Exactly 0.5 at the threshold, approaching 0 far below it and 1 far above it.
pub fn normalize(value: f64, threshold: f64, steepness: f64) -> f64 {
    1.0 / (1.0 + (-steepness * (value - threshold)).exp())
}

/// Linear ramp from 0 at [SHED_THRESHOLD] to 1 at full pressure.
pub fn shed_probability(pressure: f64) -> f64 {
    if pressure <= SHED_THRESHOLD {
        0.0
    } else {
        ((pressure - SHED_THRESHOLD) / (1.0 - SHED_THRESHOLD)).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_half_at_threshold() {
        assert_eq!(normalize(100.0, 100.0, LAG_STEEPNESS), 0.5);
        assert_eq!(normalize(0.8, 0.8, UTILIZATION_STEEPNESS), 0.5);
        assert_eq!(normalize(-3.0, -3.0, 1234.0), 0.5);
    }

    #[test]
    fn normalize_saturates() {
        assert!(normalize(300.0, 100.0, LAG_STEEPNESS) > 0.99);
        assert!(normalize(0.0, 100.0, LAG_STEEPNESS) < 0.01);
        assert!(normalize(1.5, 0.8, UTILIZATION_STEEPNESS) > 0.99);
        assert!(normalize(0.0, 0.8, UTILIZATION_STEEPNESS) < 0.01);
    }

    #[test]
    fn shed_ramp() {
        assert_eq!(shed_probability(0.0), 0.0);
        assert_eq!(shed_probability(0.5), 0.0);
        assert_eq!(shed_probability(0.75), 0.5);
        assert_eq!(shed_probability(1.0), 1.0);
        assert_eq!(shed_probability(3.0), 1.0);
        assert!((shed_probability(0.6) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn reasons_serialize_as_tags() {
        #[derive(Serialize)]
        struct Tagged {
            reason: Reason,
        }
        let encoded = toml::to_string(&Tagged {
            reason: Reason::DominantUtilization,
        })
        .unwrap();
        assert_eq!(encoded.trim(), "reason = \"dominant signal: elu\"");
        assert_eq!(Reason::PressureRising.to_string(), Reason::PressureRising.as_str());
    }

    mod proptest_normalize {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Normalized values are strictly inside (0, 1) for moderate inputs.
            #[test]
            fn bounded(
                x in -50.0f64..50.0,
                threshold in -10.0f64..10.0,
                steepness in 0.01f64..0.5,
            ) {
                let n = normalize(x, threshold, steepness);
                prop_assert!(n > 0.0 && n < 1.0, "normalize({x}) = {n}");
            }

            /// Normalization never decreases as the raw signal grows.
            #[test]
            fn monotonic(
                a in -1000.0f64..1000.0,
                b in -1000.0f64..1000.0,
                threshold in -100.0f64..100.0,
                steepness in 0.001f64..20.0,
            ) {
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                prop_assert!(normalize(lo, threshold, steepness) <= normalize(hi, threshold, steepness));
            }
        }
    }
}
