use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{moving_avg::Ewma, Sample};

use super::{
    normalize, shed_probability, Decision, Pressure, PressureComponents, Reason, LAG_STEEPNESS,
    UTILIZATION_STEEPNESS,
};

/// Tuning for [Controller].
///
/// No validation is done. Nonsensical values (e.g. `min_concurrency > max_concurrency`) give
/// odd limits but never panic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// p99 stall, in milliseconds, at which the latency signal reads 0.5 (default: 100).
    pub lag_threshold_ms: f64,
    /// Utilization at which the utilization signal reads 0.5 (default: 0.8).
    pub utilization_threshold: f64,
    /// Weight of the latency signal in the raw pressure (default: 0.5).
    pub lag_weight: f64,
    /// Weight of the utilization signal in the raw pressure (default: 0.5).
    ///
    /// The weights need not sum to 1.
    pub utilization_weight: f64,
    /// EWMA smoothing factor for pressure (default: 0.3).
    pub ewma_alpha: f64,
    /// Upper bound and starting value of the concurrency limit (default: 100).
    pub max_concurrency: usize,
    /// Lower bound of the concurrency limit (default: 1).
    pub min_concurrency: usize,
    /// Added to the limit while pressure is not rising (default: 1).
    pub increase_step: usize,
    /// The limit is multiplied by this while pressure is rising (default: 0.5).
    pub decrease_factor: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            lag_threshold_ms: 100.0,
            utilization_threshold: 0.8,
            lag_weight: 0.5,
            utilization_weight: 0.5,
            ewma_alpha: 0.3,
            max_concurrency: 100,
            min_concurrency: 1,
            increase_step: 1,
            decrease_factor: 0.5,
        }
    }
}

/// Pressure-driven AIMD control of a concurrency limit.
///
/// Each [Sample] is turned into a [Decision]:
///
/// ```text
/// L(t)  = sigmoid(p99 latency, lag threshold, 0.05)
/// U(t)  = sigmoid(utilization, utilization threshold, 10)
/// R(t)  = lag weight * L(t) + utilization weight * U(t)
/// P(t)  = alpha * R(t) + (1 - alpha) * P(t-1),  P(0) = 0
///
/// C(t)  = floor(C(t-1) * decrease factor)  if P(t) > P(t-1)
///       = C(t-1) + increase step           otherwise
///         clamped to [min, max], C(0) = max
///
/// shed  = 0                      if P(t) <= 0.5
///       = min(1, (P(t) - 0.5) / 0.5)  otherwise
/// ```
///
/// The controller owns its state and does no I/O; feed it samples in order.
#[derive(Debug, Clone)]
pub struct Controller {
    config: ControllerConfig,
    pressure: Ewma,
    previous_pressure: f64,
    concurrency: usize,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            pressure: Ewma::new(config.ewma_alpha),
            previous_pressure: 0.0,
            concurrency: config.max_concurrency,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// The current concurrency limit.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// The current smoothed pressure.
    pub fn pressure(&self) -> f64 {
        self.pressure.value()
    }

    /// Fold a new sample into the control state and decide what the limiter should do.
    pub fn update(&mut self, sample: &Sample) -> Decision {
        let config = &self.config;

        let latency = normalize(sample.latency.p99, config.lag_threshold_ms, LAG_STEEPNESS);
        let utilization = normalize(
            sample.utilization,
            config.utilization_threshold,
            UTILIZATION_STEEPNESS,
        );
        let raw = config.lag_weight * latency + config.utilization_weight * utilization;

        self.previous_pressure = self.pressure.value();
        let pressure = self.pressure.update(raw);

        let mut reasons = Vec::with_capacity(2);
        let concurrency = if pressure > self.previous_pressure {
            reasons.push(Reason::PressureRising);
            (self.concurrency as f64 * config.decrease_factor).floor() as usize
        } else {
            reasons.push(Reason::PressureFalling);
            self.concurrency.saturating_add(config.increase_step)
        };
        // Not `clamp`, which panics when min > max.
        self.concurrency = concurrency
            .min(config.max_concurrency)
            .max(config.min_concurrency);

        if latency > utilization {
            reasons.push(Reason::DominantLag);
        } else if utilization > latency {
            reasons.push(Reason::DominantUtilization);
        }

        let shed_probability = shed_probability(pressure);

        trace!(
            pressure,
            latency,
            utilization,
            target_concurrency = self.concurrency,
            shed_probability,
            "control decision"
        );

        Decision {
            timestamp: sample.timestamp,
            pressure: Pressure {
                value: pressure,
                components: PressureComponents {
                    latency,
                    utilization,
                },
            },
            target_concurrency: self.concurrency,
            shed_probability,
            reasons,
        }
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new(ControllerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use crate::LatencySummary;

    use super::*;

    fn sample(p99: f64, utilization: f64) -> Sample {
        Sample {
            timestamp: 1_700_000_000_000,
            latency: LatencySummary {
                p99,
                ..LatencySummary::default()
            },
            utilization,
        }
    }

    fn high() -> Sample {
        sample(300.0, 1.0)
    }

    fn low() -> Sample {
        sample(0.0, 0.0)
    }

    /// p99 latency at which the latency signal reads `target`.
    fn lag_for(target: f64) -> f64 {
        100.0 - (1.0 / target - 1.0).ln() / LAG_STEEPNESS
    }

    #[test]
    fn at_threshold() {
        let mut controller = Controller::default();
        let decision = controller.update(&sample(100.0, 0.8));

        assert_eq!(decision.pressure.components.latency, 0.5);
        assert_eq!(decision.pressure.components.utilization, 0.5);
        assert!((decision.pressure.value - 0.15).abs() < 1e-12);
        assert_eq!(decision.target_concurrency, 50);
        assert_eq!(decision.shed_probability, 0.0);
        assert_eq!(decision.reasons, vec![Reason::PressureRising]);
    }

    #[test]
    fn timestamp_is_carried_through() {
        let mut controller = Controller::default();
        let decision = controller.update(&Sample {
            timestamp: 1234567890,
            ..low()
        });
        assert_eq!(decision.timestamp, 1234567890);
    }

    #[test]
    fn first_update_decreases_from_max() {
        let mut controller = Controller::new(ControllerConfig {
            max_concurrency: 42,
            ..ControllerConfig::default()
        });
        assert_eq!(controller.concurrency(), 42);

        // Even a quiet sample raises pressure above the initial zero.
        let decision = controller.update(&low());
        assert_eq!(decision.target_concurrency, 21);
    }

    #[test]
    fn weights_select_signals() {
        let mut controller = Controller::new(ControllerConfig {
            lag_weight: 1.0,
            utilization_weight: 0.0,
            ..ControllerConfig::default()
        });
        let decision = controller.update(&sample(100.0, 1.0));
        assert!((decision.pressure.value - 0.3 * 0.5).abs() < 1e-12);
    }

    #[test]
    fn ewma_recurrence() {
        let mut controller = Controller::default();
        let s = sample(200.0, 1.0);
        let raw = 0.5 * normalize(200.0, 100.0, LAG_STEEPNESS)
            + 0.5 * normalize(1.0, 0.8, UTILIZATION_STEEPNESS);

        let first = controller.update(&s);
        assert!((first.pressure.value - 0.3 * raw).abs() < 1e-12);

        let second = controller.update(&s);
        let expected = 0.3 * raw + 0.7 * first.pressure.value;
        assert!((second.pressure.value - expected).abs() < 1e-12);
    }

    #[test]
    fn spikes_are_smoothed() {
        let mut controller = Controller::default();
        for _ in 0..3 {
            controller.update(&low());
        }
        let spike = controller.update(&high());
        assert!(spike.pressure.value < 0.5);
    }

    #[test]
    fn unchanged_pressure_increases() {
        let mut controller = Controller::new(ControllerConfig {
            ewma_alpha: 1.0,
            ..ControllerConfig::default()
        });
        let first = controller.update(&sample(100.0, 0.8));
        assert_eq!(first.target_concurrency, 50);

        let second = controller.update(&sample(100.0, 0.8));
        assert!(second.reasons.contains(&Reason::PressureFalling));
        assert_eq!(second.target_concurrency, 51);
    }

    #[test]
    fn sustained_high_pressure_reaches_min() {
        let mut controller = Controller::new(ControllerConfig {
            min_concurrency: 5,
            ..ControllerConfig::default()
        });

        let mut previous = controller.concurrency();
        for _ in 0..30 {
            let decision = controller.update(&high());
            assert!(decision.target_concurrency <= previous);
            assert!(decision.reasons.contains(&Reason::PressureRising));
            previous = decision.target_concurrency;
        }
        assert_eq!(previous, 5);
    }

    #[test]
    fn sustained_low_pressure_reaches_max() {
        let mut controller = Controller::default();
        for _ in 0..5 {
            controller.update(&high());
        }
        let mut previous = controller.concurrency();
        assert_eq!(previous, 3);

        for _ in 0..150 {
            let decision = controller.update(&low());
            assert!(decision.target_concurrency >= previous);
            assert!(decision.reasons.contains(&Reason::PressureFalling));
            previous = decision.target_concurrency;
        }
        assert_eq!(previous, 100);
    }

    #[test]
    fn increase_is_capped() {
        let mut controller = Controller::new(ControllerConfig {
            max_concurrency: 10,
            increase_step: 100,
            ..ControllerConfig::default()
        });
        controller.update(&high());
        let decision = controller.update(&low());
        assert!(decision.reasons.contains(&Reason::PressureFalling));
        assert_eq!(decision.target_concurrency, 10);
    }

    #[test]
    fn inverted_bounds_do_not_panic() {
        let mut controller = Controller::new(ControllerConfig {
            min_concurrency: 20,
            max_concurrency: 10,
            ..ControllerConfig::default()
        });
        let decision = controller.update(&high());
        assert_eq!(decision.target_concurrency, 20);
    }

    #[test]
    fn shed_probability_follows_pressure() {
        let config = ControllerConfig {
            ewma_alpha: 1.0,
            lag_weight: 1.0,
            utilization_weight: 0.0,
            ..ControllerConfig::default()
        };

        let decision = Controller::new(config).update(&sample(lag_for(0.75), 0.0));
        assert!((decision.pressure.value - 0.75).abs() < 1e-9);
        assert!((decision.shed_probability - 0.5).abs() < 1e-9);

        let decision = Controller::new(config).update(&sample(lag_for(0.6), 0.0));
        assert!((decision.shed_probability - 0.2).abs() < 1e-9);

        let decision = Controller::default().update(&low());
        assert_eq!(decision.shed_probability, 0.0);

        let mut saturated = Controller::new(ControllerConfig {
            ewma_alpha: 1.0,
            ..ControllerConfig::default()
        });
        let decision = saturated.update(&sample(1000.0, 2.0));
        assert!((decision.shed_probability - 1.0).abs() < 1e-3);
    }

    #[test]
    fn dominant_signal() {
        let decision = Controller::default().update(&sample(200.0, 0.0));
        assert!(decision.reasons.contains(&Reason::DominantLag));
        assert!(!decision.reasons.contains(&Reason::DominantUtilization));

        let decision = Controller::default().update(&sample(0.0, 1.0));
        assert!(decision.reasons.contains(&Reason::DominantUtilization));
        assert!(!decision.reasons.contains(&Reason::DominantLag));
    }

    mod proptest_controller {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// The limit always stays within the configured bounds.
            #[test]
            fn target_is_clamped(
                samples in prop::collection::vec((0.0f64..1000.0, 0.0f64..1.0), 1..50),
                min in 1usize..20,
                span in 0usize..200,
                increase_step in 0usize..10,
                decrease_factor in 0.0f64..1.0,
            ) {
                let max = min + span;
                let mut controller = Controller::new(ControllerConfig {
                    min_concurrency: min,
                    max_concurrency: max,
                    increase_step,
                    decrease_factor,
                    ..ControllerConfig::default()
                });
                for (p99, utilization) in samples {
                    let decision = controller.update(&sample(p99, utilization));
                    prop_assert!(decision.target_concurrency >= min);
                    prop_assert!(decision.target_concurrency <= max);
                    prop_assert!((0.0..=1.0).contains(&decision.shed_probability));
                }
            }
        }
    }
}
