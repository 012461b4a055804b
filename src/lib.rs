//! Adaptive admission control for a shared execution resource.
//!
//! A [Sensor] measures how stalled and how busy the resource is, a [Controller] turns each
//! [Sample] into a [Decision] (a concurrency target and a shed probability), and a [Limiter]
//! enforces the latest decision against submitted tasks: running them, queuing them by
//! priority, or shedding them. A [Warden] drives the whole loop on a timer.

pub mod config;
pub mod control;
mod error;
mod limiter;
pub mod monitor;
mod moving_avg;
mod warden;

pub use config::WardenConfig;
pub use control::{
    Controller, ControllerConfig, Decision, Pressure, PressureComponents, Reason,
};
pub use error::ConfigError;
pub use limiter::{Limiter, LimiterConfig, LimiterState, Outcome, ShedReason, TaskOptions};
pub use monitor::{LagMonitor, LatencySummary, MonitorConfig, Sample, Sensor};
pub use warden::Warden;
