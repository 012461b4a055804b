use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{runtime::Handle, task::JoinHandle, time::Instant};

use super::{unix_millis, LatencySummary, Sample, Sensor};

/// Stalls kept for percentile estimation per window. Totals keep counting past this.
const MAX_RECORDED_STALLS: usize = 1 << 16;

/// Configuration for [LagMonitor].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// How often the probe wakes up to measure stalls (default: 20ms).
    pub resolution_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { resolution_ms: 20 }
    }
}

/// Measures how long the tokio runtime fails to run a ready task on time, and how busy its
/// workers are.
///
/// A probe task sleeps for `resolution` over and over. Whenever it wakes late, the overshoot is
/// recorded as a stall: the runtime was too busy to poll it. Utilization comes from the
/// runtime's own worker busy time, averaged over all workers.
#[derive(Debug)]
pub struct LagMonitor {
    resolution: Duration,
    window: Arc<Mutex<StallWindow>>,
    probe: Option<JoinHandle<()>>,
    busy: Option<BusyClock>,
}

/// Worker busy time of a runtime since the last reading.
#[derive(Debug)]
struct BusyClock {
    handle: Handle,
    workers: usize,
    busy: Duration,
    since: std::time::Instant,
}

#[derive(Debug)]
struct StallWindow {
    stalls_ms: Vec<f64>,
    total_ms: f64,
    max_ms: f64,
    count: u64,
}

impl LagMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            resolution: Duration::from_millis(config.resolution_ms.max(1)),
            window: Arc::new(Mutex::new(StallWindow::new())),
            probe: None,
            busy: None,
        }
    }

    /// Whether the probe task is currently measuring.
    pub fn is_running(&self) -> bool {
        self.probe.is_some()
    }
}

impl Default for LagMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl Sensor for LagMonitor {
    /// Spawns the probe on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    fn start(&mut self) {
        if self.probe.is_some() {
            return;
        }
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        self.busy = Some(BusyClock::new(Handle::current()));

        let window = Arc::clone(&self.window);
        let resolution = self.resolution;
        self.probe = Some(tokio::spawn(async move {
            loop {
                let start = Instant::now();
                tokio::time::sleep(resolution).await;
                let stall = start.elapsed().saturating_sub(resolution);
                window
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record(stall);
            }
        }));
    }

    fn stop(&mut self) {
        if let Some(probe) = self.probe.take() {
            probe.abort();
        }
        self.busy = None;
    }

    fn sample(&mut self) -> Sample {
        let utilization = self.busy.as_mut().map_or(0.0, BusyClock::utilization);
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let sample = Sample {
            timestamp: unix_millis(),
            latency: window.summarize(),
            utilization,
        };
        window.reset();
        sample
    }
}

impl Drop for LagMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl BusyClock {
    fn new(handle: Handle) -> Self {
        let workers = handle.metrics().num_workers().max(1);
        let mut clock = Self {
            handle,
            workers,
            busy: Duration::ZERO,
            since: std::time::Instant::now(),
        };
        clock.busy = clock.total_busy();
        clock
    }

    fn total_busy(&self) -> Duration {
        let metrics = self.handle.metrics();
        (0..self.workers)
            .map(|worker| metrics.worker_total_busy_duration(worker))
            .sum()
    }

    /// Fraction of worker time spent busy since the previous reading, in `[0, 1]`.
    fn utilization(&mut self) -> f64 {
        let busy = self.total_busy();
        let now = std::time::Instant::now();
        let elapsed = now.duration_since(self.since).as_secs_f64() * self.workers as f64;
        let delta = busy.saturating_sub(self.busy).as_secs_f64();
        self.busy = busy;
        self.since = now;

        if elapsed > 0.0 {
            (delta / elapsed).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

impl StallWindow {
    fn new() -> Self {
        Self {
            stalls_ms: Vec::new(),
            total_ms: 0.0,
            max_ms: 0.0,
            count: 0,
        }
    }

    fn record(&mut self, stall: Duration) {
        let ms = stall.as_secs_f64() * 1000.0;
        if self.stalls_ms.len() < MAX_RECORDED_STALLS {
            self.stalls_ms.push(ms);
        }
        self.total_ms += ms;
        self.max_ms = self.max_ms.max(ms);
        self.count += 1;
    }

    fn reset(&mut self) {
        self.stalls_ms.clear();
        self.total_ms = 0.0;
        self.max_ms = 0.0;
        self.count = 0;
    }

    fn summarize(&mut self) -> LatencySummary {
        if self.count == 0 {
            return LatencySummary::default();
        }
        self.stalls_ms.sort_by(f64::total_cmp);
        LatencySummary {
            p50: percentile(&self.stalls_ms, 50.0),
            p90: percentile(&self.stalls_ms, 90.0),
            p99: percentile(&self.stalls_ms, 99.0),
            mean: self.total_ms / self.count as f64,
            max: self.max_ms,
        }
    }
}

/// Nearest-rank percentile of an ascending slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
