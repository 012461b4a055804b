use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::{
    Controller, Decision, LagMonitor, Limiter, Outcome, Sensor, TaskOptions, WardenConfig,
};

/// Wires a [Sensor], a [Controller] and a [Limiter] together on a fixed interval.
///
/// Every tick the sensor is sampled, the controller turns the sample into a [Decision], and the
/// limiter starts enforcing it. Submissions go straight to the limiter at any time.
pub struct Warden<S = LagMonitor> {
    limiter: Arc<Limiter>,
    pipeline: Arc<Mutex<Pipeline<S>>>,
    interval: Duration,
    ticker: Option<JoinHandle<()>>,
}

struct Pipeline<S> {
    sensor: S,
    controller: Controller,
    last_decision: Option<Decision>,
}

impl Warden<LagMonitor> {
    pub fn new(config: WardenConfig) -> Self {
        Self::from_parts(
            LagMonitor::new(config.monitor),
            Controller::new(config.controller),
            Limiter::new(config.limiter),
            config.interval(),
        )
    }
}

impl Default for Warden<LagMonitor> {
    fn default() -> Self {
        Self::new(WardenConfig::default())
    }
}

impl<S> Warden<S>
where
    S: Sensor + Send + 'static,
{
    /// Build from existing parts.
    pub fn from_parts(
        sensor: S,
        controller: Controller,
        limiter: impl Into<Arc<Limiter>>,
        interval: Duration,
    ) -> Self {
        Self {
            limiter: limiter.into(),
            pipeline: Arc::new(Mutex::new(Pipeline {
                sensor,
                controller,
                last_decision: None,
            })),
            interval,
            ticker: None,
        }
    }

    /// Start the sensor and the control loop on the current tokio runtime.
    ///
    /// The first tick happens one interval after starting. Does nothing if already started.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn start(&mut self) {
        if self.ticker.is_some() {
            return;
        }
        lock(&self.pipeline).sensor.start();

        let pipeline = Arc::clone(&self.pipeline);
        let limiter = Arc::clone(&self.limiter);
        let period = self.interval.max(Duration::from_millis(1));
        self.ticker = Some(tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                run_tick(&pipeline, &limiter);
            }
        }));
        info!(interval_ms = period.as_millis() as u64, "warden started");
    }

    /// Stop the control loop and the sensor. Does nothing if not started.
    ///
    /// The limiter keeps enforcing the last decision.
    pub fn stop(&mut self) {
        let Some(ticker) = self.ticker.take() else {
            return;
        };
        ticker.abort();
        lock(&self.pipeline).sensor.stop();
        info!("warden stopped");
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    /// Run one control cycle now: sample, decide, apply.
    pub fn tick(&self) -> Decision {
        run_tick(&self.pipeline, &self.limiter)
    }

    /// Submit a task to the limiter. See [Limiter::submit].
    pub async fn submit<F, Fut, T, E>(
        &self,
        task: F,
        options: TaskOptions,
    ) -> Result<Outcome<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.limiter.submit(task, options).await
    }

    pub fn limiter(&self) -> &Arc<Limiter> {
        &self.limiter
    }

    /// The decision produced by the most recent tick.
    pub fn last_decision(&self) -> Option<Decision> {
        lock(&self.pipeline).last_decision.clone()
    }
}

impl<S> Drop for Warden<S> {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

fn run_tick<S: Sensor>(pipeline: &Mutex<Pipeline<S>>, limiter: &Limiter) -> Decision {
    let decision = {
        let mut pipeline = lock(pipeline);
        let sample = pipeline.sensor.sample();
        let decision = pipeline.controller.update(&sample);
        pipeline.last_decision = Some(decision.clone());
        decision
    };
    debug!(
        pressure = decision.pressure.value,
        target_concurrency = decision.target_concurrency,
        shed_probability = decision.shed_probability,
        "control tick"
    );
    limiter.update_decision(decision.clone());
    decision
}

fn lock<S>(pipeline: &Mutex<Pipeline<S>>) -> std::sync::MutexGuard<'_, Pipeline<S>> {
    pipeline.lock().unwrap_or_else(PoisonError::into_inner)
}
