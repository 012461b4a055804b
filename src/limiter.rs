use std::{
    cmp::Reverse,
    collections::BTreeMap,
    fmt,
    future::Future,
    pin::Pin,
    sync::{Mutex, MutexGuard, PoisonError},
    task::{self, Poll},
    time::Duration,
};

use pin_project_lite::pin_project;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::oneshot,
    time::{sleep, Sleep},
};
use tracing::{debug, trace};

use crate::Decision;

/// Limits the number of concurrently running tasks according to the latest [Decision].
///
/// Each submission is either run straight away, queued until a slot frees up, or shed. Queued
/// submissions are released in priority order, oldest first among equal priorities.
///
/// Until the first decision arrives every submission runs immediately.
#[derive(Debug)]
pub struct Limiter {
    max_queue: usize,
    queue_timeout: Option<Duration>,
    inner: LimiterInner,
}

/// Configuration for [Limiter].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Maximum number of queued submissions (default: 1000).
    pub max_queue: usize,
    /// How long a submission may wait in the queue before being shed (default: forever).
    pub queue_timeout_ms: Option<u64>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_queue: 1000,
            queue_timeout_ms: None,
        }
    }
}

#[derive(Debug)]
struct LimiterInner {
    state: Mutex<State>,
}

struct State {
    decision: Option<Decision>,
    running: usize,
    queue: BTreeMap<QueueKey, oneshot::Sender<()>>,
    next_seq: u64,
    rng: StdRng,
}

/// Orders the queue by priority (highest first), then by arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<i32>,
    seq: u64,
}

/// Per-submission options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskOptions {
    /// Higher runs first when queued.
    pub priority: i32,
}

impl TaskOptions {
    pub fn priority(priority: i32) -> Self {
        Self { priority }
    }
}

/// What happened to a submission which didn't fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The task ran and produced a value.
    Executed(T),
    /// The task was rejected without running.
    Shed(ShedReason),
}

/// Why a submission was shed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShedReason {
    /// Reserved for an up-front pressure check. Not produced by [Limiter::submit].
    PressureHigh,
    /// The queue was full.
    QueueOverflow,
    /// Randomly rejected according to the decision's shed probability.
    ProbabilisticShedding,
    /// Waited in the queue for longer than the configured timeout.
    QueueTimeout,
}

/// A snapshot of the state of the [Limiter], taken under a single lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterState {
    target: Option<usize>,
    running: usize,
    queued: usize,
}

/// A running slot. Dropping it frees the slot and drains the queue.
struct Token<'t> {
    limiter: &'t LimiterInner,
}

enum Admission<'t> {
    Run(Token<'t>),
    Queued(Queued<'t>),
    Shed(ShedReason),
}

enum Dequeued {
    Granted,
    TimedOut,
}

impl Limiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    /// Use the given random source for probabilistic shedding.
    pub fn with_rng(config: LimiterConfig, rng: StdRng) -> Self {
        Self {
            max_queue: config.max_queue,
            queue_timeout: config.queue_timeout_ms.map(Duration::from_millis),
            inner: LimiterInner {
                state: Mutex::new(State {
                    decision: None,
                    running: 0,
                    queue: BTreeMap::new(),
                    next_seq: 0,
                    rng,
                }),
            },
        }
    }

    /// Replace the current decision and release whatever the new limit allows.
    pub fn update_decision(&self, decision: Decision) {
        let mut state = self.inner.lock();
        state.decision = Some(decision);
        state.drain();
    }

    /// The most recently applied decision, if any.
    pub fn decision(&self) -> Option<Decision> {
        self.inner.lock().decision.clone()
    }

    /// Run `task` once the current decision allows it.
    ///
    /// Returns [Outcome::Shed] if the task was rejected without running. An error returned by
    /// the task itself is passed through unchanged.
    ///
    /// Waits while the submission is queued. Dropping the returned future gives up its place in
    /// the queue, or its slot if it was already running.
    pub async fn submit<F, Fut, T, E>(
        &self,
        task: F,
        options: TaskOptions,
    ) -> Result<Outcome<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let token = match self.admit(options.priority) {
            Admission::Run(token) => token,
            Admission::Shed(reason) => return Ok(Outcome::Shed(reason)),
            // Released from the queue: already counted as running and never re-checked for
            // shedding, even if the decision changed while waiting.
            Admission::Queued(queued) => match queued.await {
                Dequeued::Granted => Token::new(&self.inner),
                Dequeued::TimedOut => {
                    debug!(priority = options.priority, "queued submission timed out");
                    return Ok(Outcome::Shed(ShedReason::QueueTimeout));
                }
            },
        };

        let result = task().await;
        drop(token);
        result.map(Outcome::Executed)
    }

    /// Decide what to do with a fresh submission.
    fn admit(&self, priority: i32) -> Admission<'_> {
        let mut state = self.inner.lock();

        let Some((target, shed_probability)) = state
            .decision
            .as_ref()
            .map(|d| (d.target_concurrency, d.shed_probability))
        else {
            state.running += 1;
            return Admission::Run(Token::new(&self.inner));
        };

        if shed_probability > 0.0 && state.rng.random::<f64>() < shed_probability {
            debug!(priority, shed_probability, "shedding submission");
            return Admission::Shed(ShedReason::ProbabilisticShedding);
        }

        if state.running < target {
            state.running += 1;
            return Admission::Run(Token::new(&self.inner));
        }

        if state.queue.len() >= self.max_queue {
            debug!(priority, max_queue = self.max_queue, "queue full, shedding submission");
            return Admission::Shed(ShedReason::QueueOverflow);
        }

        let key = QueueKey {
            priority: Reverse(priority),
            seq: state.next_seq,
        };
        state.next_seq += 1;
        let (tx, rx) = oneshot::channel();
        state.queue.insert(key, tx);
        trace!(priority, queued = state.queue.len(), "submission queued");

        Admission::Queued(Queued {
            limiter: &self.inner,
            key,
            rx,
            deadline: self.queue_timeout.map(sleep),
            done: false,
        })
    }

    /// The current state of the limiter.
    pub fn state(&self) -> LimiterState {
        let state = self.inner.lock();
        LimiterState {
            target: state.decision.as_ref().map(|d| d.target_concurrency),
            running: state.running,
            queued: state.queue.len(),
        }
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new(LimiterConfig::default())
    }
}

impl LimiterInner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl State {
    /// Release queued submissions while there is spare capacity.
    ///
    /// Each release takes its running slot immediately, so one pass never releases more than
    /// `target - running` submissions.
    fn drain(&mut self) {
        let Some(target) = self.decision.as_ref().map(|d| d.target_concurrency) else {
            return;
        };
        while self.running < target {
            let Some((key, waiter)) = self.queue.pop_first() else {
                break;
            };
            // The waiter may have been dropped; skip it without taking a slot.
            if waiter.send(()).is_ok() {
                self.running += 1;
                trace!(priority = key.priority.0, running = self.running, "released from queue");
            }
        }
    }

    fn release(&mut self) {
        self.running = self.running.saturating_sub(1);
        self.drain();
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("decision", &self.decision)
            .field("running", &self.running)
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl<'t> Token<'t> {
    /// Wraps a slot which has already been counted as running.
    fn new(limiter: &'t LimiterInner) -> Self {
        Self { limiter }
    }
}

impl Drop for Token<'_> {
    /// Reduces the number of running tasks, regardless of how the task ended.
    fn drop(&mut self) {
        self.limiter.lock().release();
    }
}

impl LimiterState {
    /// The current concurrency target, or `None` while unrestricted.
    pub fn target(&self) -> Option<usize> {
        self.target
    }
    /// The number of tasks running.
    pub fn running(&self) -> usize {
        self.running
    }
    /// The number of submissions waiting in the queue.
    pub fn queued(&self) -> usize {
        self.queued
    }
}

impl ShedReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ShedReason::PressureHigh => "pressure_high",
            ShedReason::QueueOverflow => "queue_overflow",
            ShedReason::ProbabilisticShedding => "probabilistic_shedding",
            ShedReason::QueueTimeout => "queue_timeout",
        }
    }
}

impl fmt::Display for ShedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<T> Outcome<T> {
    pub fn is_executed(&self) -> bool {
        matches!(self, Outcome::Executed(_))
    }

    pub fn is_shed(&self) -> bool {
        matches!(self, Outcome::Shed(_))
    }

    /// The value produced by the task, if it ran.
    pub fn executed(self) -> Option<T> {
        match self {
            Outcome::Executed(value) => Some(value),
            Outcome::Shed(_) => None,
        }
    }

    pub fn shed_reason(&self) -> Option<ShedReason> {
        match self {
            Outcome::Executed(_) => None,
            Outcome::Shed(reason) => Some(*reason),
        }
    }
}

pin_project! {
    /// A submission waiting in the queue for a drain to release it.
    struct Queued<'t> {
        limiter: &'t LimiterInner,
        key: QueueKey,
        rx: oneshot::Receiver<()>,
        #[pin]
        deadline: Option<Sleep>,
        done: bool,
    }

    impl PinnedDrop for Queued<'_> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if *this.done {
                return;
            }

            let mut state = this.limiter.lock();
            if state.queue.remove(&*this.key).is_some() {
                // Still waiting; leaving the queue is enough.
                return;
            }
            // We were released but aren't around to run. Give the slot to someone else.
            if this.rx.try_recv().is_ok() {
                state.release();
            }
        }
    }
}

impl Future for Queued<'_> {
    type Output = Dequeued;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Poll::Ready(granted) = Pin::new(&mut *this.rx).poll(cx) {
            // Only a drain takes the sender out of the queue, and it always sends first.
            debug_assert!(granted.is_ok(), "queue entry dropped without a grant");
            *this.done = true;
            return Poll::Ready(Dequeued::Granted);
        }

        let Some(deadline) = this.deadline.as_pin_mut() else {
            return Poll::Pending;
        };
        if deadline.poll(cx).is_pending() {
            return Poll::Pending;
        }

        *this.done = true;
        let mut state = this.limiter.lock();
        if state.queue.remove(&*this.key).is_some() {
            return Poll::Ready(Dequeued::TimedOut);
        }
        // A drain released us at the same time as the deadline fired. The slot is ours.
        drop(state);
        let granted = this.rx.try_recv();
        debug_assert!(granted.is_ok(), "queue entry dropped without a grant");
        Poll::Ready(Dequeued::Granted)
    }
}
