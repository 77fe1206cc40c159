//! Background sampling loop.
//!
//! A [`SamplingWorker`] owns one tokio task that, once per interval, reads a
//! fixed list of channels through an [`ItcClient`] and pushes the result into
//! a [`SampleQueue`].
//!
//! # Lifecycle
//!
//! ```text
//! Idle --start()--> Running --stop()--> Stopping --loop exits--> Stopped
//!   \--------------------------stop()------------------------------^
//! ```
//!
//! - `Stopped` is terminal; a worker cannot be restarted.
//! - `start()` from any state other than `Idle` is a [`DaqError::Lifecycle`] error.
//! - `stop()` never blocks and is a no-op once the worker is stopping or stopped.
//! - `join()` waits for `Stopped`. It can be awaited repeatedly and from several
//!   tasks at once; it does not request cancellation itself.
//!
//! # Timing
//!
//! The first tick fires one full interval after `start()`. Missed ticks are
//! delayed rather than bursted. Cancellation is only observed between ticks:
//! a sample whose reads have begun is always finished and enqueued.
//!
//! # Failures
//!
//! If any read in a tick fails the whole tick is discarded, the failure is
//! logged at `warn` and recorded in [`SamplingWorker::last_error`], and the
//! loop carries on with the next tick.

use crate::error::{AppResult, DaqError};
use crate::instrument::{Channel, ItcClient};
use crate::measurement::queue::SampleQueue;
use crate::measurement::sample::Sample;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

/// Default time between ticks.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Tuning for a [`SamplingWorker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplingOptions {
    /// Time between ticks. Must be non-zero.
    pub interval: Duration,
    /// Maximum queued samples; `None` for an unbounded queue.
    pub queue_capacity: Option<usize>,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            queue_capacity: None,
        }
    }
}

impl SamplingOptions {
    /// Unbounded queue with the given interval.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    /// Same options with a bounded queue.
    pub fn bounded(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    fn validate(&self) -> AppResult<()> {
        if self.interval.is_zero() {
            return Err(DaqError::Configuration(
                "Sampling interval must be greater than zero".to_string(),
            ));
        }
        if self.queue_capacity == Some(0) {
            return Err(DaqError::Configuration(
                "Queue capacity must be at least 1 (omit it for an unbounded queue)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where a worker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerState {
    /// Constructed, not started.
    Idle,
    /// Loop active and sampling.
    Running,
    /// Stop requested; the loop exits at the next tick boundary.
    Stopping,
    /// Loop has exited, or the worker was stopped before it ever ran.
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Idle => "idle",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Counters since `start()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Ticks that began reading.
    pub ticks: u64,
    /// Samples pushed into the queue.
    pub samples: u64,
    /// Ticks discarded because a read failed.
    pub failed_ticks: u64,
}

/// The most recent failed tick.
#[derive(Debug, Clone)]
pub struct TickFailure {
    /// Sequence number the sample would have carried.
    pub sequence: u64,
    /// Time the tick started.
    pub timestamp: DateTime<Utc>,
    /// What went wrong.
    pub error: Arc<DaqError>,
}

/// State shared between the worker handle and its task.
struct Shared {
    state: watch::Sender<WorkerState>,
    ticks: AtomicU64,
    samples: AtomicU64,
    failed_ticks: AtomicU64,
    last_error: Mutex<Option<TickFailure>>,
}

impl Shared {
    fn new() -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            state,
            ticks: AtomicU64::new(0),
            samples: AtomicU64::new(0),
            failed_ticks: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    fn current(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Apply `transition` atomically; returns the state seen before it.
    fn transition(&self, transition: impl FnOnce(WorkerState) -> Option<WorkerState>) -> WorkerState {
        let mut previous = WorkerState::Idle;
        self.state.send_if_modified(|state| {
            previous = *state;
            match transition(*state) {
                Some(next) => {
                    *state = next;
                    true
                }
                None => false,
            }
        });
        previous
    }

    fn stats(&self) -> WorkerStats {
        WorkerStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            failed_ticks: self.failed_ticks.load(Ordering::Relaxed),
        }
    }
}

/// Periodic sampler over one [`ItcClient`].
pub struct SamplingWorker {
    client: Arc<ItcClient>,
    channels: Arc<[Channel]>,
    interval: Duration,
    queue: SampleQueue,
    shared: Arc<Shared>,
}

impl fmt::Debug for SamplingWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplingWorker")
            .field("link", &self.client.link_name())
            .field("channels", &self.channels)
            .field("interval", &self.interval)
            .field("state", &self.state())
            .field("queue", &self.queue)
            .finish()
    }
}

impl SamplingWorker {
    /// Build a worker from channel names, e.g. `["TSorp", "THe3", "T1K"]`.
    ///
    /// Unknown names, an empty list, a zero interval or a zero queue capacity
    /// are rejected here with [`DaqError::Configuration`].
    pub fn new<S: AsRef<str>>(
        client: Arc<ItcClient>,
        channel_names: &[S],
        options: SamplingOptions,
    ) -> AppResult<Self> {
        let channels = channel_names
            .iter()
            .map(|name| name.as_ref().parse::<Channel>())
            .collect::<AppResult<Vec<_>>>()?;
        Self::with_channels(client, channels, options)
    }

    /// Build a worker from already-resolved channels.
    pub fn with_channels(
        client: Arc<ItcClient>,
        channels: Vec<Channel>,
        options: SamplingOptions,
    ) -> AppResult<Self> {
        if channels.is_empty() {
            return Err(DaqError::Configuration(
                "At least one channel is required for sampling".to_string(),
            ));
        }
        options.validate()?;

        let queue = match options.queue_capacity {
            Some(capacity) => SampleQueue::bounded(capacity),
            None => SampleQueue::unbounded(),
        };

        Ok(Self {
            client,
            channels: channels.into(),
            interval: options.interval,
            queue,
            shared: Arc::new(Shared::new()),
        })
    }

    /// Spawn the sampling loop on the current tokio runtime.
    pub fn start(&self) -> AppResult<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            DaqError::Lifecycle("start() must be called from within a tokio runtime".to_string())
        })?;

        let previous = self.shared.transition(|state| match state {
            WorkerState::Idle => Some(WorkerState::Running),
            _ => None,
        });
        if previous != WorkerState::Idle {
            return Err(DaqError::Lifecycle(format!(
                "Cannot start a worker that is {previous}; construct a new one"
            )));
        }

        let task = SamplingTask {
            client: Arc::clone(&self.client),
            channels: Arc::clone(&self.channels),
            interval: self.interval,
            queue: self.queue.clone(),
            shared: Arc::clone(&self.shared),
        };
        let exit = ExitGuard {
            shared: Arc::clone(&self.shared),
            queue: self.queue.clone(),
        };
        let span = info_span!("sampling_worker", link = %self.client.link_name());
        runtime.spawn(
            async move {
                let _exit = exit;
                task.run().await;
            }
            .instrument(span),
        );

        info!(
            link = %self.client.link_name(),
            channels = ?self.channels,
            interval = ?self.interval,
            "Sampling worker started"
        );
        Ok(())
    }

    /// Request cancellation. Returns immediately.
    ///
    /// A worker that was never started goes straight to `Stopped`.
    pub fn stop(&self) {
        let previous = self.shared.transition(|state| match state {
            WorkerState::Idle => Some(WorkerState::Stopped),
            WorkerState::Running => Some(WorkerState::Stopping),
            WorkerState::Stopping | WorkerState::Stopped => None,
        });
        match previous {
            WorkerState::Idle => {
                self.queue.close();
                debug!("Sampling worker stopped before it was started");
            }
            WorkerState::Running => info!("Sampling worker stop requested"),
            WorkerState::Stopping | WorkerState::Stopped => {}
        }
    }

    /// Wait until the loop has exited.
    ///
    /// Fails with [`DaqError::Lifecycle`] if the worker was never started (or
    /// stopped), since it would otherwise wait forever.
    pub async fn join(&self) -> AppResult<()> {
        let mut state = self.shared.state.subscribe();
        if *state.borrow() == WorkerState::Idle {
            return Err(DaqError::Lifecycle(
                "join() called on a worker that was never started".to_string(),
            ));
        }
        state
            .wait_for(|s| *s == WorkerState::Stopped)
            .await
            .map(|_| ())
            .map_err(|_| DaqError::Lifecycle("Worker state channel closed".to_string()))
    }

    /// `stop()` followed by `join()`.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.stop();
        self.join().await
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.shared.current()
    }

    /// Receiver that observes every state change.
    pub fn state_changes(&self) -> watch::Receiver<WorkerState> {
        self.shared.state.subscribe()
    }

    /// Whether the background loop is active (running or finishing its last tick).
    pub fn is_alive(&self) -> bool {
        matches!(self.state(), WorkerState::Running | WorkerState::Stopping)
    }

    /// Handle to the output queue.
    pub fn queue(&self) -> SampleQueue {
        self.queue.clone()
    }

    /// Channels read on each tick, in order.
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Time between ticks.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Counters so far.
    pub fn stats(&self) -> WorkerStats {
        self.shared.stats()
    }

    /// The most recent failed tick, if any.
    pub fn last_error(&self) -> Option<TickFailure> {
        self.shared.last_error.lock().clone()
    }
}

impl Drop for SamplingWorker {
    fn drop(&mut self) {
        match self.state() {
            WorkerState::Running => {
                warn!("SamplingWorker dropped while running, requesting stop");
                self.stop();
            }
            // Releases consumers still waiting on the queue
            WorkerState::Idle => self.stop(),
            WorkerState::Stopping | WorkerState::Stopped => {}
        }
    }
}

/// Everything the spawned loop needs; owns clones of the worker's handles.
struct SamplingTask {
    client: Arc<ItcClient>,
    channels: Arc<[Channel]>,
    interval: Duration,
    queue: SampleQueue,
    shared: Arc<Shared>,
}

impl SamplingTask {
    async fn run(self) {
        let mut state = self.shared.state.subscribe();
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut sequence = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = state.wait_for(|s| *s != WorkerState::Running) => break,
                _ = ticker.tick() => {}
            }
            sequence += 1;
            self.tick(sequence).await;
        }
    }

    async fn tick(&self, sequence: u64) {
        let timestamp = Utc::now();
        self.shared.ticks.fetch_add(1, Ordering::Relaxed);

        match self.client.read_channels(&self.channels).await {
            Ok(readings) => {
                let sample = Sample::new(sequence, timestamp, readings);
                match self.queue.push(sample).await {
                    Ok(()) => {
                        self.shared.samples.fetch_add(1, Ordering::Relaxed);
                        debug!(sequence, queued = self.queue.len(), "Sample enqueued");
                    }
                    Err(_) => debug!(sequence, "Queue closed, sample dropped"),
                }
            }
            Err(error) => {
                self.shared.failed_ticks.fetch_add(1, Ordering::Relaxed);
                warn!(sequence, error = %error, "Sampling tick failed, sample discarded");
                *self.shared.last_error.lock() = Some(TickFailure {
                    sequence,
                    timestamp,
                    error: Arc::new(error),
                });
            }
        }
    }
}

/// Marks the worker stopped and closes the queue however the task ends,
/// including a panic or the runtime dropping it before the first poll.
struct ExitGuard {
    shared: Arc<Shared>,
    queue: SampleQueue,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.queue.close();
        self.shared.state.send_replace(WorkerState::Stopped);
        let stats = self.shared.stats();
        info!(
            ticks = stats.ticks,
            samples = stats.samples,
            failed_ticks = stats.failed_ticks,
            "Sampling worker stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{Fault, SimulatedItc};

    fn client() -> Arc<ItcClient> {
        Arc::new(ItcClient::new(SimulatedItc::new()))
    }

    fn options() -> SamplingOptions {
        SamplingOptions::with_interval(Duration::from_millis(100))
    }

    #[test]
    fn test_construction_rejects_bad_configuration() {
        let err = SamplingWorker::new(client(), &["TSorp", "TMixer"], options()).unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));

        let empty: [&str; 0] = [];
        let err = SamplingWorker::new(client(), &empty, options()).unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));

        let err = SamplingWorker::new(
            client(),
            &["TSorp"],
            SamplingOptions::with_interval(Duration::ZERO),
        )
        .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));

        let err = SamplingWorker::new(client(), &["TSorp"], options().bounded(0)).unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[test]
    fn test_channel_names_resolve_in_order() {
        let worker = SamplingWorker::new(client(), &["T1K", "tsorp", "Setpoint"], options()).unwrap();
        assert_eq!(
            worker.channels(),
            &[Channel::T1K, Channel::TSorp, Channel::Setpoint]
        );
        assert_eq!(worker.state(), WorkerState::Idle);
        assert!(!worker.is_alive());
    }

    #[test]
    fn test_start_outside_runtime_is_lifecycle_error() {
        let worker = SamplingWorker::new(client(), &["TSorp"], options()).unwrap();
        assert!(matches!(worker.start(), Err(DaqError::Lifecycle(_))));
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_terminal() {
        let worker = SamplingWorker::new(client(), &["TSorp"], options()).unwrap();
        assert!(matches!(worker.join().await, Err(DaqError::Lifecycle(_))));

        worker.stop();
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(worker.queue().is_closed());
        worker.join().await.unwrap();
        assert!(matches!(worker.start(), Err(DaqError::Lifecycle(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_lifecycle_error() {
        let worker = SamplingWorker::new(client(), &["TSorp"], options()).unwrap();
        worker.start().unwrap();
        assert!(matches!(worker.start(), Err(DaqError::Lifecycle(_))));
        assert_eq!(worker.state(), WorkerState::Running);

        worker.shutdown().await.unwrap();
        assert!(matches!(worker.start(), Err(DaqError::Lifecycle(_))));
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn test_failed_tick_is_logged_and_recorded() {
        let sim = Arc::new(SimulatedItc::new());
        sim.inject(Fault::FailCommand {
            command: "R2".into(),
            times: 1,
        });
        let client = Arc::new(ItcClient::from_shared(sim));
        let worker = SamplingWorker::new(client, &["TSorp", "THe3"], options()).unwrap();

        worker.start().unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        worker.shutdown().await.unwrap();

        assert!(logs_contain("Sampling tick failed"));
        let failure = worker.last_error().unwrap();
        assert_eq!(failure.sequence, 1);
        assert!(matches!(*failure.error, DaqError::Communication { .. }));
        assert_eq!(
            worker.stats(),
            WorkerStats {
                ticks: 2,
                samples: 1,
                failed_ticks: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_while_running_stops_loop() {
        let worker = SamplingWorker::new(client(), &["TSorp"], options()).unwrap();
        let queue = worker.queue();
        let mut states = worker.state_changes();
        worker.start().unwrap();
        drop(worker);

        states
            .wait_for(|s| *s == WorkerState::Stopped)
            .await
            .unwrap();
        assert!(queue.is_closed());
        assert!(queue.is_empty());
    }
    #[tokio::test]
    async fn test_drop_idle_worker_releases_consumers() {
        let worker = SamplingWorker::new(client(), &["TSorp"], options()).unwrap();
        let queue = worker.queue();
        let consumer = tokio::spawn({
            let queue = queue.clone();
            async move { queue.pop().await }
        });
        drop(worker);

        assert!(queue.is_closed());
        let popped = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer still waiting after drop")
            .unwrap();
        assert!(popped.is_none());
    }

    #[test]
    fn test_runtime_shutdown_before_first_poll_marks_stopped() {
        let worker = SamplingWorker::new(client(), &["TSorp"], options()).unwrap();
        let queue = worker.queue();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async { worker.start() }).unwrap();
        drop(runtime);

        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(!worker.is_alive());
        assert!(queue.is_closed());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(worker.join()).unwrap();
        assert_eq!(worker.stats().ticks, 0);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_sample_for_closed_queue_is_dropped_and_logged() {
        let worker = SamplingWorker::new(client(), &["TSorp"], options()).unwrap();
        let task = SamplingTask {
            client: Arc::clone(&worker.client),
            channels: Arc::clone(&worker.channels),
            interval: worker.interval,
            queue: worker.queue(),
            shared: Arc::clone(&worker.shared),
        };
        worker.queue.close();

        task.tick(1).await;

        assert!(logs_contain("Queue closed, sample dropped"));
        assert!(worker.queue().is_empty());
        assert_eq!(
            worker.stats(),
            WorkerStats {
                ticks: 1,
                samples: 0,
                failed_ticks: 0
            }
        );
    }
}
