//! Dispatch engine: drains a consumer's event stream and runs tasks with bounded concurrency.
//!
//! ## Flow
//!
//! ```text
//! Consumer::start (spawned)
//!      │ EventStream (unbuffered)
//!      ▼
//! drain loop ── DispatchTable::resolve(name) ── admit(task) ──► task pool (≤ max_jobs)
//! ```
//!
//! ## Admission
//!
//! Admission never blocks the drain loop. With a bounded pool, a task that finds
//! every slot taken is rejected with [`DispatchError::QueueFull`], logged and
//! counted. Rejected tasks are not retried here; retrying belongs to the task.
//!
//! ## Delivery semantics
//!
//! Task results are recorded (logs + [`EngineStats`]) but never influence the
//! consumer's read position: the position advances on emit, not on handler
//! completion.
//!
//! ## Shutdown
//!
//! [`DispatchEngine::stop`] stops the consumer, then waits up to
//! [`EngineConfig::drain_timeout`] for in-flight tasks. Tasks still running after
//! that have their context cancelled and are counted as abandoned.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use eventmill_core::Event;

use crate::consumer::Consumer;
use crate::dispatch::DispatchTable;
use crate::error::{ConsumerError, DispatchError};
use crate::task::{Task, TaskContext};

/// Ceiling on concurrently executing tasks.
///
/// There is no implicit default: a deployment picks a bound or explicitly opts
/// out of one. A zero bound cannot be expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobLimit {
    Bounded(NonZeroUsize),
    Unbounded,
}

impl JobLimit {
    /// Bounded limit; `None` for zero.
    pub fn bounded(max_jobs: usize) -> Option<Self> {
        NonZeroUsize::new(max_jobs).map(Self::Bounded)
    }

    pub fn max_jobs(&self) -> Option<usize> {
        match self {
            JobLimit::Bounded(n) => Some(n.get()),
            JobLimit::Unbounded => None,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum concurrent tasks.
    pub max_jobs: JobLimit,
    /// How long `stop()` waits for in-flight tasks before abandoning them.
    pub drain_timeout: Duration,
    /// Name for logging.
    pub name: String,
}

impl EngineConfig {
    pub fn new(max_jobs: JobLimit, drain_timeout: Duration) -> Self {
        Self {
            max_jobs,
            drain_timeout,
            name: "dispatch-engine".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Engine runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct EngineStats {
    pub events_received: u64,
    pub no_dispatch: u64,
    pub queue_full: u64,
    pub tasks_admitted: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_abandoned: u64,
    pub in_flight: usize,
}

/// Drains a [`Consumer`] and executes the tasks its events resolve to.
pub struct DispatchEngine<C: Consumer> {
    consumer: Arc<C>,
    table: Arc<DispatchTable>,
    config: EngineConfig,
    permits: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    stats: Arc<Mutex<EngineStats>>,
    /// Set under the `stats` lock once the drain timeout expires; tasks finishing
    /// afterwards are already counted as abandoned.
    abandoned: Arc<AtomicBool>,
}

impl<C: Consumer + 'static> DispatchEngine<C> {
    pub fn new(consumer: C, table: DispatchTable, config: EngineConfig) -> Self {
        Self::from_shared(Arc::new(consumer), table, config)
    }

    /// Build an engine around a consumer the caller also holds on to.
    pub fn from_shared(consumer: Arc<C>, table: DispatchTable, config: EngineConfig) -> Self {
        let permits = config
            .max_jobs
            .max_jobs()
            .map(|n| Arc::new(Semaphore::new(n)));

        Self {
            consumer,
            table: Arc::new(table),
            config,
            permits,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            stats: Arc::new(Mutex::new(EngineStats::default())),
            abandoned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn consumer(&self) -> &Arc<C> {
        &self.consumer
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current engine statistics.
    pub fn stats(&self) -> EngineStats {
        self.stats.lock().unwrap().clone()
    }

    /// Run the consumer and drain its events until the stream closes.
    ///
    /// Returns the consumer's result: a fatal consumer error ends the engine,
    /// per-event conditions never do.
    pub async fn start(&self) -> Result<(), ConsumerError> {
        let events = self.consumer.events().ok_or(ConsumerError::StreamTaken)?;

        info!(
            engine = %self.config.name,
            consumer = self.consumer.name(),
            max_jobs = ?self.config.max_jobs.max_jobs(),
            routes = ?self.table.names(),
            "dispatch engine started"
        );

        let consumer = self.consumer.clone();
        let run = tokio::spawn(async move { consumer.start().await });

        while let Some(event) = events.recv().await {
            self.dispatch(event);
        }

        debug!(engine = %self.config.name, "event stream closed");

        let result = match run.await {
            Ok(result) => result,
            Err(e) => Err(ConsumerError::Join(e.to_string())),
        };

        match &result {
            Ok(()) => info!(engine = %self.config.name, "dispatch engine stopped"),
            Err(e) => error!(engine = %self.config.name, error = %e, "consumer failed"),
        }

        result
    }

    /// Stop the consumer, then drain or abandon in-flight tasks.
    pub async fn stop(&self) {
        info!(engine = %self.config.name, "stopping dispatch engine");
        self.consumer.stop().await;

        self.tracker.close();
        let drained = tokio::time::timeout(self.config.drain_timeout, self.tracker.wait())
            .await
            .is_ok();

        if !drained {
            let abandoned = {
                let mut stats = self.stats.lock().unwrap();
                self.abandoned.store(true, Ordering::SeqCst);
                stats.tasks_abandoned += stats.in_flight as u64;
                stats.in_flight
            };
            warn!(
                engine = %self.config.name,
                abandoned,
                drain_timeout = ?self.config.drain_timeout,
                "abandoning in-flight tasks"
            );
            self.cancel.cancel();
        }
    }

    /// Resolve and admit the tasks for one event.
    ///
    /// Every failure is recorded and logged; none is returned to the drain loop.
    pub fn dispatch(&self, event: Event) {
        self.stats.lock().unwrap().events_received += 1;

        let tasks = match self.table.resolve(&event) {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(engine = %self.config.name, event_name = event.name(), error = %e, "no dispatch");
                self.stats.lock().unwrap().no_dispatch += 1;
                return;
            }
        };

        debug!(
            engine = %self.config.name,
            event_name = event.name(),
            tasks = tasks.len(),
            "dispatching event"
        );

        for task in tasks {
            let task_name = task.name().to_string();
            if let Err(e) = self.admit(event.name(), task) {
                warn!(
                    engine = %self.config.name,
                    event_name = event.name(),
                    task = %task_name,
                    error = %e,
                    "task rejected"
                );
            }
        }
    }

    /// Admit a single task into the pool, failing immediately when it is full.
    pub fn admit(&self, event_name: &str, task: Box<dyn Task>) -> Result<(), DispatchError> {
        let permit = self.try_acquire()?;

        {
            let mut stats = self.stats.lock().unwrap();
            stats.tasks_admitted += 1;
            stats.in_flight += 1;
        }

        let ctx = TaskContext::new(event_name, self.cancel.child_token());
        let outcome = Outcome {
            stats: self.stats.clone(),
            abandoned: self.abandoned.clone(),
        };
        let engine = self.config.name.clone();

        self.tracker.spawn(run_task(engine, task, ctx, permit, outcome));
        Ok(())
    }

    fn try_acquire(&self) -> Result<Option<OwnedSemaphorePermit>, DispatchError> {
        let Some(permits) = &self.permits else {
            return Ok(None);
        };

        match permits.clone().try_acquire_owned() {
            Ok(permit) => Ok(Some(permit)),
            Err(_) => {
                self.stats.lock().unwrap().queue_full += 1;
                Err(DispatchError::QueueFull {
                    max_jobs: self.config.max_jobs.max_jobs().unwrap_or_default(),
                })
            }
        }
    }
}

/// Where a finished task records its result.
struct Outcome {
    stats: Arc<Mutex<EngineStats>>,
    abandoned: Arc<AtomicBool>,
}

impl Outcome {
    /// Count the result once; an abandoned task was counted by `stop()`.
    fn record(&self, succeeded: bool) -> bool {
        let mut s = self.stats.lock().unwrap();
        s.in_flight = s.in_flight.saturating_sub(1);
        if self.abandoned.load(Ordering::SeqCst) {
            return false;
        }
        if succeeded {
            s.tasks_succeeded += 1;
        } else {
            s.tasks_failed += 1;
        }
        true
    }
}

async fn run_task(
    engine: String,
    task: Box<dyn Task>,
    ctx: TaskContext,
    permit: Option<OwnedSemaphorePermit>,
    outcome: Outcome,
) {
    let task_name = task.name().to_string();
    let event_name = ctx.event_name().to_string();
    let started = Instant::now();

    let result = task.execute(ctx).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    if !outcome.record(result.is_ok()) {
        debug!(engine = %engine, event_name = %event_name, task = %task_name, duration_ms, "abandoned task finished");
        drop(permit);
        return;
    }

    match result {
        Ok(output) => debug!(
            engine = %engine,
            event_name = %event_name,
            task = %task_name,
            duration_ms,
            output = %output,
            "task completed"
        ),
        Err(e) => warn!(
            engine = %engine,
            event_name = %event_name,
            task = %task_name,
            duration_ms,
            error = %e,
            "task failed"
        ),
    }

    drop(permit);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::in_memory::InMemoryConsumer;
    use crate::task::FnTask;

    fn limit(n: usize) -> JobLimit {
        JobLimit::bounded(n).unwrap()
    }

    fn counting_task(counter: Arc<AtomicUsize>) -> Box<dyn Task> {
        FnTask::boxed("count", move |_ctx: TaskContext| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::Value::Null)
        })
    }

    fn parked_task(release: CancellationToken) -> Box<dyn Task> {
        FnTask::boxed("parked", move |_ctx: TaskContext| async move {
            release.cancelled().await;
            Ok(serde_json::Value::Null)
        })
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn zero_is_not_a_job_limit() {
        assert_eq!(JobLimit::bounded(0), None);
        assert_eq!(JobLimit::bounded(3).unwrap().max_jobs(), Some(3));
        assert_eq!(JobLimit::Unbounded.max_jobs(), None);
    }

    #[tokio::test]
    async fn admission_fails_fast_when_the_pool_is_full() {
        let (consumer, _publisher) = InMemoryConsumer::new();
        let engine = DispatchEngine::new(
            consumer,
            DispatchTable::new(),
            EngineConfig::new(limit(2), Duration::from_secs(1)),
        );

        let release = CancellationToken::new();
        engine.admit("e", parked_task(release.clone())).unwrap();
        engine.admit("e", parked_task(release.clone())).unwrap();

        let err = engine.admit("e", parked_task(release.clone())).unwrap_err();
        assert_eq!(err, DispatchError::QueueFull { max_jobs: 2 });

        let stats = engine.stats();
        assert_eq!(stats.tasks_admitted, 2);
        assert_eq!(stats.queue_full, 1);
        assert_eq!(stats.in_flight, 2);

        // Freeing a slot makes room again.
        release.cancel();
        eventually(|| engine.stats().in_flight == 0).await;
        engine.admit("e", parked_task(CancellationToken::new())).unwrap();
    }

    #[tokio::test]
    async fn unbounded_pool_never_rejects() {
        let (consumer, _publisher) = InMemoryConsumer::new();
        let engine = DispatchEngine::new(
            consumer,
            DispatchTable::new(),
            EngineConfig::new(JobLimit::Unbounded, Duration::from_secs(1)),
        );

        let release = CancellationToken::new();
        for _ in 0..64 {
            engine.admit("e", parked_task(release.clone())).unwrap();
        }
        assert_eq!(engine.stats().in_flight, 64);
        release.cancel();
    }

    #[tokio::test]
    async fn unknown_event_runs_nothing() {
        let ran = Arc::new(AtomicUsize::new(0));
        let table = {
            let ran = ran.clone();
            DispatchTable::new().route("known", move |_ev: &Event| vec![counting_task(ran.clone())])
        };

        let (consumer, _publisher) = InMemoryConsumer::new();
        let engine = DispatchEngine::new(
            consumer,
            table,
            EngineConfig::new(limit(4), Duration::from_secs(1)),
        );

        engine.dispatch(Event::new("unknown", vec![]));

        let stats = engine.stats();
        assert_eq!(stats.events_received, 1);
        assert_eq!(stats.no_dispatch, 1);
        assert_eq!(stats.tasks_admitted, 0);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drains_the_consumer_and_runs_every_task() {
        let ran = Arc::new(AtomicUsize::new(0));
        let table = {
            let ran = ran.clone();
            DispatchTable::new().route("user.created", move |_ev: &Event| {
                vec![counting_task(ran.clone()), counting_task(ran.clone())]
            })
        };

        let (consumer, publisher) = InMemoryConsumer::new();
        let engine = Arc::new(DispatchEngine::new(
            consumer,
            table,
            EngineConfig::new(limit(8), Duration::from_secs(1)),
        ));

        let runner = engine.clone();
        let run = tokio::spawn(async move { runner.start().await });

        for _ in 0..3 {
            publisher.publish(Event::new("user.created", vec![])).unwrap();
        }
        publisher.publish(Event::new("nobody.cares", vec![])).unwrap();

        eventually(|| ran.load(Ordering::SeqCst) == 6 && engine.stats().events_received == 4).await;

        engine.stop().await;
        run.await.unwrap().unwrap();

        let stats = engine.stats();
        assert_eq!(stats.tasks_succeeded, 6);
        assert_eq!(stats.no_dispatch, 1);
        assert_eq!(stats.tasks_abandoned, 0);
    }

    #[tokio::test]
    async fn failing_tasks_are_recorded_not_fatal() {
        let table = DispatchTable::new().route("boom", |_ev: &Event| {
            vec![FnTask::boxed("explode", |_ctx: TaskContext| async {
                Err::<serde_json::Value, _>(anyhow::anyhow!("handler exploded"))
            })]
        });

        let (consumer, _publisher) = InMemoryConsumer::new();
        let engine = DispatchEngine::new(
            consumer,
            table,
            EngineConfig::new(limit(1), Duration::from_secs(1)),
        );

        engine.dispatch(Event::new("boom", vec![]));
        eventually(|| engine.stats().tasks_failed == 1).await;

        engine.dispatch(Event::new("boom", vec![]));
        eventually(|| engine.stats().tasks_failed == 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_abandons_tasks_past_the_drain_timeout() {
        let (consumer, _publisher) = InMemoryConsumer::new();
        let engine = DispatchEngine::new(
            consumer,
            DispatchTable::new(),
            EngineConfig::new(limit(4), Duration::from_millis(50)),
        );

        let saw_cancel = Arc::new(AtomicUsize::new(0));
        let flag = saw_cancel.clone();
        engine
            .admit(
                "slow",
                FnTask::boxed("stubborn", move |ctx: TaskContext| async move {
                    ctx.cancelled().await;
                    flag.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::Value::Null)
                }),
            )
            .unwrap();

        engine.stop().await;

        assert_eq!(engine.stats().tasks_abandoned, 1);
        eventually(|| saw_cancel.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_tasks_are_counted_once() {
        let (consumer, _publisher) = InMemoryConsumer::new();
        let engine = DispatchEngine::new(
            consumer,
            DispatchTable::new(),
            EngineConfig::new(limit(4), Duration::from_millis(50)),
        );

        let finished = Arc::new(AtomicUsize::new(0));
        let done = finished.clone();
        engine
            .admit(
                "slow",
                FnTask::boxed("deaf", move |_ctx: TaskContext| async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::Value::Null)
                }),
            )
            .unwrap();

        engine.stop().await;
        assert_eq!(engine.stats().tasks_abandoned, 1);

        eventually(|| finished.load(Ordering::SeqCst) == 1 && engine.stats().in_flight == 0).await;

        let stats = engine.stats();
        assert_eq!(stats.tasks_admitted, 1);
        assert_eq!(stats.tasks_abandoned, 1);
        assert_eq!(stats.tasks_succeeded, 0);
        assert_eq!(stats.tasks_failed, 0);
    }

    #[tokio::test]
    async fn start_twice_reports_the_taken_stream() {
        let (consumer, _publisher) = InMemoryConsumer::new();
        let consumer = Arc::new(consumer);
        let _stream = consumer.events().unwrap();

        let engine = DispatchEngine::from_shared(
            consumer,
            DispatchTable::new(),
            EngineConfig::new(limit(1), Duration::from_secs(1)),
        );

        assert!(matches!(
            engine.start().await,
            Err(ConsumerError::StreamTaken)
        ));
    }
}
