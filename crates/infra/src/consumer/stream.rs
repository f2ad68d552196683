//! Stream-tailing consumer: follows one log shard and checkpoints its position.
//!
//! ## Startup
//!
//! 1. Describe the stream and take its first shard (one shard per consumer).
//! 2. Load the checkpoint at `<shard_path>/<shard_id>/sequence`:
//!    found → iterator after that sequence; not found → trim horizon; any other
//!    store error → `start()` fails.
//!
//! ## Fetch loop
//!
//! ```text
//!     stop requested / retry deadline or permanent error / shard closed / reader gone
//! FETCHING ──────────────────────────────────────────────────────────────────────► DRAINING ──► CLOSED
//!   │  get_records(limit 1) under backoff retry
//!   │  decode → emit (blocks until the engine takes it) → advance position
//!   └─ caught up (zero lag) → sleep 500ms
//! ```
//!
//! The loop is the only writer of the position; a background flusher persists
//! it every 10s. Draining stops the flusher, persists the position once more,
//! closes the event stream, then confirms the stop.
//!
//! An expired iterator is replaced from the current position inside the same
//! retry attempt.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use eventmill_core::{Event, ShardId};
use eventmill_events::{
    Consumer, ConsumerError, EventSink, EventStream, Lifecycle, STOP_TIMEOUT, StreamError,
    event_stream,
};

use crate::backoff::{BackoffConfig, ExponentialBackoff, RetryError, retry_if};
use crate::checkpoint::{CheckpointKey, CheckpointStore, Checkpointer};
use crate::log::{IteratorStart, LogError, RecordBatch, ShardIterator, ShardLog};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(500);
pub const DEFAULT_FETCH_LIMIT: usize = 1;

/// Which records move the checkpoint forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdvancePolicy {
    /// Every fetched record, including ones that failed to decode.
    Always,
    /// Only records that were decoded and emitted.
    #[default]
    OnEmitOnly,
}

impl FromStr for AdvancePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "on-emit" | "on_emit" | "on-emit-only" => Ok(Self::OnEmitOnly),
            other => Err(format!("unknown advance policy: {other}")),
        }
    }
}

impl fmt::Display for AdvancePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdvancePolicy::Always => f.write_str("always"),
            AdvancePolicy::OnEmitOnly => f.write_str("on-emit"),
        }
    }
}

/// Stream consumer configuration.
#[derive(Debug, Clone)]
pub struct StreamConsumerConfig {
    pub stream: String,
    /// Checkpoint key prefix.
    pub shard_path: String,
    pub fetch_limit: usize,
    pub flush_interval: Duration,
    /// Pause after a fetch that reports zero lag.
    pub idle_sleep: Duration,
    pub backoff: BackoffConfig,
    pub advance_policy: AdvancePolicy,
}

impl StreamConsumerConfig {
    pub fn new(stream: impl Into<String>, shard_path: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            shard_path: shard_path.into(),
            fetch_limit: DEFAULT_FETCH_LIMIT,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            idle_sleep: DEFAULT_IDLE_SLEEP,
            backoff: BackoffConfig::default(),
            advance_policy: AdvancePolicy::default(),
        }
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_idle_sleep(mut self, sleep: Duration) -> Self {
        self.idle_sleep = sleep;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_advance_policy(mut self, policy: AdvancePolicy) -> Self {
        self.advance_policy = policy;
        self
    }
}

/// Why the fetch loop left `Fetching`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReason {
    StopRequested,
    /// The retry deadline passed, or a fetch error cannot be retried.
    RetryExhausted,
    ShardClosed,
    ReaderGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    Fetching,
    Draining(DrainReason),
    Closed,
}

struct Shutdown {
    reason: DrainReason,
    error: Option<ConsumerError>,
}

impl Shutdown {
    fn because(reason: DrainReason) -> Self {
        Self {
            reason,
            error: None,
        }
    }
}

/// Consumer tailing a single shard of a [`ShardLog`].
pub struct StreamConsumer {
    log: Arc<dyn ShardLog>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: StreamConsumerConfig,
    sink: EventSink,
    events: Mutex<Option<EventStream>>,
    lifecycle: Lifecycle,
    state: Mutex<FetchState>,
}

impl StreamConsumer {
    pub fn new(
        log: Arc<dyn ShardLog>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: StreamConsumerConfig,
    ) -> Self {
        let (sink, events) = event_stream();
        Self {
            log,
            checkpoints,
            config,
            sink,
            events: Mutex::new(Some(events)),
            lifecycle: Lifecycle::new(),
            state: Mutex::new(FetchState::Idle),
        }
    }

    pub fn config(&self) -> &StreamConsumerConfig {
        &self.config
    }

    pub fn state(&self) -> FetchState {
        *self.state.lock().unwrap()
    }

    fn transition(&self, next: FetchState) {
        let mut state = self.state.lock().unwrap();
        if *state != next {
            debug!(consumer = "stream", from = ?*state, to = ?next, "fetch state changed");
            *state = next;
        }
    }

    async fn open(&self) -> Result<(ShardId, Arc<Checkpointer>, ShardIterator), ConsumerError> {
        let stream = &self.config.stream;

        let description = self.log.describe_stream(stream).await.map_err(|e| match e {
            LogError::StreamNotFound(name) => ConsumerError::StreamNotFound(name),
            other => ConsumerError::Log(other.to_string()),
        })?;

        // One shard per consumer instance.
        let shard = description
            .shards
            .first()
            .cloned()
            .ok_or_else(|| ConsumerError::NoShards(stream.clone()))?;

        let key = CheckpointKey::new(&self.config.shard_path, &shard);
        let checkpointer = Arc::new(Checkpointer::new(self.checkpoints.clone(), key));

        let start = match checkpointer.restore().await {
            Ok(Some(sequence)) => {
                info!(consumer = "stream", shard_id = %shard, sequence = %sequence, "resuming after checkpoint");
                IteratorStart::AfterSequence(sequence)
            }
            Ok(None) => {
                info!(consumer = "stream", shard_id = %shard, "no checkpoint, starting at trim horizon");
                IteratorStart::TrimHorizon
            }
            Err(e) => {
                error!(consumer = "stream", key = %checkpointer.key(), error = %e, "checkpoint load failed");
                return Err(ConsumerError::Checkpoint(e.to_string()));
            }
        };

        let iterator = self
            .log
            .shard_iterator(stream, &shard, start)
            .await
            .map_err(|e| ConsumerError::Log(e.to_string()))?;

        Ok((shard, checkpointer, iterator))
    }

    /// One fetch attempt; an expired iterator is replaced from the current position.
    async fn fetch(
        &self,
        shard: &ShardId,
        checkpointer: &Checkpointer,
        iterator: &ShardIterator,
    ) -> Result<RecordBatch, LogError> {
        debug!(consumer = "stream", iterator = %iterator, "getting records");

        match self.log.get_records(iterator, self.config.fetch_limit).await {
            Err(LogError::IteratorExpired) => {
                let start = checkpointer
                    .last_seen()
                    .map(IteratorStart::AfterSequence)
                    .unwrap_or(IteratorStart::TrimHorizon);
                warn!(consumer = "stream", shard_id = %shard, start = ?start, "iterator expired, re-acquiring");

                let fresh = self
                    .log
                    .shard_iterator(&self.config.stream, shard, start)
                    .await?;
                self.log.get_records(&fresh, self.config.fetch_limit).await
            }
            other => other,
        }
    }

    async fn run(
        &self,
        shard: &ShardId,
        checkpointer: &Checkpointer,
        mut iterator: ShardIterator,
    ) -> Shutdown {
        let stop = self.lifecycle.stop_token();
        let mut backoff = ExponentialBackoff::new(self.config.backoff.clone());

        loop {
            if stop.is_cancelled() {
                return Shutdown::because(DrainReason::StopRequested);
            }

            let current = &iterator;
            let fetched = retry_if(&mut backoff, stop, LogError::is_transient, || {
                self.fetch(shard, checkpointer, current)
            })
            .await;
            let batch = match fetched {
                Ok(batch) => batch,
                Err(RetryError::Stopped) => return Shutdown::because(DrainReason::StopRequested),
                Err(RetryError::Permanent(e)) => {
                    error!(consumer = "stream", shard_id = %shard, error = %e, "fetch failed permanently");
                    let error = match e {
                        LogError::StreamNotFound(name) => ConsumerError::StreamNotFound(name),
                        other => ConsumerError::Log(other.to_string()),
                    };
                    return Shutdown {
                        reason: DrainReason::RetryExhausted,
                        error: Some(error),
                    };
                }
                Err(RetryError::Expired { elapsed, last_error }) => {
                    error!(
                        consumer = "stream",
                        shard_id = %shard,
                        elapsed_secs = elapsed.as_secs(),
                        error = %last_error,
                        "giving up on fetching records"
                    );
                    return Shutdown {
                        reason: DrainReason::RetryExhausted,
                        error: Some(ConsumerError::RetryExhausted {
                            elapsed,
                            last_error: last_error.to_string(),
                        }),
                    };
                }
            };

            for record in batch.records {
                let event = match Event::from_wire(&record.data) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(consumer = "stream", sequence = %record.sequence, error = %e, "skipping undecodable record");
                        if self.config.advance_policy == AdvancePolicy::Always {
                            checkpointer.advance(record.sequence);
                        }
                        continue;
                    }
                };

                debug!(consumer = "stream", event_name = event.name(), sequence = %record.sequence, "emitting event");

                match self.sink.send_or_cancel(event, stop).await {
                    Ok(()) => {
                        checkpointer.advance(record.sequence);
                    }
                    Err(StreamError::Cancelled) => {
                        return Shutdown::because(DrainReason::StopRequested);
                    }
                    Err(e) => {
                        warn!(consumer = "stream", error = %e, "event stream reader is gone");
                        return Shutdown::because(DrainReason::ReaderGone);
                    }
                }
            }

            let Some(next) = batch.next_iterator else {
                info!(consumer = "stream", shard_id = %shard, "shard has been closed");
                return Shutdown::because(DrainReason::ShardClosed);
            };
            iterator = next;

            if batch.millis_behind_latest == 0 {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return Shutdown::because(DrainReason::StopRequested),
                    _ = tokio::time::sleep(self.config.idle_sleep) => {}
                }
            }
        }
    }

    fn spawn_flusher(&self, checkpointer: Arc<Checkpointer>, token: CancellationToken) -> JoinHandle<()> {
        let every = self.config.flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = checkpointer.flush().await {
                            warn!(consumer = "stream", key = %checkpointer.key(), error = %e, "periodic checkpoint flush failed");
                        }
                    }
                }
            }
        })
    }

    /// Close the stream and confirm the stop; used on every exit path.
    fn close(&self) {
        if self.sink.close() {
            debug!(consumer = "stream", "event stream closed");
        }
        self.transition(FetchState::Closed);
        self.lifecycle.mark_stopped();
    }
}

#[async_trait]
impl Consumer for StreamConsumer {
    fn name(&self) -> &str {
        "stream"
    }

    async fn start(&self) -> Result<(), ConsumerError> {
        if !self.lifecycle.begin() {
            debug!(consumer = "stream", "already running or stopped");
            return Ok(());
        }
        info!(consumer = "stream", stream = %self.config.stream, log = self.log.name(), "starting");

        let (shard, checkpointer, iterator) = match self.open().await {
            Ok(opened) => opened,
            Err(e) => {
                self.close();
                return Err(e);
            }
        };

        let flusher_stop = CancellationToken::new();
        let flusher = self.spawn_flusher(checkpointer.clone(), flusher_stop.clone());
        // Ends the flusher even if this future is dropped mid-run.
        let _flusher_guard = flusher_stop.clone().drop_guard();

        self.transition(FetchState::Fetching);
        let shutdown = self.run(&shard, &checkpointer, iterator).await;
        self.transition(FetchState::Draining(shutdown.reason));
        info!(consumer = "stream", shard_id = %shard, reason = ?shutdown.reason, "draining");

        flusher_stop.cancel();
        if let Err(e) = flusher.await {
            warn!(consumer = "stream", error = %e, "checkpoint flusher ended abnormally");
        }

        match checkpointer.flush().await {
            Ok(Some(sequence)) => info!(consumer = "stream", sequence = %sequence, "final checkpoint saved"),
            Ok(None) => debug!(consumer = "stream", "checkpoint already current"),
            Err(e) => error!(consumer = "stream", key = %checkpointer.key(), error = %e, "final checkpoint flush failed"),
        }

        self.close();
        info!(consumer = "stream", "stopped");

        match shutdown.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn stop(&self) {
        if self.lifecycle.is_stopped() {
            return;
        }
        info!(consumer = "stream", "stopping");

        if self.lifecycle.close_if_idle() {
            self.lifecycle.request_stop();
            self.close();
            return;
        }

        if !self.lifecycle.stop_and_wait(STOP_TIMEOUT).await {
            warn!(consumer = "stream", timeout = ?STOP_TIMEOUT, "stop not confirmed in time");
        }
    }

    fn events(&self) -> Option<EventStream> {
        self.events.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::log::InMemoryLog;

    const STREAM: &str = "events";
    const SHARD_PATH: &str = "/eventmill/test";

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Signup {
        user_id: u32,
    }

    struct Harness {
        log: Arc<InMemoryLog>,
        store: Arc<InMemoryCheckpointStore>,
        key: CheckpointKey,
    }

    impl Harness {
        fn new() -> Self {
            let log = Arc::new(InMemoryLog::new());
            log.create_stream(STREAM, 1);
            let key = CheckpointKey::new(SHARD_PATH, &ShardId::new("shardId-000000000000"));
            Self {
                log,
                store: Arc::new(InMemoryCheckpointStore::new()),
                key,
            }
        }

        fn push(&self, user_id: u32) -> eventmill_core::SequenceNumber {
            let event = Event::with_data("user.signup", &Signup { user_id }).unwrap();
            self.log.append(STREAM, 0, event.to_wire().unwrap()).unwrap()
        }

        fn push_garbage(&self) -> eventmill_core::SequenceNumber {
            self.log.append(STREAM, 0, b"\x00not an event".to_vec()).unwrap()
        }

        fn consumer(&self, config: StreamConsumerConfig) -> Arc<StreamConsumer> {
            Arc::new(StreamConsumer::new(self.log.clone(), self.store.clone(), config))
        }

        fn config(&self) -> StreamConsumerConfig {
            StreamConsumerConfig::new(STREAM, SHARD_PATH).with_idle_sleep(Duration::from_millis(10))
        }
    }

    fn spawn(consumer: &Arc<StreamConsumer>) -> JoinHandle<Result<(), ConsumerError>> {
        let c = consumer.clone();
        tokio::spawn(async move { c.start().await })
    }

    async fn next_user(stream: &EventStream) -> u32 {
        let event = stream
            .recv_timeout(Duration::from_secs(5))
            .await
            .expect("expected an event");
        event.decode_data::<Signup>().unwrap().user_id
    }

    #[tokio::test]
    async fn starts_at_trim_horizon_without_a_checkpoint() {
        let h = Harness::new();
        h.push(1);
        h.push(2);
        let last = h.push(3);

        let consumer = h.consumer(h.config());
        let events = consumer.events().unwrap();
        let run = spawn(&consumer);

        assert_eq!(next_user(&events).await, 1);
        assert_eq!(next_user(&events).await, 2);
        assert_eq!(next_user(&events).await, 3);

        consumer.stop().await;
        run.await.unwrap().unwrap();

        assert!(events.recv().await.is_none());
        assert_eq!(h.store.get(&h.key), Some(last));
        assert_eq!(consumer.state(), FetchState::Closed);
    }

    #[tokio::test]
    async fn resumes_after_the_persisted_sequence() {
        let h = Harness::new();
        h.push(1);
        let second = h.push(2);
        h.push(3);
        h.store.insert(&h.key, second);

        let consumer = h.consumer(h.config());
        let events = consumer.events().unwrap();
        let run = spawn(&consumer);

        assert_eq!(next_user(&events).await, 3);

        consumer.stop().await;
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_records_are_skipped_in_order() {
        let h = Harness::new();
        h.push(1);
        h.push_garbage();
        h.push(2);
        let last_good = h.push(3);
        let last = h.push_garbage();
        h.log.close_shard(STREAM, 0);

        let consumer = h.consumer(h.config());
        let events = consumer.events().unwrap();
        let run = spawn(&consumer);

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event.decode_data::<Signup>().unwrap().user_id);
        }
        run.await.unwrap().unwrap();

        assert_eq!(seen, vec![1, 2, 3]);
        // On-emit policy: the trailing bad record does not move the checkpoint.
        assert_eq!(h.store.get(&h.key), Some(last_good));
        assert_ne!(h.store.get(&h.key), Some(last));
    }

    #[tokio::test]
    async fn advance_always_moves_past_malformed_records() {
        let h = Harness::new();
        h.push(1);
        let last = h.push_garbage();
        h.log.close_shard(STREAM, 0);

        let consumer = h.consumer(h.config().with_advance_policy(AdvancePolicy::Always));
        let events = consumer.events().unwrap();
        let run = spawn(&consumer);

        assert_eq!(next_user(&events).await, 1);
        assert!(events.recv().await.is_none());
        run.await.unwrap().unwrap();

        assert_eq!(h.store.get(&h.key), Some(last));
    }

    #[tokio::test]
    async fn stream_closes_only_after_the_final_flush() {
        let h = Harness::new();
        let last = h.push(1);
        h.log.close_shard(STREAM, 0);

        let consumer = h.consumer(h.config());
        let events = consumer.events().unwrap();
        let run = spawn(&consumer);

        assert_eq!(next_user(&events).await, 1);
        assert!(events.recv().await.is_none());
        // Closed implies the checkpoint is already durable.
        assert_eq!(h.store.get(&h.key), Some(last));

        run.await.unwrap().unwrap();
        assert_eq!(consumer.state(), FetchState::Closed);
    }

    #[tokio::test]
    async fn checkpoint_store_failure_is_fatal_at_startup() {
        let h = Harness::new();
        h.store.fail_next_load("cluster unavailable");

        let consumer = h.consumer(h.config());
        let events = consumer.events().unwrap();

        let err = consumer.start().await.unwrap_err();
        assert!(matches!(err, ConsumerError::Checkpoint(_)), "{err}");
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn missing_stream_is_fatal() {
        let h = Harness::new();
        let consumer = h.consumer(StreamConsumerConfig::new("nope", SHARD_PATH));

        let err = consumer.start().await.unwrap_err();
        assert!(matches!(err, ConsumerError::StreamNotFound(name) if name == "nope"));
    }

    #[tokio::test]
    async fn transient_fetch_errors_are_retried() {
        let h = Harness::new();
        h.push(7);
        h.log.fail_next(LogError::Throttled("provisioned throughput exceeded".into()));
        h.log.fail_next(LogError::Transport("connection reset".into()));

        let consumer = h.consumer(h.config());
        let events = consumer.events().unwrap();
        let run = spawn(&consumer);

        assert_eq!(next_user(&events).await, 7);
        assert!(h.log.fetches() >= 3);

        consumer.stop().await;
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn expired_iterator_is_replaced_without_duplicates() {
        let h = Harness::new();
        h.push(1);
        h.push(2);

        let consumer = h.consumer(h.config());
        let events = consumer.events().unwrap();
        let run = spawn(&consumer);

        assert_eq!(next_user(&events).await, 1);
        h.log.expire_iterators();
        assert_eq!(next_user(&events).await, 2);
        h.push(3);
        assert_eq!(next_user(&events).await, 3);

        consumer.stop().await;
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retry_deadline_ends_start_with_an_error() {
        let h = Harness::new();
        for _ in 0..10_000 {
            h.log.fail_next(LogError::Transport("unreachable".into()));
        }

        let backoff = BackoffConfig::default().with_max_elapsed(Duration::from_secs(30));
        let consumer = h.consumer(h.config().with_backoff(backoff));
        let events = consumer.events().unwrap();

        let err = consumer.start().await.unwrap_err();
        assert!(matches!(err, ConsumerError::RetryExhausted { .. }), "{err}");
        assert!(events.recv().await.is_none());
        assert_eq!(
            consumer.state(),
            FetchState::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_fetch_errors_end_start_without_retrying() {
        let h = Harness::new();
        let first = h.push(1);
        h.push(2);

        let consumer = h.consumer(h.config());
        let events = consumer.events().unwrap();
        let run = spawn(&consumer);

        assert_eq!(next_user(&events).await, 1);
        let started = tokio::time::Instant::now();
        h.log.fail_next(LogError::ShardNotFound("shardId-000000000000".into()));

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, ConsumerError::Log(_)), "{err}");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(consumer.state(), FetchState::Closed);
        assert_eq!(h.store.get(&h.key), Some(first));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_retry_returns_within_the_budget() {
        let h = Harness::new();
        for _ in 0..10_000 {
            h.log.fail_next(LogError::Transport("unreachable".into()));
        }

        let consumer = h.consumer(h.config());
        let _events = consumer.events().unwrap();
        let run = spawn(&consumer);

        tokio::time::sleep(Duration::from_secs(20)).await;

        let started = tokio::time::Instant::now();
        consumer.stop().await;
        assert!(started.elapsed() < STOP_TIMEOUT);

        run.await.unwrap().unwrap();
        assert_eq!(consumer.state(), FetchState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_running_start_ends_the_flusher() {
        let h = Harness::new();
        h.push(1);
        h.push(2);

        let consumer = h.consumer(h.config());
        let events = consumer.events().unwrap();
        let run = spawn(&consumer);

        assert_eq!(next_user(&events).await, 1);
        assert_eq!(next_user(&events).await, 2);
        run.abort();
        assert!(run.await.unwrap_err().is_cancelled());

        let saves = h.store.saves();
        tokio::time::sleep(DEFAULT_FLUSH_INTERVAL * 3).await;
        assert_eq!(h.store.saves(), saves);
        assert_eq!(h.store.get(&h.key), None);
    }

    #[tokio::test]
    async fn start_after_stop_returns_without_fetching() {
        let h = Harness::new();
        h.push(1);

        let consumer = h.consumer(h.config());
        let events = consumer.events().unwrap();

        consumer.stop().await;
        consumer.start().await.unwrap();

        assert!(events.recv().await.is_none());
        assert_eq!(h.store.get(&h.key), None);
        assert_eq!(consumer.state(), FetchState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_racing_a_spawned_start_returns_after_the_run_closed() {
        for _ in 0..20 {
            let h = Harness::new();
            h.push(1);

            let consumer = h.consumer(h.config());
            let events = consumer.events().unwrap();
            let run = spawn(&consumer);
            consumer.stop().await;

            // Either the run never began or stop waited for its final flush.
            assert_eq!(consumer.state(), FetchState::Closed);
            run.await.unwrap().unwrap();
            assert!(events.recv().await.is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn position_is_flushed_periodically() {
        let h = Harness::new();
        let first = h.push(1);

        let consumer = h.consumer(h.config());
        let events = consumer.events().unwrap();
        let run = spawn(&consumer);

        assert_eq!(next_user(&events).await, 1);
        assert_eq!(h.store.get(&h.key), None);

        tokio::time::sleep(DEFAULT_FLUSH_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(h.store.get(&h.key), Some(first));

        consumer.stop().await;
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_before_start_and_twice_is_safe() {
        let h = Harness::new();
        let consumer = h.consumer(h.config());
        let events = consumer.events().unwrap();

        consumer.stop().await;
        consumer.stop().await;
        assert!(events.recv().await.is_none());
        assert!(consumer.events().is_none());
    }
}
