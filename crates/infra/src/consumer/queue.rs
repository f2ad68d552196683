//! Queue-backed consumer: forwards topic/channel deliveries onto the event stream.
//!
//! `handler_count` workers each take one delivery at a time, decode it and
//! emit it (blocking until the engine reads). At most `max_in_flight`
//! deliveries are outstanding between `receive` and `ack`/`nack`. Both default
//! to 4 when left at zero.
//!
//! There is no checkpointing: a successful emit acks the delivery, a decode
//! failure or an interrupted emit nacks it and the transport decides about
//! redelivery.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use eventmill_core::Event;
use eventmill_events::{
    Consumer, ConsumerError, EventSink, EventStream, Lifecycle, STOP_TIMEOUT, event_stream,
};

use crate::queue::{Delivery, MessageQueue};

pub const DEFAULT_HANDLER_COUNT: usize = 4;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

const RECEIVE_ERROR_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct QueueConsumerConfig {
    pub topic: String,
    pub channel: String,
    /// Concurrent delivery handlers; 0 means the default.
    pub handler_count: usize,
    /// Outstanding deliveries; 0 means the default.
    pub max_in_flight: usize,
}

impl QueueConsumerConfig {
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
            handler_count: 0,
            max_in_flight: 0,
        }
    }

    pub fn with_handler_count(mut self, count: usize) -> Self {
        self.handler_count = count;
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    pub fn effective_handler_count(&self) -> usize {
        if self.handler_count == 0 {
            DEFAULT_HANDLER_COUNT
        } else {
            self.handler_count
        }
    }

    pub fn effective_max_in_flight(&self) -> usize {
        if self.max_in_flight == 0 {
            DEFAULT_MAX_IN_FLIGHT
        } else {
            self.max_in_flight
        }
    }
}

type Work = (Delivery, OwnedSemaphorePermit);

/// Consumer over a [`MessageQueue`].
pub struct QueueConsumer {
    queue: Arc<dyn MessageQueue>,
    config: QueueConsumerConfig,
    sink: Arc<EventSink>,
    events: Mutex<Option<EventStream>>,
    lifecycle: Lifecycle,
}

impl QueueConsumer {
    pub fn new(queue: Arc<dyn MessageQueue>, config: QueueConsumerConfig) -> Self {
        let (sink, events) = event_stream();
        Self {
            queue,
            config,
            sink: Arc::new(sink),
            events: Mutex::new(Some(events)),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn config(&self) -> &QueueConsumerConfig {
        &self.config
    }

    fn close(&self) {
        if self.sink.close() {
            debug!(consumer = "queue", "event stream closed");
        }
        self.lifecycle.mark_stopped();
    }

    /// Receive into free in-flight slots and hand deliveries to the workers.
    async fn pump(&self, permits: Arc<Semaphore>, work: flume::Sender<Work>) {
        let stop = self.lifecycle.stop_token();

        loop {
            let first = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let mut slots = vec![first];
            while let Ok(permit) = permits.clone().try_acquire_owned() {
                slots.push(permit);
            }

            let deliveries = match self.queue.receive(slots.len()).await {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    warn!(consumer = "queue", queue = self.queue.name(), error = %e, "receive failed");
                    drop(slots);
                    let stopped = tokio::select! {
                        biased;
                        _ = stop.cancelled() => true,
                        _ = tokio::time::sleep(RECEIVE_ERROR_PAUSE) => false,
                    };
                    if stopped {
                        break;
                    }
                    continue;
                }
            };

            for delivery in deliveries {
                let Some(permit) = slots.pop() else {
                    // The transport returned more than asked for.
                    nack(self.queue.as_ref(), &delivery.id).await;
                    continue;
                };
                if stop.is_cancelled() {
                    nack(self.queue.as_ref(), &delivery.id).await;
                    continue;
                }
                if let Err(flume::SendError((delivery, _))) = work.send_async((delivery, permit)).await {
                    nack(self.queue.as_ref(), &delivery.id).await;
                }
            }
        }
    }
}

async fn nack(queue: &dyn MessageQueue, id: &str) {
    if let Err(e) = queue.nack(id).await {
        warn!(consumer = "queue", id, error = %e, "nack failed");
    }
}

async fn handle_deliveries(
    worker: usize,
    queue: Arc<dyn MessageQueue>,
    sink: Arc<EventSink>,
    work: flume::Receiver<Work>,
    stop: CancellationToken,
) {
    while let Ok((delivery, permit)) = work.recv_async().await {
        let emitted = match Event::from_wire(&delivery.body) {
            Ok(event) => {
                debug!(consumer = "queue", worker, event_name = event.name(), id = %delivery.id, "emitting event");
                match sink.send_or_cancel(event, &stop).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(consumer = "queue", worker, id = %delivery.id, error = %e, "emit interrupted");
                        false
                    }
                }
            }
            Err(e) => {
                warn!(
                    consumer = "queue",
                    worker,
                    id = %delivery.id,
                    attempts = delivery.attempts,
                    error = %e,
                    "couldn't decode event"
                );
                false
            }
        };

        if emitted {
            if let Err(e) = queue.ack(&delivery.id).await {
                warn!(consumer = "queue", id = %delivery.id, error = %e, "ack failed");
            }
        } else {
            nack(queue.as_ref(), &delivery.id).await;
        }
        drop(permit);
    }
}

#[async_trait]
impl Consumer for QueueConsumer {
    fn name(&self) -> &str {
        "queue"
    }

    async fn start(&self) -> Result<(), ConsumerError> {
        if !self.lifecycle.begin() {
            debug!(consumer = "queue", "already running or stopped");
            return Ok(());
        }

        let handler_count = self.config.effective_handler_count();
        let max_in_flight = self.config.effective_max_in_flight();
        if self.config.handler_count == 0 {
            info!(consumer = "queue", handler_count, "no handler count configured, using default");
        }
        if self.config.max_in_flight == 0 {
            info!(consumer = "queue", max_in_flight, "no max in flight configured, using default");
        }

        info!(
            consumer = "queue",
            topic = %self.config.topic,
            channel = %self.config.channel,
            queue = self.queue.name(),
            "starting"
        );

        if let Err(e) = self.queue.connect().await {
            warn!(consumer = "queue", error = %e, "couldn't connect to queue");
            self.close();
            return Err(ConsumerError::Transport(e.to_string()));
        }

        let permits = Arc::new(Semaphore::new(max_in_flight));
        let (work_tx, work_rx) = flume::bounded::<Work>(max_in_flight);
        let workers = TaskTracker::new();
        for worker in 0..handler_count {
            workers.spawn(handle_deliveries(
                worker,
                self.queue.clone(),
                self.sink.clone(),
                work_rx.clone(),
                self.lifecycle.stop_token().clone(),
            ));
        }
        drop(work_rx);
        workers.close();

        self.pump(permits, work_tx).await;

        // The pump dropped its sender: workers drain what is queued and exit.
        workers.wait().await;
        self.close();
        info!(consumer = "queue", "stopped");
        Ok(())
    }

    async fn stop(&self) {
        if self.lifecycle.is_stopped() {
            return;
        }
        info!(consumer = "queue", "stopping");

        if self.lifecycle.close_if_idle() {
            self.lifecycle.request_stop();
            self.close();
            return;
        }

        if !self.lifecycle.stop_and_wait(STOP_TIMEOUT).await {
            warn!(consumer = "queue", timeout = ?STOP_TIMEOUT, "stop not confirmed in time");
        }
    }

    fn events(&self) -> Option<EventStream> {
        self.events.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::queue::InMemoryQueue;

    fn wire(name: &str) -> Vec<u8> {
        Event::new(name, b"{}".to_vec()).to_wire().unwrap()
    }

    fn consumer(queue: &Arc<InMemoryQueue>, config: QueueConsumerConfig) -> Arc<QueueConsumer> {
        Arc::new(QueueConsumer::new(queue.clone(), config))
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn zero_counts_fall_back_to_defaults() {
        let config = QueueConsumerConfig::new("events", "worker");
        assert_eq!(config.effective_handler_count(), 4);
        assert_eq!(config.effective_max_in_flight(), 4);

        let config = config.with_handler_count(2).with_max_in_flight(16);
        assert_eq!(config.effective_handler_count(), 2);
        assert_eq!(config.effective_max_in_flight(), 16);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn forwards_and_acks_deliveries() {
        let queue = Arc::new(InMemoryQueue::new());
        for name in ["a", "b", "c"] {
            queue.publish(wire(name)).await.unwrap();
        }

        let consumer = consumer(&queue, QueueConsumerConfig::new("events", "worker"));
        let events = consumer.events().unwrap();
        let runner = consumer.clone();
        let run = tokio::spawn(async move { runner.start().await });

        let mut names = BTreeSet::new();
        for _ in 0..3 {
            let event = events.recv_timeout(Duration::from_secs(5)).await.unwrap();
            names.insert(event.name().to_string());
        }
        assert_eq!(names, BTreeSet::from(["a".into(), "b".into(), "c".into()]));

        eventually(|| queue.acked() == 3).await;

        consumer.stop().await;
        run.await.unwrap().unwrap();
        assert!(events.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn undecodable_messages_are_nacked() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.publish(b"definitely not json".to_vec()).await.unwrap();

        let consumer = consumer(&queue, QueueConsumerConfig::new("events", "worker"));
        let events = consumer.events().unwrap();
        let runner = consumer.clone();
        let run = tokio::spawn(async move { runner.start().await });

        eventually(|| queue.nacked() >= 1).await;
        assert_eq!(queue.acked(), 0);
        assert!(events.try_recv().is_none());

        consumer.stop().await;
        run.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn outstanding_deliveries_never_exceed_max_in_flight() {
        let queue = Arc::new(InMemoryQueue::new());
        for i in 0..10 {
            queue.publish(wire(&format!("e{i}"))).await.unwrap();
        }

        let config = QueueConsumerConfig::new("events", "worker")
            .with_handler_count(4)
            .with_max_in_flight(2);
        let consumer = consumer(&queue, config);
        let _events = consumer.events().unwrap();
        let runner = consumer.clone();
        let run = tokio::spawn(async move { runner.start().await });

        // Nobody reads the stream, so nothing is acked.
        eventually(|| queue.in_flight() == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.in_flight(), 2);

        consumer.stop().await;
        run.await.unwrap().unwrap();

        // Interrupted emits go back to the queue.
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.ready(), 10);
    }

    #[tokio::test]
    async fn stop_before_start_and_twice_is_safe() {
        let queue = Arc::new(InMemoryQueue::new());
        let consumer = consumer(&queue, QueueConsumerConfig::new("events", "worker"));
        let events = consumer.events().unwrap();

        consumer.stop().await;
        consumer.stop().await;
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn start_after_stop_leaves_the_queue_untouched() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.publish(wire("a")).await.unwrap();
        let consumer = consumer(&queue, QueueConsumerConfig::new("events", "worker"));
        let _events = consumer.events().unwrap();

        consumer.stop().await;
        consumer.start().await.unwrap();

        assert_eq!(queue.ready(), 1);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_racing_a_spawned_start_always_closes_the_stream() {
        for _ in 0..50 {
            let queue = Arc::new(InMemoryQueue::new());
            let consumer = consumer(&queue, QueueConsumerConfig::new("events", "worker"));
            let events = consumer.events().unwrap();

            let runner = consumer.clone();
            let run = tokio::spawn(async move { runner.start().await });
            consumer.stop().await;

            run.await.unwrap().unwrap();
            let next = events.recv_timeout(Duration::from_secs(5)).await;
            assert!(matches!(next, Err(flume::RecvTimeoutError::Disconnected)));
        }
    }
}
