//! In-process consumer fed by a publisher handle.
//!
//! Useful for tests and for wiring the engine without a log or queue. Events
//! published before `start()` are buffered in the inbox and emitted once the
//! consumer runs; the outbound [`EventStream`] stays unbuffered.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use eventmill_core::Event;

use crate::consumer::{Consumer, Lifecycle, STOP_TIMEOUT};
use crate::error::{ConsumerError, StreamError};
use crate::stream::{EventSink, EventStream, event_stream};

/// Publishing handle for an [`InMemoryConsumer`].
#[derive(Debug, Clone)]
pub struct InMemoryPublisher {
    tx: flume::Sender<Event>,
}

impl InMemoryPublisher {
    /// Queue an event for the consumer.
    ///
    /// Fails only when the consumer has been dropped.
    pub fn publish(&self, event: Event) -> Result<(), StreamError> {
        self.tx.send(event).map_err(|_| StreamError::Disconnected)
    }
}

/// Consumer that emits whatever its [`InMemoryPublisher`] queues.
#[derive(Debug)]
pub struct InMemoryConsumer {
    inbox: flume::Receiver<Event>,
    sink: EventSink,
    stream: Mutex<Option<EventStream>>,
    lifecycle: Lifecycle,
}

impl InMemoryConsumer {
    pub fn new() -> (Self, InMemoryPublisher) {
        let (tx, inbox) = flume::unbounded();
        let (sink, stream) = event_stream();

        let consumer = Self {
            inbox,
            sink,
            stream: Mutex::new(Some(stream)),
            lifecycle: Lifecycle::new(),
        };
        (consumer, InMemoryPublisher { tx })
    }

    fn shutdown(&self) {
        if self.sink.close() {
            debug!("in-memory consumer closed its event stream");
        }
        self.lifecycle.mark_stopped();
    }
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn start(&self) -> Result<(), ConsumerError> {
        if !self.lifecycle.begin() {
            debug!("in-memory consumer already running or stopped");
            return Ok(());
        }
        info!("in-memory consumer started");
        let stop = self.lifecycle.stop_token();

        loop {
            let event = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                next = self.inbox.recv_async() => match next {
                    Ok(event) => event,
                    // Every publisher is gone: nothing more can arrive.
                    Err(_) => break,
                },
            };

            if self.sink.send_or_cancel(event, stop).await.is_err() {
                break;
            }
        }

        self.shutdown();
        info!("in-memory consumer stopped");
        Ok(())
    }

    async fn stop(&self) {
        if self.lifecycle.is_stopped() {
            return;
        }
        if self.lifecycle.close_if_idle() {
            // Nobody else will close the stream.
            self.lifecycle.request_stop();
            self.shutdown();
            return;
        }
        if !self.lifecycle.stop_and_wait(STOP_TIMEOUT).await {
            warn!(timeout = ?STOP_TIMEOUT, "in-memory consumer did not confirm stop");
        }
    }

    fn events(&self) -> Option<EventStream> {
        self.stream.lock().unwrap().take()
    }
}
