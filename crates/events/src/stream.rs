//! Unbuffered event hand-off between a consumer and its single reader.
//!
//! The stream is a rendezvous channel: [`EventSink::send`] completes only once
//! the reader has taken the event. This is the backpressure point of the whole
//! pipeline:
//!
//! ```text
//! fetch ──► decode ──► EventSink::send (blocks) ──► EventStream::recv ──► dispatch
//! ```
//!
//! A slow reader therefore slows fetching instead of growing a queue.
//!
//! ## Closing
//!
//! The producing side closes the stream with [`EventSink::close`]. Closing is
//! idempotent; only the first call has an effect and reports `true`. After the
//! close the reader drains nothing further and `recv` returns `None`.

use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use eventmill_core::Event;

use crate::error::StreamError;

/// Create a connected sink/stream pair with no buffering.
pub fn event_stream() -> (EventSink, EventStream) {
    let (tx, rx) = flume::bounded(0);
    (
        EventSink {
            tx: Mutex::new(Some(tx)),
        },
        EventStream { rx },
    )
}

/// Producing half of the event stream, owned by a consumer.
#[derive(Debug)]
pub struct EventSink {
    tx: Mutex<Option<flume::Sender<Event>>>,
}

impl EventSink {
    fn sender(&self) -> Result<flume::Sender<Event>, StreamError> {
        self.tx
            .lock()
            .unwrap()
            .as_ref()
            .cloned()
            .ok_or(StreamError::Closed)
    }

    /// Block until the reader takes `event`.
    pub async fn send(&self, event: Event) -> Result<(), StreamError> {
        let tx = self.sender()?;
        tx.send_async(event)
            .await
            .map_err(|_| StreamError::Disconnected)
    }

    /// Like [`send`](Self::send), but gives up when `stop` fires first.
    ///
    /// An event that was not taken before the stop is dropped; it was never
    /// emitted, so callers must not advance their position for it.
    pub async fn send_or_cancel(
        &self,
        event: Event,
        stop: &CancellationToken,
    ) -> Result<(), StreamError> {
        let tx = self.sender()?;
        tokio::select! {
            biased;
            _ = stop.cancelled() => Err(StreamError::Cancelled),
            res = tx.send_async(event) => res.map_err(|_| StreamError::Disconnected),
        }
    }

    /// Close the stream. Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        self.tx.lock().unwrap().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().unwrap().is_none()
    }
}

/// Reading half of the event stream.
///
/// Designed for a single reader (the dispatch engine). Messages arrive in the
/// order the consumer emitted them.
#[derive(Debug)]
pub struct EventStream {
    rx: flume::Receiver<Event>,
}

impl EventStream {
    /// Wait for the next event; `None` once the stream is closed.
    pub async fn recv(&self) -> Option<Event> {
        self.rx.recv_async().await.ok()
    }

    /// Take an event only if a sender is waiting right now.
    pub fn try_recv(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next event.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Event, flume::RecvTimeoutError> {
        match tokio::time::timeout(timeout, self.rx.recv_async()).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(flume::RecvTimeoutError::Disconnected),
            Err(_) => Err(flume::RecvTimeoutError::Timeout),
        }
    }

    /// `true` once the sink is closed and nothing is left to read.
    pub fn is_finished(&self) -> bool {
        self.rx.is_disconnected() && self.rx.is_empty()
    }
}
