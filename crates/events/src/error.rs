use std::time::Duration;

use thiserror::Error;

/// Failure to hand an event to the stream reader.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The producing side already closed the stream.
    #[error("event stream is closed")]
    Closed,

    /// The reader dropped its end of the stream.
    #[error("event stream reader is gone")]
    Disconnected,

    /// Shutdown was requested while waiting for the reader.
    #[error("send interrupted by shutdown")]
    Cancelled,
}

/// Fatal consumer error, surfaced from `Consumer::start`.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("no shards found in stream {0}")]
    NoShards(String),

    #[error("checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("log service error: {0}")]
    Log(String),

    #[error("queue transport error: {0}")]
    Transport(String),

    /// The fetch retrier gave up after its overall deadline.
    #[error("fetch retries exhausted after {elapsed:?}: {last_error}")]
    RetryExhausted { elapsed: Duration, last_error: String },

    /// `events()` was already handed to another reader.
    #[error("events stream already taken")]
    StreamTaken,

    #[error("consumer task failed: {0}")]
    Join(String),
}

/// Per-event dispatch condition. Never fatal to the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no dispatch function found for event {name}")]
    NoDispatch { name: String },

    #[error("queue is full ({max_jobs} jobs running)")]
    QueueFull { max_jobs: usize },

    /// Startup validation: event names that must be routable but are not.
    #[error("dispatch table has no route for: {}", missing.join(", "))]
    Incomplete { missing: Vec<String> },
}
