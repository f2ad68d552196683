//! Consumer capability: the contract every event source implements.
//!
//! A consumer pulls events from some durable source (a log shard, a queue
//! topic) and emits them on its [`EventStream`].
//!
//! ## Lifecycle
//!
//! - `start()` runs until `stop()` is called or a fatal error occurs and returns
//!   that error. Per-event failures never end `start()`.
//! - `stop()` requests a graceful shutdown and waits up to [`STOP_TIMEOUT`] for the
//!   consumer to confirm. On timeout it returns anyway; the shutdown keeps running
//!   in the background and is not forced.
//! - `events()` hands out the reading half of the stream exactly once. The stream is
//!   closed exactly once, when the consumer shuts down.
//!
//! ## Delivery
//!
//! Consumers are at-least-once: an event may be emitted again after a crash or
//! restart. Handlers downstream must tolerate duplicates.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ConsumerError;
use crate::stream::EventStream;

/// How long `stop()` waits for a consumer to confirm it has shut down.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// An event source feeding the dispatch engine.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Short name used in logs (e.g. `"stream"`, `"queue"`).
    fn name(&self) -> &str;

    /// Run until stopped or until a fatal error.
    async fn start(&self) -> Result<(), ConsumerError>;

    /// Request shutdown and wait (bounded) for confirmation.
    async fn stop(&self);

    /// Take the reading half of the event stream (`None` after the first call).
    fn events(&self) -> Option<EventStream>;
}

#[async_trait]
impl<C> Consumer for Arc<C>
where
    C: Consumer + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn start(&self) -> Result<(), ConsumerError> {
        (**self).start().await
    }

    async fn stop(&self) {
        (**self).stop().await
    }

    fn events(&self) -> Option<EventStream> {
        (**self).events()
    }
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const CLOSED: u8 = 2;

/// Stop/stopped signalling shared by consumer implementations.
///
/// `stop` is raised by `Consumer::stop()` and observed by the run loop at its
/// check points; `stopped` is raised by the run loop once its shutdown sequence
/// has finished.
///
/// Whether a run ever begins is decided by one atomic transition: `begin()`
/// moves idle → running and `close_if_idle()` moves idle → closed, so exactly
/// one of `start()` and an early `stop()` owns the shutdown sequence.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    stop: CancellationToken,
    stopped: CancellationToken,
    phase: Arc<AtomicU8>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the run. `false` when already running, or closed before it began.
    pub fn begin(&self) -> bool {
        self.phase
            .compare_exchange(IDLE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Close a consumer that never began. `true` means the caller closes the
    /// stream itself; `false` means a run owns the shutdown.
    pub fn close_if_idle(&self) -> bool {
        self.phase
            .compare_exchange(IDLE, CLOSED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Token that fires when a stop is requested.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn mark_stopped(&self) {
        self.stopped.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Request a stop and wait up to `timeout` for the run loop to confirm.
    ///
    /// Returns `true` when the stop was confirmed in time.
    pub async fn stop_and_wait(&self, timeout: Duration) -> bool {
        self.request_stop();
        tokio::time::timeout(timeout, self.stopped.cancelled())
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_and_wait_returns_once_confirmed() {
        let lifecycle = Lifecycle::new();

        let runner = lifecycle.clone();
        tokio::spawn(async move {
            runner.stop_token().cancelled().await;
            runner.mark_stopped();
        });

        assert!(lifecycle.stop_and_wait(Duration::from_secs(1)).await);
        assert!(lifecycle.stop_requested());
        assert!(lifecycle.is_stopped());
    }

    #[test]
    fn only_one_side_claims_an_idle_lifecycle() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.begin());
        assert!(!lifecycle.begin());
        assert!(!lifecycle.close_if_idle());

        let early = Lifecycle::new();
        assert!(early.close_if_idle());
        assert!(!early.begin());
        assert!(!early.close_if_idle());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_begin_and_close_have_one_winner() {
        for _ in 0..200 {
            let lifecycle = Lifecycle::new();
            let starter = lifecycle.clone();
            let stopper = lifecycle.clone();

            let began = tokio::spawn(async move { starter.begin() });
            let closed = tokio::spawn(async move { stopper.close_if_idle() });

            let (began, closed) = (began.await.unwrap(), closed.await.unwrap());
            assert!(began ^ closed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_and_wait_gives_up_after_the_timeout() {
        let lifecycle = Lifecycle::new();

        let started = tokio::time::Instant::now();
        assert!(!lifecycle.stop_and_wait(STOP_TIMEOUT).await);
        assert!(started.elapsed() >= STOP_TIMEOUT);
        assert!(!lifecycle.is_stopped());
    }
}
