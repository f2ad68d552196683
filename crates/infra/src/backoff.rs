//! Capped, jittered exponential backoff and a cancellable retry loop.
//!
//! Used on the stream fetch path only. Defaults:
//!
//! | setting              | value   |
//! |----------------------|---------|
//! | initial interval     | 100ms   |
//! | multiplier           | 1.5     |
//! | randomization factor | 0.5     |
//! | max interval         | 1 min   |
//! | max elapsed time     | 60 min  |
//!
//! Each delay is drawn uniformly from `interval * [1 - factor, 1 + factor]`;
//! the interval itself then grows by the multiplier up to the cap. Once the
//! total elapsed time would pass the deadline, the backoff gives up.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Backoff tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial_interval: Duration,
    pub multiplier: f64,
    /// Jitter as a fraction of the current interval (0.0 disables jitter).
    pub randomization_factor: f64,
    pub max_interval: Duration,
    /// Overall deadline across all attempts.
    pub max_elapsed: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            multiplier: 1.5,
            randomization_factor: 0.5,
            max_interval: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(60 * 60),
        }
    }
}

impl BackoffConfig {
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_max_elapsed(mut self, elapsed: Duration) -> Self {
        self.max_elapsed = elapsed;
        self
    }

    pub fn with_randomization_factor(mut self, factor: f64) -> Self {
        self.randomization_factor = factor.clamp(0.0, 1.0);
        self
    }
}

/// Stateful backoff sequence. Call [`reset`](Self::reset) after a success.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current: Duration,
    started: Instant,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial_interval,
            config,
            started: Instant::now(),
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Restart the sequence and the deadline clock.
    pub fn reset(&mut self) {
        self.current = self.config.initial_interval;
        self.started = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Next delay, or `None` once waiting it would pass the overall deadline.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let delay = jitter(self.current, self.config.randomization_factor);

        if self.elapsed() + delay > self.config.max_elapsed {
            return None;
        }

        let grown = self.current.as_nanos() as f64 * self.config.multiplier;
        self.current = if grown >= self.config.max_interval.as_nanos() as f64 {
            self.config.max_interval
        } else {
            Duration::from_nanos(grown as u64)
        };

        Some(delay)
    }
}

fn jitter(interval: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return interval;
    }
    let base = interval.as_secs_f64();
    let delta = base * factor;
    let secs = rand::thread_rng().gen_range((base - delta)..=(base + delta));
    Duration::from_secs_f64(secs.max(0.0))
}

/// Why [`retry`] gave up.
#[derive(Debug, PartialEq)]
pub enum RetryError<E> {
    /// The stop token fired before an attempt or during a wait.
    Stopped,
    /// The overall deadline passed; carries the last attempt's error.
    Expired { elapsed: Duration, last_error: E },
    /// The attempt failed with an error retrying cannot fix.
    Permanent(E),
}

/// Run `op` until it succeeds, the deadline passes, or `stop` fires.
///
/// `stop` is checked before every attempt and raced against every wait, so a
/// stop request is observed at the next check point without waiting out a
/// long delay. The backoff is reset first, so each call gets a fresh deadline.
pub async fn retry<T, E, F, Fut>(
    backoff: &mut ExponentialBackoff,
    stop: &CancellationToken,
    op: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    retry_if(backoff, stop, |_: &E| true, op).await
}

/// Like [`retry`], but an error for which `retryable` is false ends the loop at
/// once with [`RetryError::Permanent`].
pub async fn retry_if<T, E, P, F, Fut>(
    backoff: &mut ExponentialBackoff,
    stop: &CancellationToken,
    retryable: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    backoff.reset();
    let mut attempt: u32 = 0;

    loop {
        if stop.is_cancelled() {
            return Err(RetryError::Stopped);
        }

        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !retryable(&err) {
            return Err(RetryError::Permanent(err));
        }

        let Some(delay) = backoff.next_backoff() else {
            return Err(RetryError::Expired {
                elapsed: backoff.elapsed(),
                last_error: err,
            });
        };

        warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying after error");

        tokio::select! {
            biased;
            _ = stop.cancelled() => return Err(RetryError::Stopped),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig::default().with_randomization_factor(0.0)
    }

    #[tokio::test(start_paused = true)]
    async fn intervals_grow_by_the_multiplier_up_to_the_cap() {
        let mut backoff = ExponentialBackoff::new(
            no_jitter().with_max_interval(Duration::from_millis(300)),
        );

        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(150)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(225)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(300)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(300)));
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_stays_within_half_the_interval() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig::default());

        for _ in 0..50 {
            backoff.reset();
            let delay = backoff.next_backoff().unwrap();
            assert!(delay >= Duration::from_millis(50), "{delay:?}");
            assert!(delay <= Duration::from_millis(150), "{delay:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_past_the_deadline() {
        let mut backoff = ExponentialBackoff::new(
            no_jitter().with_max_elapsed(Duration::from_millis(200)),
        );

        assert!(backoff.next_backoff().is_some());
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(backoff.next_backoff().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_returns_the_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut backoff = ExponentialBackoff::new(no_jitter());
        let stop = CancellationToken::new();

        let seen = calls.clone();
        let result: Result<u32, RetryError<String>> = retry(&mut backoff, &stop, || {
            let seen = seen.clone();
            async move {
                let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(format!("throttled #{n}")) } else { Ok(n) }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_expires_with_the_last_error() {
        let mut backoff =
            ExponentialBackoff::new(no_jitter().with_max_elapsed(Duration::from_secs(2)));
        let stop = CancellationToken::new();

        let result: Result<(), RetryError<&str>> =
            retry(&mut backoff, &stop, || async { Err("iterator expired") }).await;

        match result {
            Err(RetryError::Expired { elapsed, last_error }) => {
                assert_eq!(last_error, "iterator expired");
                assert!(elapsed <= Duration::from_secs(2));
            }
            other => panic!("expected expiry, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_a_pending_wait() {
        let mut backoff = ExponentialBackoff::new(
            no_jitter().with_initial_interval(Duration::from_secs(30)),
        );
        let stop = CancellationToken::new();

        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result: Result<(), RetryError<&str>> =
            retry(&mut backoff, &stop, || async { Err("unavailable") }).await;

        assert_eq!(result, Err(RetryError::Stopped));
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_end_the_loop_at_once() {
        let mut backoff = ExponentialBackoff::new(no_jitter());
        let stop = CancellationToken::new();

        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result: Result<(), RetryError<&str>> = retry_if(
            &mut backoff,
            &stop,
            |e: &&str| *e != "stream deleted",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n == 0 { Err("throttled") } else { Err("stream deleted") } }
            },
        )
        .await;

        assert_eq!(result, Err(RetryError::Permanent("stream deleted")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn stop_before_the_first_attempt_skips_it() {
        let mut backoff = ExponentialBackoff::new(no_jitter());
        let stop = CancellationToken::new();
        stop.cancel();

        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<&str>> = retry(&mut backoff, &stop, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("unreachable") }
        })
        .await;

        assert_eq!(result, Err(RetryError::Stopped));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
