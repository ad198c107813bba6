//! Retry policy with exponential backoff and jitter
//!
//! Retries are attempted only while the error is retryable and the
//! request's cancellation token has not fired. Cancellation is checked
//! before sleeping and again on wake.

use depot_common::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Per-attempt observation hook for the observability layer
pub type RetryObserver = Box<dyn Fn(u32, &Error) + Send + Sync>;

/// Retry policy with exponential backoff and jitter
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_factor: f64,
}

impl RetryPolicy {
    /// Default preset: 3 attempts, 100ms-10s, 2x backoff, 0.2 jitter
    #[must_use]
    pub const fn standard() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }

    /// Aggressive preset: 5 attempts, 50ms-30s, 2x backoff, 0.2 jitter
    #[must_use]
    pub const fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }

    /// Conservative preset: 2 attempts, 500ms-5s, 2x backoff, 0.1 jitter
    #[must_use]
    pub const fn conservative() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    #[must_use]
    pub fn from_config(config: &depot_common::config::RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: config.initial_delay(),
            max_delay: config.max_delay(),
            ..Self::standard()
        }
    }

    /// Backoff delay for a 0-indexed attempt, before jitter:
    /// `min(max_delay, initial_delay * multiplier^attempt)`
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt as i32);
        let delay = self.initial_delay.as_secs_f64() * exp;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Apply uniform jitter in `[-jitter_factor, +jitter_factor] * delay`
    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.jitter_factor;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
    }

    /// Run `op` with retries. The closure receives the 0-indexed attempt.
    pub async fn run<T, Fut, Op>(&self, token: &CancellationToken, op: Op) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
        Op: FnMut(u32) -> Fut,
    {
        self.run_observed(token, op, None).await
    }

    /// Run `op` with retries, invoking `observer` before each re-attempt
    pub async fn run_observed<T, Fut, Op>(
        &self,
        token: &CancellationToken,
        mut op: Op,
        observer: Option<&RetryObserver>,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
        Op: FnMut(u32) -> Fut,
    {
        let mut attempt = 0u32;
        loop {
            if token.is_cancelled() {
                return Err(Error::cancelled());
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let last = attempt + 1 >= self.max_attempts;
                    if last
                        || !err.is_retryable()
                        || err.is_circuit_open()
                        || err.is_cancelled()
                    {
                        return Err(err);
                    }

                    if let Some(observer) = observer {
                        observer(attempt, &err);
                    }
                    let delay = self.jittered(self.delay_for(attempt));
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying after failure");

                    tokio::select! {
                        () = token.cancelled() => return Err(Error::cancelled()),
                        () = tokio::time::sleep(delay) => {}
                    }
                    if token.is_cancelled() {
                        return Err(Error::cancelled());
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_common::ErrorKind;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_backoff_curve() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        // Capped at max_delay
        assert_eq!(policy.delay_for(20), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_retryable_error_retries_to_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = fast_policy(3)
            .run(&CancellationToken::new(), move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::storage_unavailable("backend down"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_attempts_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = fast_policy(3)
            .run(&CancellationToken::new(), move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::not_found("no such object"))
                }
            })
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_circuit_open_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = fast_policy(5)
            .run(&CancellationToken::new(), move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::circuit_open("storage"))
                }
            })
            .await;
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = fast_policy(5)
            .run(&CancellationToken::new(), move |_| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::storage_unavailable("flaky"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retry_loop() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = fast_policy(5)
            .run(&token, move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::storage_unavailable("flaky"))
                }
            })
            .await;
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
