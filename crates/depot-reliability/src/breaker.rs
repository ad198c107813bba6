//! Circuit breaker with lock-free atomics
//!
//! One breaker guards each named dependency (`storage`, `identity`).
//! Closed counts consecutive failures; Open rejects immediately; HalfOpen
//! admits a bounded number of concurrent probes and closes again only
//! after enough of them succeed.

use dashmap::DashMap;
use depot_common::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Clock abstraction so breaker timing can be faked in tests
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Monotonic clock backed by `Instant::now()`
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker tuning
#[derive(Clone, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures that trip Closed -> Open
    pub max_failures: u32,
    /// Time spent Open before admitting probes
    pub timeout: Duration,
    /// Maximum concurrent probe calls while HalfOpen
    pub half_open_max: u32,
    /// Probe successes required to close again
    pub half_open_success: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            timeout: Duration::from_secs(30),
            half_open_max: 1,
            half_open_success: 1,
        }
    }
}

struct BreakerInner {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    opened_at_millis: AtomicU64,
    half_open_inflight: AtomicU32,
    half_open_successes: AtomicU32,
}

/// Circuit breaker for a single named dependency
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: BreakerConfig,
    inner: Arc<BreakerInner>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into().into(),
            config,
            inner: Arc::new(BreakerInner {
                state: AtomicU8::new(STATE_CLOSED),
                consecutive_failures: AtomicU32::new(0),
                opened_at_millis: AtomicU64::new(0),
                half_open_inflight: AtomicU32::new(0),
                half_open_successes: AtomicU32::new(0),
            }),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (deterministic tests)
    #[must_use]
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> BreakerState {
        match self.inner.state.load(Ordering::Acquire) {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    /// Run `op` under the breaker. While Open, fails immediately with a
    /// circuit-open `service_unavailable` without invoking `op`.
    /// Cancellations pass through without counting as failures.
    pub async fn call<T, Fut, Op>(&self, op: Op) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
        Op: FnOnce() -> Fut,
    {
        let mut admitted_probe = false;
        loop {
            match self.inner.state.load(Ordering::Acquire) {
                STATE_OPEN => {
                    let opened_at = self.inner.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                    if elapsed < self.config.timeout.as_millis() as u64 {
                        return Err(Error::circuit_open(&self.name));
                    }
                    // Timeout elapsed: race to half-open
                    match self.inner.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            info!(breaker = %self.name, "circuit breaker half-open");
                            self.inner.half_open_successes.store(0, Ordering::Release);
                            self.inner.half_open_inflight.store(1, Ordering::Release);
                            admitted_probe = true;
                            break;
                        }
                        Err(_) => continue,
                    }
                }
                STATE_HALF_OPEN => {
                    let inflight = self.inner.half_open_inflight.fetch_add(1, Ordering::AcqRel);
                    if inflight >= self.config.half_open_max {
                        self.inner.half_open_inflight.fetch_sub(1, Ordering::Release);
                        return Err(Error::circuit_open(&self.name));
                    }
                    debug!(breaker = %self.name, inflight = inflight + 1, "circuit breaker probe admitted");
                    admitted_probe = true;
                    break;
                }
                _ => break,
            }
        }

        let result = op().await;

        if admitted_probe {
            self.inner.half_open_inflight.fetch_sub(1, Ordering::Release);
        }

        match &result {
            Ok(_) => self.on_success(),
            Err(err) if err.is_cancelled() => {}
            Err(_) => self.on_failure(),
        }

        result
    }

    fn on_success(&self) {
        match self.inner.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                let successes = self.inner.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.half_open_success
                    && self
                        .inner
                        .state
                        .compare_exchange(
                            STATE_HALF_OPEN,
                            STATE_CLOSED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.inner.consecutive_failures.store(0, Ordering::Release);
                    self.inner.opened_at_millis.store(0, Ordering::Release);
                    info!(breaker = %self.name, "circuit breaker closed");
                }
            }
            STATE_CLOSED => {
                self.inner.consecutive_failures.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn on_failure(&self) {
        match self.inner.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .inner
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.inner
                        .opened_at_millis
                        .store(self.clock.now_millis(), Ordering::Release);
                    warn!(breaker = %self.name, "circuit breaker probe failed, reopening");
                }
            }
            STATE_CLOSED => {
                let failures = self.inner.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.max_failures
                    && self
                        .inner
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.inner
                        .opened_at_millis
                        .store(self.clock.now_millis(), Ordering::Release);
                    warn!(breaker = %self.name, failures, "circuit breaker opened");
                }
            }
            _ => {}
        }
    }
}

/// One breaker per named dependency, created on first use
#[derive(Clone, Default)]
pub struct BreakerRegistry {
    breakers: Arc<DashMap<String, CircuitBreaker>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            config,
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> CircuitBreaker {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name, self.config.clone()))
            .clone()
    }

    /// Snapshot of all breaker states, for health reporting
    #[must_use]
    pub fn states(&self) -> Vec<(String, BreakerState)> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    #[derive(Debug, Default)]
    struct FakeClock(StdAtomicU64);

    impl FakeClock {
        fn advance(&self, millis: u64) {
            self.0.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for Arc<FakeClock> {
        fn now_millis(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn breaker_with_clock(config: BreakerConfig) -> (CircuitBreaker, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::default());
        let breaker = CircuitBreaker::new("storage", config).with_clock(clock.clone());
        (breaker, clock)
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .call(|| async { Err(Error::storage_unavailable("down")) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<()> {
        breaker.call(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_opens_after_max_failures() {
        let (breaker, _) = breaker_with_clock(BreakerConfig {
            max_failures: 3,
            ..BreakerConfig::default()
        });

        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // Next call is rejected without invoking the operation
        let result = breaker
            .call(|| async {
                panic!("operation must not run while open");
                #[allow(unreachable_code)]
                Ok(())
            })
            .await;
        assert!(result.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let (breaker, _) = breaker_with_clock(BreakerConfig {
            max_failures: 3,
            ..BreakerConfig::default()
        });

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        let _ = succeed(&breaker).await;
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_after_successes() {
        let (breaker, clock) = breaker_with_clock(BreakerConfig {
            max_failures: 1,
            timeout: Duration::from_secs(30),
            half_open_max: 1,
            half_open_success: 2,
        });

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        clock.advance(30_001);
        let _ = succeed(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        let _ = succeed(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let (breaker, clock) = breaker_with_clock(BreakerConfig {
            max_failures: 1,
            timeout: Duration::from_secs(30),
            ..BreakerConfig::default()
        });

        let _ = fail(&breaker).await;
        clock.advance(30_001);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_cancellation_does_not_count_as_failure() {
        let (breaker, _) = breaker_with_clock(BreakerConfig {
            max_failures: 1,
            ..BreakerConfig::default()
        });

        let _: Result<()> = breaker.call(|| async { Err(Error::cancelled()) }).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_registry_reuses_breakers() {
        let registry = BreakerRegistry::new(BreakerConfig {
            max_failures: 1,
            ..BreakerConfig::default()
        });
        let _ = fail(&registry.get("storage")).await;
        assert_eq!(registry.get("storage").state(), BreakerState::Open);
        assert_eq!(registry.get("identity").state(), BreakerState::Closed);
    }
}
