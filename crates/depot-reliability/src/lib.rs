//! Depot Reliability - Retry, circuit breaking, and transfer progress
//!
//! Backend and identity-provider I/O routes through these primitives:
//! jittered exponential-backoff retry for transient failures, one
//! circuit breaker per named dependency, and progress tracking for
//! streaming transfers.

pub mod breaker;
pub mod progress;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker};
pub use progress::{Progress, ProgressTracker};
pub use retry::{RetryObserver, RetryPolicy};
