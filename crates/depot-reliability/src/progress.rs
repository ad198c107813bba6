//! Transfer progress tracking
//!
//! Counts bytes moved by a streaming transfer and derives throughput and
//! an ETA for the observability layer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Snapshot of an in-flight transfer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub transferred: u64,
    pub total: Option<u64>,
    pub bytes_per_sec: f64,
    pub eta: Option<Duration>,
}

/// Shared, atomically updated transfer counter
#[derive(Clone)]
pub struct ProgressTracker {
    transferred: Arc<AtomicU64>,
    total: Option<u64>,
    started: Instant,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(total: Option<u64>) -> Self {
        Self {
            transferred: Arc::new(AtomicU64::new(0)),
            total,
            started: Instant::now(),
        }
    }

    pub fn add(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    #[must_use]
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> Progress {
        let transferred = self.transferred();
        let elapsed = self.started.elapsed().as_secs_f64();
        let bytes_per_sec = if elapsed > 0.0 {
            transferred as f64 / elapsed
        } else {
            0.0
        };
        let eta = match (self.total, bytes_per_sec > 0.0) {
            (Some(total), true) if total > transferred => Some(Duration::from_secs_f64(
                (total - transferred) as f64 / bytes_per_sec,
            )),
            (Some(_), true) => Some(Duration::ZERO),
            _ => None,
        };
        Progress {
            transferred,
            total: self.total,
            bytes_per_sec,
            eta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_bytes() {
        let tracker = ProgressTracker::new(Some(100));
        tracker.add(30);
        tracker.add(20);
        assert_eq!(tracker.transferred(), 50);
    }

    #[test]
    fn test_eta_reaches_zero_at_completion() {
        let tracker = ProgressTracker::new(Some(10));
        tracker.add(10);
        std::thread::sleep(Duration::from_millis(5));
        let snap = tracker.snapshot();
        assert_eq!(snap.eta, Some(Duration::ZERO));
        assert!(snap.bytes_per_sec > 0.0);
    }

    #[test]
    fn test_unknown_total_has_no_eta() {
        let tracker = ProgressTracker::new(None);
        tracker.add(10);
        assert_eq!(tracker.snapshot().eta, None);
    }
}
