use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use metrics::{counter, gauge};
use serde::Serialize;

/// Point-in-time copy of [`WorkerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    /// Requests currently being processed
    pub in_flight: usize,
    /// Requests answered and deleted
    pub completed: u64,
    /// Requests returned to the queue
    pub returned: u64,
    /// Iterations that ended with an error
    pub failed: u64,
}

/// Counters shared between the worker slots and the health endpoint
#[derive(Debug, Default)]
pub struct WorkerStats {
    in_flight: AtomicUsize,
    completed: AtomicU64,
    returned: AtomicU64,
    failed: AtomicU64,
}

impl WorkerStats {
    /// Marks a request as in flight until the returned guard is dropped
    #[must_use]
    pub fn track_in_flight(&self) -> InFlightGuard<'_> {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        record_in_flight(in_flight);
        InFlightGuard { stats: self }
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        counter!("worker_messages_completed").increment(1);
    }

    pub(crate) fn record_returned(&self) {
        self.returned.fetch_add(1, Ordering::Relaxed);
        counter!("worker_messages_returned").increment(1);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        counter!("worker_iterations_failed").increment(1);
    }

    /// Current counter values
    #[must_use]
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_in_flight(in_flight: usize) {
    gauge!("worker_in_flight").set(in_flight as f64);
}

/// Decrements the in-flight count on drop
pub struct InFlightGuard<'a> {
    stats: &'a WorkerStats,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let in_flight = self.stats.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        record_in_flight(in_flight);
    }
}
