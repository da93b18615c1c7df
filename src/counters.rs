//! Atomic counters and the exponentially-weighted moving averages the
//! optional 1 Hz sampler maintains over them.
//!
//! Counters are incremented with plain atomics on the hot path; the
//! sampler is the single writer of the EWMA fields, so no locking is
//! needed on the read side of the averages either.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

/// Raw, atomically-updated counts. Safe to read concurrently with writers;
/// a `snapshot()` call gives a point-in-time copy (fields may not all be
/// from the exact same instant, which is fine for telemetry).
#[derive(Default)]
pub struct Counters {
    pub submitted: AtomicU64,
    pub rejected: AtomicU64,
    pub completed: AtomicU64,
    pub cancelled: AtomicU64,
    pub failed: AtomicU64,
    pub commit_groups_formed: AtomicU64,
    pub commit_groups_aborted: AtomicU64,
    pub fsyncs: AtomicU64,
    /// Sum of every finished task's wall-clock service time, in
    /// milliseconds. Divided by `finished` deltas between sampler ticks
    /// to get the EWMA's service-time input.
    pub service_time_total_ms: AtomicU64,
    /// Count of tasks whose service time has been folded into
    /// `service_time_total_ms` (completed, cancelled, or failed all count:
    /// the sampler cares how long a worker was occupied, not the outcome).
    pub finished: AtomicU64,
}

impl Counters {
    /// Record one task's finished service time for the telemetry sampler.
    pub(crate) fn record_service_time(&self, elapsed: std::time::Duration) {
        self.service_time_total_ms.fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.finished.fetch_add(1, Ordering::Relaxed);
    }
}

/// A consistent, read-only snapshot of [`Counters`] plus the sampler's
/// EWMAs, returned by `getCounters()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountersSnapshot {
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub commit_groups_formed: u64,
    pub commit_groups_aborted: u64,
    pub fsyncs: u64,
    pub ewma_queue_depth: f64,
    pub ewma_arrival_rate: f64,
    pub ewma_service_time_ms: f64,
}

impl Counters {
    pub fn snapshot(&self, ewma: &Ewma) -> CountersSnapshot {
        CountersSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            commit_groups_formed: self.commit_groups_formed.load(Ordering::Relaxed),
            commit_groups_aborted: self.commit_groups_aborted.load(Ordering::Relaxed),
            fsyncs: self.fsyncs.load(Ordering::Relaxed),
            ewma_queue_depth: ewma.read().0,
            ewma_arrival_rate: ewma.read().1,
            ewma_service_time_ms: ewma.read().2,
        }
    }
}

/// Double-buffered-by-lock EWMA block, written once a second by the
/// sampler thread and read by `getCounters()` callers.
struct TickState {
    last_arrivals: u64,
    last_service_total_ms: u64,
    last_finished: u64,
}

pub struct Ewma {
    inner: RwLock<(f64, f64, f64)>,
    // smoothing factor
    alpha: f64,
    state: Mutex<TickState>,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self {
            inner: RwLock::new((0.0, 0.0, 0.0)),
            alpha,
            state: Mutex::new(TickState { last_arrivals: 0, last_service_total_ms: 0, last_finished: 0 }),
        }
    }

    pub fn read(&self) -> (f64, f64, f64) {
        *self.inner.read().unwrap()
    }

    /// Fold in one sample tick: current queue depth plus the cumulative
    /// arrival count, total service time, and finished-task count observed
    /// since the manager started. Each of the latter three is diffed
    /// against the previous tick to get a per-tick rate/average.
    pub fn tick(&self, queue_depth: f64, cumulative_arrivals: u64, service_time_total_ms: u64, cumulative_finished: u64) {
        let mut state = self.state.lock().unwrap();
        let arrival_rate = cumulative_arrivals.saturating_sub(state.last_arrivals) as f64;
        let finished_delta = cumulative_finished.saturating_sub(state.last_finished);
        let service_delta_ms = service_time_total_ms.saturating_sub(state.last_service_total_ms);
        state.last_arrivals = cumulative_arrivals;
        state.last_service_total_ms = service_time_total_ms;
        state.last_finished = cumulative_finished;
        drop(state);

        let avg_service_ms = if finished_delta > 0 { service_delta_ms as f64 / finished_delta as f64 } else { 0.0 };

        let mut inner = self.inner.write().unwrap();
        inner.0 = ewma(inner.0, queue_depth, self.alpha);
        inner.1 = ewma(inner.1, arrival_rate, self.alpha);
        inner.2 = ewma(inner.2, avg_service_ms, self.alpha);
    }
}

fn ewma(prev: f64, sample: f64, alpha: f64) -> f64 {
    alpha * sample + (1.0 - alpha) * prev
}
