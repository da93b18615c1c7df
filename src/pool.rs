//! Generic worker pool: `core`/`max` resident threads, a keep-alive for
//! idle culling beyond `core`, and a pluggable queue shape.
//!
//! Generalizes the dedicated-`std::thread`-draining-an-`mpsc`-channel
//! pattern (see `engines/granite/wal.rs::granite_worker_thread`) into a
//! pool that can grow and shrink between `core` and `max` workers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::debug;

use crate::config::{PoolConfig, QueueKind};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    jobs: Mutex<VecDeque<Job>>,
    not_empty: Condvar,
    /// Signaled whenever a job is popped, so a `push` blocked on a full
    /// bounded queue wakes up to recheck its capacity.
    not_full: Condvar,
    capacity: Option<usize>,
    closed: AtomicBool,
}

impl Queue {
    fn new(kind: QueueKind) -> Self {
        let capacity = match kind {
            QueueKind::Handoff => Some(0),
            QueueKind::Bounded(n) => Some(n),
            QueueKind::Unbounded => None,
        };
        Self {
            jobs: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Current fill fraction, for the router's backpressure decision.
    /// Unbounded/handoff queues report 0.0 (never saturated).
    fn fill_fraction(&self) -> f64 {
        match self.capacity {
            Some(0) | None => 0.0,
            Some(cap) => {
                let len = self.jobs.lock().unwrap().len();
                len as f64 / cap as f64
            }
        }
    }

    fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    /// Push a job, blocking the submitter while a genuinely bounded queue
    /// (`capacity` > 0) is at its limit. This is the hard cap the router's
    /// fill-fraction backpressure only approximates: it holds regardless
    /// of how many producers race past that soft check, and regardless of
    /// whether backpressure is enabled at all. Handoff (`capacity ==
    /// Some(0)`) and unbounded queues never block here.
    fn push(&self, job: Job) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(cap) = self.capacity {
            if cap > 0 {
                while jobs.len() >= cap && !self.closed.load(Ordering::Acquire) {
                    jobs = self.not_full.wait(jobs).unwrap();
                }
            }
        }
        jobs.push_back(job);
        self.not_empty.notify_one();
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<Job> {
        let mut jobs = self.jobs.lock().unwrap();
        loop {
            if let Some(job) = jobs.pop_front() {
                self.not_full.notify_one();
                return Some(job);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            let (guard, result) = self.not_empty.wait_timeout(jobs, timeout).unwrap();
            jobs = guard;
            if result.timed_out() && jobs.is_empty() {
                return None;
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

/// A pool of OS threads whose population tracks `core_pool_size..=
/// max_pool_size`, shrinking idle workers beyond core after `keep_alive`.
pub struct WorkerPool {
    queue: Arc<Queue>,
    active: Arc<AtomicUsize>,
    idle: Arc<AtomicUsize>,
    core: usize,
    max: usize,
    keep_alive: Duration,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(config: &PoolConfig) -> Self {
        let pool = Self {
            queue: Arc::new(Queue::new(config.queue)),
            active: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(AtomicUsize::new(0)),
            core: config.core_pool_size,
            max: config.max_pool_size.max(config.core_pool_size).max(1),
            keep_alive: config.keep_alive,
            handles: Mutex::new(Vec::new()),
        };
        if config.prestart_core_threads {
            for _ in 0..pool.core {
                pool.spawn_worker();
            }
        }
        pool
    }

    /// Current queue fill fraction (0.0 for handoff/unbounded queues),
    /// used by the router's backpressure check.
    pub fn queue_fill_fraction(&self) -> f64 {
        self.queue.fill_fraction()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Submit a job. Ensures at least one worker will pick it up: grows
    /// the pool (up to `max`) if every current worker is busy, i.e. none
    /// is idle waiting on the queue. Checked before the push, since a
    /// worker that is about to wake up for this job is idle right up
    /// until it does.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let active = self.active_count();
        let idle = self.idle.load(Ordering::Acquire);
        self.queue.push(Box::new(job));
        if active < self.core {
            self.spawn_worker();
        } else if active < self.max && idle == 0 {
            self.spawn_worker();
        }
    }

    fn spawn_worker(&self) {
        let queue = Arc::clone(&self.queue);
        let active = Arc::clone(&self.active);
        let idle = Arc::clone(&self.idle);
        let core = self.core;
        let keep_alive = self.keep_alive;
        let count = active.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("spawning worker {count} (core {core})");
        let handle = thread::spawn(move || {
            loop {
                let wait = if keep_alive.is_zero() { Duration::from_secs(3600) } else { keep_alive };
                idle.fetch_add(1, Ordering::AcqRel);
                let popped = queue.pop_timeout(wait);
                idle.fetch_sub(1, Ordering::AcqRel);
                match popped {
                    Some(job) => job(),
                    None => {
                        // Timed out with nothing queued. Exit if we're
                        // above core strength; otherwise keep waiting.
                        if active.load(Ordering::Acquire) > core {
                            break;
                        }
                        if queue.closed.load(Ordering::Acquire) {
                            break;
                        }
                    }
                }
            }
            let remaining = active.fetch_sub(1, Ordering::AcqRel) - 1;
            debug!("worker exiting, {remaining} remaining");
        });
        self.handles.lock().unwrap().push(handle);
    }

    /// Orderly shutdown: stop accepting new pushes, let queued jobs drain,
    /// wait up to `timeout` (zero means wait forever). Returns `true` if
    /// every worker terminated before the deadline.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.queue.close();
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();

        // std::thread::JoinHandle has no join-with-timeout, so hand the
        // joins to a helper thread and wait on it through a channel,
        // the same rendezvous-via-channel idiom used elsewhere in this
        // crate for responder handshakes.
        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            for handle in handles {
                let _ = handle.join();
            }
            let _ = tx.send(());
        });

        if timeout.is_zero() {
            rx.recv().is_ok()
        } else {
            rx.recv_timeout(timeout).is_ok()
        }
    }

    /// Immediate shutdown: drop whatever is queued and signal workers to
    /// stop as soon as they finish their current job.
    pub fn shutdown_now(&self) {
        {
            let mut jobs = self.queue.jobs.lock().unwrap();
            jobs.clear();
        }
        self.queue.close();
        let mut handles = self.handles.lock().unwrap();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}
