//! Concurrency manager for a journaled, named-index storage engine.
//!
//! The manager schedules three kinds of work against a shared set of
//! named indices:
//!
//! - read-only tasks, pinned to a historical revision, never locking;
//! - the active phase of read-write transactions, isolated to a
//!   per-transaction temp-store lock manager;
//! - unisolated writes against the live indices, serialized through a
//!   deadlock-free lock manager and committed in coalesced groups to
//!   amortize the cost of a durability barrier across concurrently
//!   finishing writers.
//!
//! [`Task`] is the unit of submission; [`ConcurrencyManager::submit`]
//! classifies, admits, and dispatches it, returning a [`TaskFuture`] the
//! caller blocks on for the result. The underlying storage/index engine
//! and transaction manager are out of scope, this crate talks to them
//! only through the [`ResourceManager`] and [`Journal`] collaborator
//! traits.

pub mod config;
pub mod counters;
pub mod error;
pub mod journal;
pub mod resource_manager;
pub mod task;

mod lifecycle;
mod lock_manager;
mod pool;
mod read_exec;
mod router;
mod tx_exec;
mod write_exec;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::Config;
use crate::counters::{Counters, CountersSnapshot, Ewma};
use crate::error::Result;
use crate::journal::Journal;
use crate::lifecycle::Lifecycle;
use crate::read_exec::ReadExecutor;
use crate::resource_manager::ResourceManager;
use crate::router::TaskRouter;
use crate::task::{Task, TaskFuture, TxnId};
use crate::tx_exec::TransactionExecutor;
use crate::write_exec::WriteExecutor;

/// The smoothing factor for the optional queue-statistics sampler's EWMAs.
const SAMPLER_ALPHA: f64 = 0.3;

/// The top-level concurrency manager: owns the three executor pools, the
/// lock manager each write goes through, the lifecycle/admission gate,
/// and the telemetry counters.
pub struct ConcurrencyManager {
    config: Config,
    lifecycle: Arc<Lifecycle>,
    router: TaskRouter,
    read_exec: Arc<ReadExecutor>,
    tx_exec: Arc<TransactionExecutor>,
    write_exec: Arc<WriteExecutor>,
    counters: Arc<Counters>,
    ewma: Arc<Ewma>,
}

impl ConcurrencyManager {
    /// Build a manager from `config`, wired to the given out-of-scope
    /// collaborators. Pools are constructed (and, if configured,
    /// prestarted) immediately; the manager is `Open` and admitting from
    /// the moment this returns.
    pub fn new(config: Config, resource_manager: Arc<dyn ResourceManager>, journal: Arc<dyn Journal>) -> Self {
        let lifecycle = Arc::new(Lifecycle::new());
        let counters = Arc::new(Counters::default());
        let ewma = Arc::new(Ewma::new(SAMPLER_ALPHA));

        let read_exec = Arc::new(ReadExecutor::new(&config.read_pool, Arc::clone(&counters)));
        let write_exec = WriteExecutor::new(&config, Arc::clone(&journal), Arc::clone(&counters));
        let tx_exec = Arc::new(TransactionExecutor::new(&config.tx_pool, Arc::clone(&write_exec), Arc::clone(&counters)));

        let router = TaskRouter::new(
            resource_manager,
            Arc::clone(&lifecycle),
            Arc::clone(&read_exec),
            Arc::clone(&tx_exec),
            Arc::clone(&write_exec),
            config.backpressure.clone(),
            config.readiness_timeout,
            Arc::clone(&counters),
        );

        if config.collect_queue_statistics {
            let counters = Arc::clone(&counters);
            let ewma = Arc::clone(&ewma);
            let read_exec = Arc::clone(&read_exec);
            let tx_exec = Arc::clone(&tx_exec);
            let write_exec = Arc::clone(&write_exec);
            lifecycle.start_sampler(move || {
                let queue_depth = (read_exec.queue_len() + tx_exec.queue_len() + write_exec.queue_len()) as f64;
                let arrivals = counters.submitted.load(Ordering::Relaxed);
                let service_total_ms = counters.service_time_total_ms.load(Ordering::Relaxed);
                let finished = counters.finished.load(Ordering::Relaxed);
                ewma.tick(queue_depth, arrivals, service_total_ms, finished);
            });
        }

        Self {
            config,
            lifecycle,
            router,
            read_exec,
            tx_exec,
            write_exec,
            counters,
            ewma,
        }
    }

    /// Submit one task. Fails fast with `Rejected` if the manager isn't
    /// open or the resource manager never reports ready; otherwise
    /// dispatches to the executor matching the task's classification and
    /// returns a future for its outcome.
    pub fn submit(&self, task: Task) -> Result<TaskFuture> {
        self.router.submit(task)
    }

    /// Submit a batch of tasks, one result per task, in order.
    pub fn submit_all(&self, tasks: Vec<Task>) -> Vec<Result<TaskFuture>> {
        self.router.submit_all(tasks)
    }

    /// Submit a batch of tasks and wait up to `timeout` for all of them
    /// to finish. Tasks still running when the shared deadline passes
    /// are cancelled; the result vector has one entry per input task.
    pub fn submit_all_timeout(&self, tasks: Vec<Task>, timeout: Duration) -> Vec<Result<crate::task::TaskOutcome>> {
        self.router.submit_all_timeout(tasks, timeout)
    }

    /// Submit a transaction's commit request. `commit_task` must be built
    /// with [`Task::unisolated_write`], carrying the transaction's
    /// write-set resources and (usually) a validation closure attached
    /// via [`Task::with_validation`]; dropping the transaction's
    /// temp-store lock manager and handing the task to the Write
    /// Executor's group-commit path is exactly what this does, unlike
    /// `submit`, which would send a `read-write-tx`-classified task to
    /// the Transaction Executor's active phase instead.
    pub fn commit_transaction(&self, txn: TxnId, commit_task: Task) -> Result<TaskFuture> {
        self.router.commit_transaction(txn, commit_task)
    }

    pub fn is_open(&self) -> bool {
        self.lifecycle.is_admitting()
    }

    /// A point-in-time snapshot of the manager's atomic counters and
    /// (if `collectQueueStatistics` is enabled) its sampler's EWMAs.
    pub fn get_counters(&self) -> CountersSnapshot {
        self.counters.snapshot(&self.ewma)
    }

    /// Orderly shutdown: stop admitting, then drain the transaction,
    /// read, and write pools in that order (so transaction commits
    /// already forwarded to the write pool still get a chance to join
    /// and commit), each bounded by whatever remains of
    /// `shutdownTimeout`. Logs a warning per pool that doesn't drain in
    /// time; does not forcibly stop anything on its own.
    pub fn shutdown(&self) {
        info!("beginning orderly shutdown");
        self.lifecycle.begin_draining();
        self.lifecycle.stop_sampler();

        let deadline = if self.config.shutdown_timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + self.config.shutdown_timeout)
        };

        self.drain("transaction", deadline, |timeout| self.tx_exec.shutdown(timeout));
        self.drain("read", deadline, |timeout| self.read_exec.shutdown(timeout));
        self.drain("write", deadline, |timeout| self.write_exec.shutdown(timeout));

        self.lifecycle.close();
        info!("shutdown complete");
    }

    /// Immediate shutdown: drop whatever is queued in all three pools and
    /// stop workers as soon as their current job finishes. Does not wait
    /// for commit groups to form or drain.
    pub fn shutdown_now(&self) {
        info!("beginning immediate shutdown");
        self.lifecycle.begin_draining();
        self.lifecycle.stop_sampler();
        self.tx_exec.shutdown_now();
        self.read_exec.shutdown_now();
        self.write_exec.shutdown_now();
        self.lifecycle.close();
        info!("shutdown complete");
    }

    fn drain(&self, name: &str, deadline: Option<Instant>, shutdown: impl FnOnce(Duration) -> bool) {
        let timeout = match deadline {
            None => Duration::ZERO,
            Some(d) => match d.saturating_duration_since(Instant::now()) {
                zero if zero.is_zero() => Duration::from_millis(1),
                remaining => remaining,
            },
        };
        if !shutdown(timeout) {
            warn!("{name} pool did not drain within the shutdown budget");
        }
    }
}
