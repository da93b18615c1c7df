//! Read Executor: unlocked, fully concurrent read-only tasks.
//!
//! Reads never touch the lock manager, they run against whatever
//! snapshot their [`IsolationKey::Historical`](crate::task::IsolationKey)
//! revision names, which the resource manager out-of-scope collaborator
//! is responsible for actually resolving. This executor's only job is
//! pool sizing: an unbounded handoff pool by default, "don't preallocate
//! threads you don't need."

use std::sync::mpsc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::counters::Counters;
use crate::config::PoolConfig;
use crate::error::{ManagerError, Result};
use crate::pool::WorkerPool;
use crate::task::{completion_pair, Task, TaskContext, TaskFuture, TaskOutcome};

pub(crate) struct ReadExecutor {
    pool: WorkerPool,
    counters: Arc<Counters>,
}

impl ReadExecutor {
    pub(crate) fn new(config: &PoolConfig, counters: Arc<Counters>) -> Self {
        Self { pool: WorkerPool::new(config), counters }
    }

    pub(crate) fn queue_fill_fraction(&self) -> f64 {
        self.pool.queue_fill_fraction()
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.pool.queue_len()
    }

    pub(crate) fn active_count(&self) -> usize {
        self.pool.active_count()
    }

    pub(crate) fn submit(&self, task: Task) -> TaskFuture {
        let (responder, future) = completion_pair();
        let counters = Arc::clone(&self.counters);
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.pool.submit(move || run(task, responder, counters));
        future
    }

    pub(crate) fn shutdown(&self, timeout: Duration) -> bool {
        self.pool.shutdown(timeout)
    }

    pub(crate) fn shutdown_now(&self) {
        self.pool.shutdown_now();
    }
}

fn run(task: Task, responder: mpsc::SyncSender<Result<TaskOutcome>>, counters: Arc<Counters>) {
    let started = Instant::now();
    let ctx = TaskContext::new(&[], &task.cancelled);
    let result = (task.body)(&ctx);
    counters.record_service_time(started.elapsed());
    match &result {
        Ok(_) => counters.completed.fetch_add(1, Ordering::Relaxed),
        Err(ManagerError::Cancelled) => counters.cancelled.fetch_add(1, Ordering::Relaxed),
        Err(_) => counters.failed.fetch_add(1, Ordering::Relaxed),
    };
    let _ = responder.send(result);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(config: &PoolConfig) -> ReadExecutor {
        ReadExecutor::new(config, Arc::new(Counters::default()))
    }

    #[test]
    fn read_only_task_runs_without_declaring_resources() {
        let exec = fixture(&PoolConfig::handoff(0));
        let task = Task::read_only(42, |ctx| {
            assert!(ctx.resources().is_empty());
            Ok(TaskOutcome::new(vec![42]))
        });
        let outcome = exec.submit(task).wait().unwrap();
        assert_eq!(outcome.payload, vec![42]);
        assert_eq!(exec.counters.completed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn many_reads_run_concurrently() {
        let exec = fixture(&PoolConfig::handoff(0));
        let (tx, rx) = mpsc::channel();
        for i in 0..50 {
            let tx = tx.clone();
            let task = Task::read_only(0, move |_ctx| {
                tx.send(i).unwrap();
                Ok(TaskOutcome::empty())
            });
            exec.submit(task);
        }
        let mut got: Vec<i32> = (0..50).map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap()).collect();
        got.sort();
        assert_eq!(got, (0..50).collect::<Vec<_>>());
        exec.shutdown(Duration::from_secs(1));
    }
}
