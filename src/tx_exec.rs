//! Transaction Executor: the active phase of a read-write transaction.
//!
//! Each transaction gets its own [`LockManager`] scoped to its temp-store
//! indices (lazily created on first use, dropped at commit), reusing the
//! same deadlock-free, total-order acquisition as the live-index lock
//! manager but completely decoupled from it, two transactions never wait
//! on each other here, and a transaction's active phase never waits on
//! unisolated writers. Committing a transaction is a separate step: the
//! caller builds an unisolated write task carrying the transaction's
//! buffered writes plus a validation closure and hands it to
//! [`TransactionExecutor::commit`], which forwards it to the Write
//! Executor so it goes through the normal group-commit path.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::PoolConfig;
use crate::counters::Counters;
use crate::error::ManagerError;
use crate::lock_manager::LockManager;
use crate::pool::WorkerPool;
use crate::task::{completion_pair, IsolationKey, Task, TaskContext, TaskFuture, TxnId};
use crate::write_exec::commit_group::next_sequence;
use crate::write_exec::WriteExecutor;

pub(crate) struct TransactionExecutor {
    pool: WorkerPool,
    write_exec: Arc<WriteExecutor>,
    temp_locks: Mutex<HashMap<TxnId, Arc<LockManager>>>,
    counters: Arc<Counters>,
}

impl TransactionExecutor {
    pub(crate) fn new(config: &PoolConfig, write_exec: Arc<WriteExecutor>, counters: Arc<Counters>) -> Self {
        Self {
            pool: WorkerPool::new(config),
            write_exec,
            temp_locks: Mutex::new(HashMap::new()),
            counters,
        }
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

    fn lock_manager_for(&self, txn: TxnId) -> Arc<LockManager> {
        let mut map = self.temp_locks.lock().unwrap();
        Arc::clone(map.entry(txn).or_insert_with(|| Arc::new(LockManager::new())))
    }

    /// Run one active-phase task of a read-write transaction. Locks only
    /// the temp-store resources this specific task declares, for the
    /// duration of the call, the transaction as a whole does not hold
    /// locks across separate active-phase task submissions.
    pub(crate) fn submit(&self, task: Task) -> TaskFuture {
        let txn = match task.isolation {
            IsolationKey::Transaction(id) => id,
            other => panic!("TransactionExecutor received a non-transaction task: {other:?}"),
        };
        let lock_manager = self.lock_manager_for(txn);
        let (responder, future) = completion_pair();
        let counters = Arc::clone(&self.counters);
        counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.pool.submit(move || {
            let started = Instant::now();
            let owner = next_sequence();
            let cancelled = Arc::clone(&task.cancelled);
            let should_cancel = move || cancelled.load(Ordering::Acquire);

            let guard = match lock_manager.acquire_all(owner, &task.resources, &should_cancel) {
                Ok(guard) => guard,
                Err(e) => {
                    counters.record_service_time(started.elapsed());
                    match &e {
                        ManagerError::Cancelled => counters.cancelled.fetch_add(1, Ordering::Relaxed),
                        _ => counters.failed.fetch_add(1, Ordering::Relaxed),
                    };
                    let _ = responder.send(Err(e));
                    return;
                }
            };
            let ctx = TaskContext::new(guard.resources(), &task.cancelled);
            let result = (task.body)(&ctx);
            drop(guard);
            counters.record_service_time(started.elapsed());
            match &result {
                Ok(_) => counters.completed.fetch_add(1, Ordering::Relaxed),
                Err(ManagerError::Cancelled) => counters.cancelled.fetch_add(1, Ordering::Relaxed),
                Err(_) => counters.failed.fetch_add(1, Ordering::Relaxed),
            };
            let _ = responder.send(result);
        });
        future
    }

    /// Commit a transaction: drop its temp-store lock manager (no further
    /// active-phase tasks may run against it) and forward `commit_task`,
    /// an unisolated write task carrying the buffered writes and a
    /// validation closure, to the Write Executor's group-commit path.
    pub(crate) fn commit(&self, txn: TxnId, commit_task: Task) -> TaskFuture {
        self.temp_locks.lock().unwrap().remove(&txn);
        self.write_exec.submit(commit_task)
    }

    pub(crate) fn shutdown(&self, timeout: Duration) -> bool {
        self.pool.shutdown(timeout)
    }

    pub(crate) fn shutdown_now(&self) {
        self.pool.shutdown_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::Counters;
    use crate::error::ManagerError;
    use crate::journal::FileJournal;
    use crate::task::TaskOutcome;
    use crate::config::Config;

    fn write_exec_fixture() -> Arc<WriteExecutor> {
        let (journal, _path) = FileJournal::create_temp().unwrap();
        WriteExecutor::new(&Config::default(), Arc::new(journal), Arc::new(Counters::default()))
    }

    fn tx_exec_fixture(write_exec: Arc<WriteExecutor>) -> TransactionExecutor {
        TransactionExecutor::new(&PoolConfig::handoff(0), write_exec, Arc::new(Counters::default()))
    }

    #[test]
    fn active_phase_tasks_lock_only_their_own_temp_store_resources() {
        let write_exec = write_exec_fixture();
        let tx_exec = tx_exec_fixture(write_exec);

        let task = Task::read_write_tx(1, vec!["tmp-a".into()], |ctx| {
            assert_eq!(ctx.resources().len(), 1);
            Ok(TaskOutcome::new(vec![9]))
        });
        let outcome = tx_exec.submit(task).wait().unwrap();
        assert_eq!(outcome.payload, vec![9]);
    }

    #[test]
    fn two_transactions_never_block_each_other() {
        let write_exec = write_exec_fixture();
        let tx_exec = Arc::new(tx_exec_fixture(write_exec));

        let t1 = Task::read_write_tx(1, vec!["tmp-a".into()], |_ctx| {
            std::thread::sleep(Duration::from_millis(30));
            Ok(TaskOutcome::empty())
        });
        let t2 = Task::read_write_tx(2, vec!["tmp-a".into()], |_ctx| Ok(TaskOutcome::empty()));

        let start = std::time::Instant::now();
        let f1 = tx_exec.submit(t1);
        let f2 = tx_exec.submit(t2);
        f2.wait().unwrap();
        f1.wait().unwrap();
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn commit_forwards_to_write_executor_and_drops_temp_locks() {
        let write_exec = write_exec_fixture();
        let tx_exec = tx_exec_fixture(write_exec);

        let active = Task::read_write_tx(5, vec!["tmp-a".into()], |_ctx| Ok(TaskOutcome::empty()));
        tx_exec.submit(active).wait().unwrap();

        assert!(tx_exec.temp_locks.lock().unwrap().contains_key(&5));

        let commit_task = Task::unisolated_write(vec!["idx-a".into()], |_ctx| Ok(TaskOutcome::new(vec![1])))
            .with_validation(|| Ok(()));
        let outcome = tx_exec.commit(5, commit_task).wait().unwrap();
        assert_eq!(outcome.payload, vec![1]);
        assert!(!tx_exec.temp_locks.lock().unwrap().contains_key(&5));
    }

    #[test]
    fn validation_failure_surfaces_as_validation_error() {
        let write_exec = write_exec_fixture();
        let tx_exec = tx_exec_fixture(write_exec);

        let commit_task = Task::unisolated_write(vec!["idx-a".into()], |_ctx| Ok(TaskOutcome::empty()))
            .with_validation(|| Err(ManagerError::ValidationError("conflict".into())));
        let result = tx_exec.commit(9, commit_task).wait();
        assert!(matches!(result, Err(ManagerError::ValidationError(_))));
    }
}
