//! Write Executor: the bounded-growth pool, lock manager, and group-commit
//! orchestration for unisolated writes and validated transaction commits.
//!
//! A worker thread runs a task's body under its full, pre-declared lock
//! set, then joins the current forming [`commit_group::CommitGroup`]
//! instead of calling the journal itself. Exactly one thread per group
//! performs the durable commit, releasing every member's locks and
//! completing every member's future once it returns.

pub(crate) mod commit_group;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::config::Config;
use crate::counters::Counters;
use crate::error::{ManagerError, Result};
use crate::journal::Journal;
use crate::lock_manager::LockManager;
use crate::pool::WorkerPool;
use crate::task::{completion_pair, IsolationKey, Task, TaskContext, TaskFuture};

use commit_group::{next_sequence, CommitGroup, PendingMember};

pub(crate) struct WriteExecutor {
    pool: WorkerPool,
    lock_manager: Arc<LockManager>,
    journal: Arc<dyn Journal>,
    current_group: Mutex<Arc<CommitGroup>>,
    /// Workers that have acquired their locks and are running their task
    /// body, or are about to join the current forming group. The group's
    /// "running worker count drops to zero" trigger is this hitting zero.
    executing: AtomicUsize,
    group_commit_timeout: Duration,
    group_commit_jitter: f64,
    counters: Arc<Counters>,
}

impl WriteExecutor {
    pub(crate) fn new(config: &Config, journal: Arc<dyn Journal>, counters: Arc<Counters>) -> Arc<Self> {
        Arc::new(Self {
            pool: WorkerPool::new(&config.write_pool()),
            lock_manager: Arc::new(LockManager::new()),
            journal,
            current_group: Mutex::new(Arc::new(CommitGroup::new())),
            executing: AtomicUsize::new(0),
            group_commit_timeout: config.group_commit_timeout,
            group_commit_jitter: config.group_commit_jitter,
            counters,
        })
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

    /// Admit a write task. Submission itself cannot fail here (backpressure
    /// and readiness are the Task Router's job), this always enqueues and
    /// returns a future.
    pub(crate) fn submit(self: &Arc<Self>, task: Task) -> TaskFuture {
        let (responder, future) = completion_pair();
        let exec = Arc::clone(self);
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.pool.submit(move || exec.run(task, responder));
        future
    }

    pub(crate) fn shutdown(&self, timeout: Duration) -> bool {
        self.pool.shutdown(timeout)
    }

    pub(crate) fn shutdown_now(&self) {
        self.pool.shutdown_now();
    }

    fn run(self: Arc<Self>, task: Task, responder: mpsc::SyncSender<Result<crate::task::TaskOutcome>>) {
        let started = Instant::now();
        self.executing.fetch_add(1, Ordering::AcqRel);

        let owner = next_sequence();
        let cancelled = Arc::clone(&task.cancelled);
        let should_cancel = move || cancelled.load(Ordering::Acquire);

        let guard = match self.lock_manager.acquire_all(owner, &task.resources, &should_cancel) {
            Ok(guard) => guard,
            Err(e) => {
                self.executing.fetch_sub(1, Ordering::AcqRel);
                self.counters.record_service_time(started.elapsed());
                self.bill_failure(&e);
                let _ = responder.send(Err(e));
                return;
            }
        };

        let ctx = TaskContext::new(guard.resources(), &task.cancelled);
        let body_result = (task.body)(&ctx);

        match body_result {
            Ok(outcome) => {
                let txn_id = match task.isolation {
                    IsolationKey::Transaction(id) => Some(id),
                    _ => None,
                };
                let member = PendingMember {
                    sequence: owner,
                    txn_id,
                    resources: guard.resources().to_vec(),
                    outcome,
                    validate: task.validate,
                    responder,
                    _locks: guard,
                };
                self.counters.record_service_time(started.elapsed());
                self.join_group(member);
            }
            Err(e) => {
                drop(guard);
                self.executing.fetch_sub(1, Ordering::AcqRel);
                self.counters.record_service_time(started.elapsed());
                let corrupts_index = matches!(e, ManagerError::IndexCorrupted(_));
                self.bill_failure(&e);
                let _ = responder.send(Err(e));
                if corrupts_index {
                    self.abort_current_group();
                }
            }
        }
    }

    fn bill_failure(&self, e: &ManagerError) {
        match e {
            ManagerError::Cancelled => self.counters.cancelled.fetch_add(1, Ordering::Relaxed),
            _ => self.counters.failed.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn join_group(self: Arc<Self>, mut member: PendingMember) {
        loop {
            let group = Arc::clone(&self.current_group.lock().unwrap());
            match group.add_member(member) {
                Ok(count) => {
                    self.executing.fetch_sub(1, Ordering::AcqRel);
                    if count == 1 {
                        self.start_group_timer(Arc::clone(&group));
                    }
                    if self.group_commit_timeout.is_zero() || self.executing.load(Ordering::Acquire) == 0 {
                        self.try_commit_group(group);
                    }
                    return;
                }
                Err(returned) => {
                    // The group we read left FORMING between our read and
                    // our push (another member's trigger fired the commit
                    // first). Retry against whatever group is current now.
                    member = returned;
                    continue;
                }
            }
        }
    }

    fn start_group_timer(self: &Arc<Self>, group: Arc<CommitGroup>) {
        if self.group_commit_timeout.is_zero() {
            return;
        }
        let exec = Arc::clone(self);
        let timeout = jittered(self.group_commit_timeout, self.group_commit_jitter);
        thread::spawn(move || {
            thread::sleep(timeout);
            exec.try_commit_group(group);
        });
    }

    /// Drive the FORMING -> COMMITTING transition for `group`, if nobody
    /// else has already done so. A fresh group is swapped in for new
    /// joiners before the (possibly slow) journal call runs.
    fn try_commit_group(self: &Arc<Self>, group: Arc<CommitGroup>) {
        if !group.try_begin_commit() {
            return;
        }
        {
            let mut current = self.current_group.lock().unwrap();
            if Arc::ptr_eq(&*current, &group) {
                *current = Arc::new(CommitGroup::new());
            }
        }

        let members = group.take_members();
        if members.is_empty() {
            group.finish(true);
            return;
        }

        // Validation is per-member and exclusionary: a failed validator
        // fails only its own task with ValidationError. The rest of the
        // batch (including any unisolated writes that joined the same
        // group) still commits, see DESIGN.md for why this reading wins
        // over a literal "whole group fails" interpretation.
        let mut to_commit = Vec::with_capacity(members.len());
        for mut member in members {
            if let Some(validate) = member.validate.take() {
                if let Err(e) = validate() {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    let _ = member.responder.send(Err(e));
                    continue;
                }
            }
            to_commit.push(member);
        }

        if to_commit.is_empty() {
            group.finish(false);
            return;
        }

        let batch: Vec<_> = to_commit.iter().map(PendingMember::journal_record).collect();
        debug!("committing group of {} member(s)", batch.len());
        match self.journal.commit(&batch) {
            Ok(()) => {
                group.finish(true);
                self.counters.commit_groups_formed.fetch_add(1, Ordering::Relaxed);
                self.counters.fsyncs.fetch_add(1, Ordering::Relaxed);
                for member in to_commit {
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                    let _ = member.responder.send(Ok(member.outcome));
                }
            }
            Err(e) => {
                warn!("group commit failed, aborting {} member(s): {e}", to_commit.len());
                group.finish(false);
                self.counters.commit_groups_aborted.fetch_add(1, Ordering::Relaxed);
                for member in to_commit {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    let _ = member.responder.send(Err(ManagerError::CommitFailed(e.to_string())));
                }
            }
        }
    }

    /// A task body that reports the live index as corrupted aborts
    /// whichever group is currently forming, failing every member already
    /// in it with `CommitFailed`, even though the reporting task itself
    /// never joined that group.
    fn abort_current_group(self: &Arc<Self>) {
        let group = Arc::clone(&self.current_group.lock().unwrap());
        let Some(members) = group.abort_if_forming() else {
            return;
        };
        warn!("aborting forming commit group of {} member(s) after an index-corruption error", members.len());
        {
            let mut current = self.current_group.lock().unwrap();
            if Arc::ptr_eq(&*current, &group) {
                *current = Arc::new(CommitGroup::new());
            }
        }
        self.counters.commit_groups_aborted.fetch_add(1, Ordering::Relaxed);
        for member in members {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            let _ = member
                .responder
                .send(Err(ManagerError::CommitFailed("group aborted: live index reported corrupted state".into())));
        }
    }
}

/// Apply +/-`fraction` jitter to `base`. The group commit timer is logical,
/// not wall-clock precise, so a little jitter is fine.
fn jittered(base: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 {
        return base;
    }
    let spread = (rand::random::<f64>() * 2.0 - 1.0) * fraction;
    let factor = (1.0 + spread).max(0.0);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::FileJournal;
    use crate::task::TaskOutcome;
    use std::sync::mpsc as std_mpsc;

    fn test_executor(config: &Config) -> (Arc<WriteExecutor>, Arc<FileJournal>) {
        let (journal, _path) = FileJournal::create_temp().unwrap();
        let journal = Arc::new(journal);
        let counters = Arc::new(Counters::default());
        let exec = WriteExecutor::new(config, journal.clone(), counters);
        (exec, journal)
    }

    #[test]
    fn single_task_commits_and_syncs_once() {
        let (exec, journal) = test_executor(&Config::default());
        let task = Task::unisolated_write(vec!["idx-a".into()], |_ctx| Ok(TaskOutcome::new(vec![1])));
        let fut = exec.submit(task);
        let outcome = fut.wait().unwrap();
        assert_eq!(outcome.payload, vec![1]);
        assert_eq!(journal.fsync_count(), 1);
    }

    #[test]
    fn concurrent_writers_on_disjoint_resources_coalesce_into_one_fsync() {
        let (exec, journal) = test_executor(&Config::default());
        let (tx, rx) = std_mpsc::channel();
        for i in 0..20u32 {
            let exec = Arc::clone(&exec);
            let tx = tx.clone();
            let resource = format!("idx-{i}");
            thread::spawn(move || {
                let task = Task::unisolated_write(vec![resource.into()], move |_ctx| Ok(TaskOutcome::empty()));
                let fut = exec.submit(task);
                tx.send(fut.wait()).unwrap();
            });
        }
        for _ in 0..20 {
            rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        }
        assert!(
            journal.fsync_count() < 20,
            "expected group commit to coalesce fsyncs, got {}",
            journal.fsync_count()
        );
    }

    #[test]
    fn no_grouping_config_syncs_once_per_task() {
        let (exec, journal) = test_executor(&Config::no_grouping());
        for i in 0..5u32 {
            let resource = format!("idx-{i}");
            let task = Task::unisolated_write(vec![resource.into()], |_ctx| Ok(TaskOutcome::empty()));
            exec.submit(task).wait().unwrap();
        }
        assert_eq!(journal.fsync_count(), 5);
    }

    #[test]
    fn validation_failure_fails_only_its_own_task() {
        let (exec, _journal) = test_executor(&Config::default());

        // Hold the unisolated write until the tx-commit task has had time
        // to join the same forming group, so both land in one commit.
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        let exec_u = Arc::clone(&exec);
        let u_handle = thread::spawn(move || {
            let task = Task::unisolated_write(vec!["idx-u".into()], move |_ctx| {
                let _ = release_rx.recv_timeout(Duration::from_millis(200));
                Ok(TaskOutcome::empty())
            });
            exec_u.submit(task).wait()
        });

        thread::sleep(Duration::from_millis(20));
        let tx_task = Task::read_write_tx(1, vec!["idx-t".into()], |_ctx| Ok(TaskOutcome::empty()))
            .with_validation(|| Err(ManagerError::ValidationError("stale snapshot".into())));
        let tx_future = exec.submit(tx_task);

        let _ = release_tx.send(());
        let tx_result = tx_future.wait();
        let u_result = u_handle.join().unwrap();

        assert!(matches!(tx_result, Err(ManagerError::ValidationError(_))));
        assert!(u_result.is_ok(), "unisolated writer in the same group should still commit");
    }

    #[test]
    fn corrupted_index_error_aborts_the_forming_group() {
        let (exec, _journal) = test_executor(&Config::default());

        // The corrupting task stays "executing" a little longer than the
        // ok task needs to finish and join, so the ok task is sitting in
        // the forming group (not yet immediately self-committed, since
        // the corrupting task is still running) when the abort happens.
        let exec_bad = Arc::clone(&exec);
        let bad_handle = thread::spawn(move || {
            let task = Task::unisolated_write(vec!["idx-bad".into()], |_ctx| {
                thread::sleep(Duration::from_millis(40));
                Err(ManagerError::IndexCorrupted("live index corrupted".into()))
            });
            exec_bad.submit(task).wait()
        });

        thread::sleep(Duration::from_millis(10));
        let ok_task = Task::unisolated_write(vec!["idx-ok".into()], |_ctx| Ok(TaskOutcome::empty()));
        let ok_result = exec.submit(ok_task).wait();
        let bad_result = bad_handle.join().unwrap();

        assert!(matches!(bad_result, Err(ManagerError::IndexCorrupted(_))));
        assert!(matches!(ok_result, Err(ManagerError::CommitFailed(_))));
    }
}
