//! The unit of scheduling: [`Task`], its classification, and the handle a
//! caller gets back from `submit`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{ManagerError, Result};

/// A historical revision number, read-only tasks pin themselves to.
pub type Revision = u64;
/// A transaction identifier, minted by the (external) transaction manager.
pub type TxnId = u64;

/// How a task was classified at admission. Final once set, a task never
/// changes classification after `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Historical or read-committed read. No locking, fully concurrent.
    ReadOnly,
    /// The active phase of a read-write transaction: reads a snapshot,
    /// buffers writes into per-transaction temp-store indices.
    ReadWriteTx,
    /// Direct, unisolated write against a live mutable index.
    UnisolatedWrite,
}

/// The timestamp/isolation key a task carries, whose meaning depends on
/// its classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationKey {
    /// For read-only tasks: the historical revision to read.
    Historical(Revision),
    /// For tx-isolated tasks: the owning transaction's id.
    Transaction(TxnId),
    /// For unisolated writes: the symbolic "current" marker.
    Current,
}

/// A string-keyed handle to a live index or index partition. Cheaply
/// cloneable (backed by `Arc<str>`) and totally ordered so a task's
/// declared resource set can be sorted into the lock manager's canonical
/// acquisition order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NamedResource(Arc<str>);

impl NamedResource {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NamedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NamedResource {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for NamedResource {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// What a task body produces on success. Opaque payload plus whatever
/// bookkeeping the caller wants back; the manager never inspects it.
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub payload: Vec<u8>,
}

impl TaskOutcome {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }
}

/// What a task body sees while it runs. For unisolated and tx-isolated
/// tasks, every resource named here is already lock-held for the duration
/// of the call.
pub struct TaskContext<'a> {
    resources: &'a [NamedResource],
    cancelled: &'a AtomicBool,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(resources: &'a [NamedResource], cancelled: &'a AtomicBool) -> Self {
        Self { resources, cancelled }
    }

    /// The resources this task declared (and, if unisolated/tx-isolated,
    /// currently holds locks on).
    pub fn resources(&self) -> &[NamedResource] {
        self.resources
    }

    /// Long-running task bodies should poll this and return early with
    /// `Err(ManagerError::Cancelled)` if it becomes true.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A task's body: runs under the held lock set (if any), sees a
/// [`TaskContext`], and produces a [`TaskOutcome`] or a [`ManagerError`].
pub type TaskBody = Box<dyn FnOnce(&TaskContext) -> Result<TaskOutcome> + Send + 'static>;

/// Run by the commit-group's single committer thread, before the durable
/// commit, only for tasks submitted as transaction-commit requests. A
/// `Err` here fails the task with `ValidationError` and aborts the whole
/// group (validation is part of the single commit call).
pub type Validate = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// A unit of work submitted to the manager.
pub struct Task {
    pub(crate) classification: Classification,
    pub(crate) isolation: IsolationKey,
    pub(crate) resources: Vec<NamedResource>,
    pub(crate) submitted_at: Option<Instant>,
    pub(crate) body: TaskBody,
    pub(crate) validate: Option<Validate>,
    pub(crate) cancelled: Arc<AtomicBool>,
}

impl Task {
    /// Build a historical (or read-committed) read. No resources need be
    /// declared: reads never lock.
    pub fn read_only(
        isolation: Revision,
        body: impl FnOnce(&TaskContext) -> Result<TaskOutcome> + Send + 'static,
    ) -> Self {
        Self {
            classification: Classification::ReadOnly,
            isolation: IsolationKey::Historical(isolation),
            resources: Vec::new(),
            submitted_at: None,
            body: Box::new(body),
            validate: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build a task for the active phase of a read-write transaction.
    /// `resources` is advisory: only temp-store indices this task
    /// actually touches need be named, for per-transaction locking.
    pub fn read_write_tx(
        txn: TxnId,
        resources: Vec<NamedResource>,
        body: impl FnOnce(&TaskContext) -> Result<TaskOutcome> + Send + 'static,
    ) -> Self {
        Self {
            classification: Classification::ReadWriteTx,
            isolation: IsolationKey::Transaction(txn),
            resources,
            submitted_at: None,
            body: Box::new(body),
            validate: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build an unisolated write task. `resources` is required and final:
    /// every named live index this task will touch must be declared here.
    pub fn unisolated_write(
        resources: Vec<NamedResource>,
        body: impl FnOnce(&TaskContext) -> Result<TaskOutcome> + Send + 'static,
    ) -> Self {
        Self {
            classification: Classification::UnisolatedWrite,
            isolation: IsolationKey::Current,
            resources,
            submitted_at: None,
            body: Box::new(body),
            validate: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach a validation closure, run by the commit group's committer
    /// immediately before the durable commit. Used by the Transaction
    /// Executor when it submits a transaction's commit as an unisolated
    /// write task.
    pub fn with_validation(mut self, validate: impl FnOnce() -> Result<()> + Send + 'static) -> Self {
        self.validate = Some(Box::new(validate));
        self
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    pub fn resources(&self) -> &[NamedResource] {
        &self.resources
    }

    /// A handle callers can use to cancel this task before it starts
    /// (or poll for cancellation during execution, via `TaskContext`).
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancelled))
    }

    /// Stamp this task's admission time. Called exactly once, by the Task
    /// Router, at the top of `submit`/`commit_transaction` (after the
    /// closed check, before the readiness wait), per `spec.md` §4.A step 2
    /// and §3's "submission nanosecond timestamp (set at admission)".
    pub(crate) fn mark_submitted(&mut self) {
        self.submitted_at = Some(Instant::now());
    }

    /// When this task was admitted, `None` until the router has processed
    /// it at least as far as the closed check.
    pub fn submitted_at(&self) -> Option<Instant> {
        self.submitted_at
    }
}

/// A handle to request cancellation of a submitted task. Has no effect
/// once the task has finished execution and joined a commit group: a
/// member already sitting in a forming group is no longer cancellable,
/// only a future abort of the whole group can undo it.
#[derive(Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The completion handle returned from `submit`. Modeled as a blocking
/// handle over an `mpsc::SyncSender` responder rather than an async
/// future, since every executor in this crate is a plain OS-thread pool.
pub struct TaskFuture {
    rx: mpsc::Receiver<Result<TaskOutcome>>,
}

impl TaskFuture {
    pub(crate) fn new(rx: mpsc::Receiver<Result<TaskOutcome>>) -> Self {
        Self { rx }
    }

    /// Block until the task completes, returning its outcome or error.
    pub fn wait(self) -> Result<TaskOutcome> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(ManagerError::Interrupted))
    }

    /// Block up to `timeout`. On timeout, returns `Err` with the future
    /// handed back so the caller can keep waiting or drop (cancel) it.
    pub fn wait_timeout(self, timeout: Duration) -> std::result::Result<Result<TaskOutcome>, TaskFuture> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Ok(result),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(self),
            Err(mpsc::RecvTimeoutError::Disconnected) => Ok(Err(ManagerError::Interrupted)),
        }
    }

    /// Non-blocking poll.
    pub fn try_wait(&self) -> Option<Result<TaskOutcome>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(Err(ManagerError::Interrupted)),
        }
    }
}

/// Create a linked `(responder, TaskFuture)` pair for a freshly admitted
/// task, the responder side is handed to the executor, the future side
/// to the caller.
pub(crate) fn completion_pair() -> (mpsc::SyncSender<Result<TaskOutcome>>, TaskFuture) {
    let (tx, rx) = mpsc::sync_channel(1);
    (tx, TaskFuture::new(rx))
}
