//! Error types for the concurrency manager.
//!
//! A single unified error type covers admission failures, execution
//! failures, and group-commit failures. Admission errors are returned
//! directly from `submit`; execution and commit failures surface through
//! a task's [`TaskFuture`](crate::task::TaskFuture).

use std::fmt;
use std::io;

/// Unified error type for concurrency manager operations.
#[derive(Debug)]
pub enum ManagerError {
    /// Submission was refused: the manager is closed, the store isn't
    /// ready yet, or a bounded queue stayed saturated past the
    /// backpressure budget.
    Rejected(String),
    /// The task was cancelled before or during execution.
    Cancelled,
    /// A worker thread was interrupted (e.g. during shutdown-now).
    Interrupted,
    /// A transaction's commit failed validation against concurrent writers.
    ValidationError(String),
    /// The durable commit itself failed (I/O or invariant violation);
    /// affects every member of the commit group.
    CommitFailed(String),
    /// A task body reported that its execution left a live index in a
    /// corrupted state. Aborts whichever commit group is currently
    /// forming (see `write_exec::abort_current_group`); does not by
    /// itself close the manager, since this is a property of one index,
    /// not of the underlying store as a whole.
    IndexCorrupted(String),
    /// The resource manager reported an unrecoverable failure
    /// (`ResourceManager::is_fatal`); the manager transitions to closed
    /// and every subsequent `submit` fails with this same variant.
    Fatal(String),
    /// Journal I/O error, wrapped for `?`-propagation from the journal.
    Io(io::Error),
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerError::Rejected(msg) => write!(f, "rejected: {}", msg),
            ManagerError::Cancelled => write!(f, "cancelled"),
            ManagerError::Interrupted => write!(f, "interrupted"),
            ManagerError::ValidationError(msg) => write!(f, "validation failed: {}", msg),
            ManagerError::CommitFailed(msg) => write!(f, "commit failed: {}", msg),
            ManagerError::IndexCorrupted(msg) => write!(f, "index corrupted: {}", msg),
            ManagerError::Fatal(msg) => write!(f, "fatal: {}", msg),
            ManagerError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ManagerError {}

impl From<io::Error> for ManagerError {
    fn from(e: io::Error) -> Self {
        ManagerError::Io(e)
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ManagerError>;
