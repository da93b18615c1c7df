//! The readiness-gate collaborator: the resource/store manager this crate
//! schedules work for but does not implement.

use std::time::Duration;

/// Reports whether the underlying store is up and able to serve reads and
/// writes. The Task Router awaits this (bounded wait) before admitting a
/// task; if it never reports ready, admission fails with `Rejected`,
/// unless `is_fatal` says the failure is unrecoverable, in which case the
/// manager closes instead (see `spec.md` §4.D / §7: "manager remains open
/// unless the resource manager signals fatal").
pub trait ResourceManager: Send + Sync {
    fn await_running(&self, timeout: Duration) -> bool;

    /// Whether the store has reported a failure from which it cannot
    /// recover. Checked only after `await_running` fails; when true the
    /// Task Router closes the manager and returns `Fatal` instead of the
    /// ordinary `Rejected`. Defaults to `false`: most readiness failures
    /// are transient (store still starting up), not terminal.
    fn is_fatal(&self) -> bool {
        false
    }
}

/// A resource manager that is always ready. Used in tests and as a
/// starting point for integrations that don't yet have a real readiness
/// signal.
pub struct AlwaysReady;

impl ResourceManager for AlwaysReady {
    fn await_running(&self, _timeout: Duration) -> bool {
        true
    }
}

/// A resource manager that never becomes ready, exercises the
/// `Rejected("store not available")` admission path in tests.
pub struct NeverReady;

impl ResourceManager for NeverReady {
    fn await_running(&self, _timeout: Duration) -> bool {
        false
    }
}

/// A resource manager that never becomes ready *and* reports its failure
/// as unrecoverable, exercises the `Fatal` admission path (manager closes
/// rather than merely rejecting this one task) in tests.
pub struct FatallyBroken;

impl ResourceManager for FatallyBroken {
    fn await_running(&self, _timeout: Duration) -> bool {
        false
    }

    fn is_fatal(&self) -> bool {
        true
    }
}
