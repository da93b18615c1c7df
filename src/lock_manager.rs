//! Deadlock-free-by-construction lock manager.
//!
//! Resources are acquired in a single fixed total order (lexicographic on
//! name) and all-at-once: a worker that needs resources `{b, a, c}` always
//! acquires `a`, then `b`, then `c`. Since every worker uses the same
//! order, there is no wait-for cycle, hence no deadlock: pre-declaration
//! plus total ordering. No upgrades, no incremental acquisition: a task's
//! lock set is fixed at admission.
//!
//! The waiting mechanism (condvar-guarded shared map) follows the same
//! shape as `FsyncState`: many threads block on a condition, one state
//! change wakes them all to re-check, generalized here from "one LSN
//! becomes durable" to "one resource's holder changed."

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{ManagerError, Result};
use crate::task::NamedResource;

type Owner = u64;

struct Table {
    holders: HashMap<NamedResource, Owner>,
}

/// Owns the resource -> holder map for one scope: either the live-index
/// lock table (one per Write Executor) or a single transaction's
/// temp-store lock table (one per active transaction in the Transaction
/// Executor).
pub struct LockManager {
    table: Mutex<Table>,
    released: Condvar,
}

/// RAII guard for a task's full, acquired-all lock set. Dropping it
/// releases every held resource and wakes any waiters. Owns an `Arc` to
/// its manager rather than borrowing, so a finished write task can carry
/// its guard into a commit group and across to the committer thread.
pub struct LockGuard {
    manager: Arc<LockManager>,
    owner: Owner,
    held: Vec<NamedResource>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.manager.release_all(self.owner, &self.held);
    }
}

impl LockGuard {
    /// Resources actually held by this guard, in acquisition order.
    pub fn resources(&self) -> &[NamedResource] {
        &self.held
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table { holders: HashMap::new() }),
            released: Condvar::new(),
        }
    }

    /// Acquire every resource in `resources`, in canonical (sorted,
    /// deduplicated) order, blocking on each one already held by another
    /// owner until it's released. Returns early with `Cancelled` if
    /// `should_cancel` becomes true while waiting, locks already
    /// acquired on this call are released before returning.
    pub fn acquire_all(
        self: &Arc<Self>,
        owner: Owner,
        resources: &[NamedResource],
        should_cancel: &dyn Fn() -> bool,
    ) -> Result<LockGuard> {
        let mut ordered = resources.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut held = Vec::with_capacity(ordered.len());
        for resource in ordered {
            match self.acquire_one(owner, &resource, should_cancel) {
                Ok(()) => held.push(resource),
                Err(e) => {
                    // Release whatever we already hold before failing;
                    // a partially-acquired set would violate the
                    // all-or-nothing discipline the total order relies on.
                    self.release_all(owner, &held);
                    return Err(e);
                }
            }
        }
        Ok(LockGuard { manager: Arc::clone(self), owner, held })
    }

    fn acquire_one(&self, owner: Owner, resource: &NamedResource, should_cancel: &dyn Fn() -> bool) -> Result<()> {
        let mut guard = self.table.lock().unwrap();
        loop {
            if should_cancel() {
                return Err(ManagerError::Cancelled);
            }
            if !guard.holders.contains_key(resource) {
                guard.holders.insert(resource.clone(), owner);
                return Ok(());
            }
            let (g, timeout) = self
                .released
                .wait_timeout(guard, std::time::Duration::from_millis(50))
                .unwrap();
            guard = g;
            let _ = timeout; // periodic wake to re-check should_cancel
        }
    }

    fn release_all(&self, owner: Owner, resources: &[NamedResource]) {
        if resources.is_empty() {
            return;
        }
        let mut guard = self.table.lock().unwrap();
        for resource in resources {
            if guard.holders.get(resource) == Some(&owner) {
                guard.holders.remove(resource);
            }
        }
        drop(guard);
        self.released.notify_all();
    }

    /// For tests/observability: is any resource currently held?
    pub fn is_held(&self, resource: &NamedResource) -> bool {
        self.table.lock().unwrap().holders.contains_key(resource)
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
