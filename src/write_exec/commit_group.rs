//! The commit group state machine: FORMING -> COMMITTING -> DONE/ABORTED.
//!
//! A group accumulates finished writers (each already holding its full
//! lock set) while FORMING, then a single thread drives it through one
//! `Journal::commit` call and releases every member's locks. This is
//! group commit: deferred-fsync batching in the spirit of
//! `engines/granite/wal.rs`'s `FsyncState`/`granite_worker_thread`
//! pattern. Many callers finish independently, one of them (here,
//! whichever thread wins the FORMING->COMMITTING transition) performs
//! the durable barrier for all of them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Mutex};

use crate::error::Result;
use crate::journal::CommitMember;
use crate::lock_manager::LockGuard;
use crate::task::{NamedResource, TaskOutcome, TxnId, Validate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupState {
    Forming,
    Committing,
    Done,
    Aborted,
}

/// One finished writer waiting on this group's durable commit. Holds its
/// lock guard until the group resolves, so no other task can observe its
/// write (or conflict with its resources) before that point.
pub(crate) struct PendingMember {
    pub(crate) sequence: u64,
    pub(crate) txn_id: Option<TxnId>,
    pub(crate) resources: Vec<NamedResource>,
    pub(crate) outcome: TaskOutcome,
    pub(crate) validate: Option<Validate>,
    pub(crate) responder: mpsc::SyncSender<Result<TaskOutcome>>,
    pub(crate) _locks: LockGuard,
}

impl PendingMember {
    pub(crate) fn journal_record(&self) -> CommitMember {
        CommitMember {
            sequence: self.sequence,
            txn_id: self.txn_id,
            resources: self.resources.iter().map(|r| r.as_str().to_string()).collect(),
        }
    }
}

/// A batch of unisolated writes (and validated transaction commits) bound
/// for a single durable commit call. Sequence numbers are assigned at
/// admission and double as lock-manager owner ids, so a member's own
/// identity is stable from admission through journal write.
pub(crate) struct CommitGroup {
    pub(crate) state: Mutex<GroupState>,
    pub(crate) members: Mutex<Vec<PendingMember>>,
}

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Mint a process-wide monotonic sequence number, used both as a lock
/// owner id and as a journal record's sequence field.
pub(crate) fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

impl CommitGroup {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GroupState::Forming),
            members: Mutex::new(Vec::new()),
        }
    }

    /// Add a finished writer to this group. Returns the new member count,
    /// so the caller can decide whether a forming-group trigger condition
    /// now holds. Hands the member back on `Err` if the group has already
    /// left FORMING, the caller must retry against a fresh group.
    pub(crate) fn add_member(&self, member: PendingMember) -> std::result::Result<usize, PendingMember> {
        let state = self.state.lock().unwrap();
        if *state != GroupState::Forming {
            return Err(member);
        }
        let mut members = self.members.lock().unwrap();
        members.push(member);
        Ok(members.len())
    }

    /// Attempt the FORMING -> COMMITTING transition. Only the thread that
    /// succeeds here performs the durable commit; every other caller
    /// racing to close out the same group gets `false` and does nothing.
    pub(crate) fn try_begin_commit(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == GroupState::Forming {
            *state = GroupState::Committing;
            true
        } else {
            false
        }
    }

    pub(crate) fn take_members(&self) -> Vec<PendingMember> {
        std::mem::take(&mut *self.members.lock().unwrap())
    }

    pub(crate) fn finish(&self, ok: bool) {
        *self.state.lock().unwrap() = if ok { GroupState::Done } else { GroupState::Aborted };
    }

    /// Abort a still-forming group outright (the live-index-corruption
    /// path). Returns its members for the caller to fail and bill to
    /// counters; returns `None` if the group had already left FORMING.
    pub(crate) fn abort_if_forming(&self) -> Option<Vec<PendingMember>> {
        let mut state = self.state.lock().unwrap();
        if *state != GroupState::Forming {
            return None;
        }
        *state = GroupState::Aborted;
        drop(state);
        Some(self.take_members())
    }
}
