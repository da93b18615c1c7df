//! The durable-commit barrier a [`CommitGroup`](crate::write_exec::commit_group::CommitGroup)
//! calls exactly once per group.
//!
//! The underlying journal/index store is out of scope for this crate; it
//! is consumed through the [`Journal`] trait. A working default,
//! [`FileJournal`], is still provided: it writes one
//! length-prefixed, `bincode`-encoded record per commit-group member and
//! issues a single `fsync` for the whole batch, a write-then-sync shape.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{ManagerError, Result};
use crate::task::TxnId;

/// One commit-group member's record as seen by the journal: enough to
/// write a durable entry, nothing about how the member's task body ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitMember {
    pub sequence: u64,
    pub txn_id: Option<TxnId>,
    pub resources: Vec<String>,
}

/// The durable-commit collaborator. Implementations perform exactly one
/// synchronous durability barrier (e.g. `fsync`) per call, covering every
/// member passed in, that's the whole point of group commit: one barrier
/// amortized across many finished writers.
pub trait Journal: Send + Sync {
    fn commit(&self, batch: &[CommitMember]) -> Result<()>;
}

/// A journal backed by a single append-only file. Not a real storage
/// engine, it exists so the crate has a runnable, realistic default
/// instead of only a trait, and so tests can assert "one fsync per group."
pub struct FileJournal {
    file: Mutex<File>,
    fsync_count: AtomicU64,
}

impl FileJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path.as_ref())?;
        Ok(Self {
            file: Mutex::new(file),
            fsync_count: AtomicU64::new(0),
        })
    }

    pub fn create_temp() -> Result<(Self, PathBuf)> {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let unique = NEXT.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("concord-journal-{}-{unique}.log", std::process::id()));
        let journal = Self::open(&path)?;
        Ok((journal, path))
    }

    /// Number of `fsync` calls this journal has performed, the metric
    /// group commit exists to shrink.
    pub fn fsync_count(&self) -> u64 {
        self.fsync_count.load(Ordering::Relaxed)
    }
}

impl Journal for FileJournal {
    fn commit(&self, batch: &[CommitMember]) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        for member in batch {
            let encoded = bincode::serialize(member)
                .map_err(|e| ManagerError::CommitFailed(e.to_string()))?;
            let len = encoded.len() as u32;
            file.write_all(&len.to_le_bytes())?;
            file.write_all(&encoded)?;
        }
        file.flush()?;
        file.sync_data()?;
        self.fsync_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A journal that never succeeds, for exercising `CommitFailed` /
/// group-abort paths in tests.
pub struct FailingJournal;

impl Journal for FailingJournal {
    fn commit(&self, _batch: &[CommitMember]) -> Result<()> {
        Err(ManagerError::CommitFailed("journal unavailable".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_journal_commits_batch_with_one_fsync() {
        let dir = tempfile::tempdir().unwrap();
        let journal = FileJournal::open(dir.path().join("j.log")).unwrap();
        let batch = vec![
            CommitMember { sequence: 1, txn_id: None, resources: vec!["idx-a".into()] },
            CommitMember { sequence: 2, txn_id: Some(7), resources: vec!["idx-b".into()] },
        ];
        journal.commit(&batch).unwrap();
        assert_eq!(journal.fsync_count(), 1);
    }

    #[test]
    fn failing_journal_reports_commit_failed() {
        let journal = FailingJournal;
        let err = journal.commit(&[]).unwrap_err();
        assert!(matches!(err, ManagerError::CommitFailed(_)));
    }
}
