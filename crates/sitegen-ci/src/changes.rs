//! Incremental upsert/delete changes against a run's repository.
//!
//! Each operation becomes its own commit, applied strictly in submission
//! order: the next operation's parent is the previous operation's commit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use sitegen_core::commit::{BlobTreeCommitter, TreeChange};
use sitegen_core::repo::{HostError, RepoTarget};
use sitegen_core::{normalize_path, RunId, SiteError};
use tracing::{debug, warn};

/// Per-run async locks serializing every commit issued for a run.
///
/// Only weak references are kept: an entry lives as long as some caller
/// holds its lock handle, and dead entries are pruned on insert.
#[derive(Debug, Default)]
pub struct RunLocks {
    locks: Mutex<HashMap<RunId, Weak<tokio::sync::Mutex<()>>>>,
}

impl RunLocks {
    fn locks(&self) -> MutexGuard<'_, HashMap<RunId, Weak<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The lock for `run_id`. Callers holding a handle for the same run
    /// share one lock.
    pub fn lock_for(&self, run_id: &RunId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks();
        if let Some(lock) = locks.get(run_id).and_then(Weak::upgrade) {
            return lock;
        }
        locks.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(run_id.clone(), Arc::downgrade(&lock));
        lock
    }

    /// Number of runs with a live lock handle.
    pub fn active(&self) -> usize {
        self.locks()
            .values()
            .filter(|lock| lock.strong_count() > 0)
            .count()
    }
}

/// Result of one operation in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChangeOutcome {
    Committed { commit_id: String },
    /// Delete of a path that does not exist on the branch. No commit.
    Missing,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeResult {
    pub index: usize,
    pub path: String,
    #[serde(flatten)]
    pub outcome: ChangeOutcome,
}

impl ChangeResult {
    pub fn committed_id(&self) -> Option<&str> {
        match &self.outcome {
            ChangeOutcome::Committed { commit_id } => Some(commit_id),
            _ => None,
        }
    }
}

/// Apply `ops` to `branch` in order, one commit per operation.
///
/// A failed operation is reported in its slot; later operations still run.
/// Callers must hold the run's [`RunLocks`] entry.
pub async fn apply_changes(
    committer: &BlobTreeCommitter,
    target: &RepoTarget,
    branch: &str,
    ops: Vec<TreeChange>,
) -> Vec<ChangeResult> {
    let mut results = Vec::with_capacity(ops.len());
    for (index, op) in ops.into_iter().enumerate() {
        let path = op.path().to_string();
        let outcome = apply_one(committer, target, branch, op).await;
        debug!(index, path = %path, outcome = ?outcome, "change applied");
        results.push(ChangeResult {
            index,
            path,
            outcome,
        });
    }
    results
}

async fn apply_one(
    committer: &BlobTreeCommitter,
    target: &RepoTarget,
    branch: &str,
    op: TreeChange,
) -> ChangeOutcome {
    let normalized = match normalize_path(op.path()) {
        Ok(Some(path)) => path,
        Ok(None) => {
            let err = SiteError::Validation(format!(
                "path '{}' is empty after normalization",
                op.path()
            ));
            return ChangeOutcome::Failed {
                error: err.to_string(),
            };
        }
        Err(e) => {
            return ChangeOutcome::Failed {
                error: e.to_string(),
            }
        }
    };

    let message = match &op {
        TreeChange::Upsert(_) => format!("Update {normalized}"),
        TreeChange::Delete { .. } => {
            match committer
                .host()
                .read_content(target, branch, &normalized)
                .await
            {
                Ok(_) => {}
                Err(HostError::NotFound(_)) => return ChangeOutcome::Missing,
                Err(e) => {
                    return ChangeOutcome::Failed {
                        error: SiteError::from(e).to_string(),
                    }
                }
            }
            format!("Delete {normalized}")
        }
    };

    match committer
        .commit_changes(target, branch, vec![op], &message)
        .await
    {
        Ok(result) => ChangeOutcome::Committed {
            commit_id: result.commit_id.to_string(),
        },
        Err(e) => {
            warn!(error = %e, "change failed");
            ChangeOutcome::Failed {
                error: e.to_string(),
            }
        }
    }
}
