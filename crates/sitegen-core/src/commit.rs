//! Atomic multi-file commits against a [`RepoHost`].
//!
//! Every call produces exactly one commit: blobs are uploaded first, then a
//! single tree layered over the branch tip's tree, one commit, and finally
//! the branch ref is advanced. Readers of the remote therefore observe either
//! the old tree or the complete new one.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{normalize_path, FileEntry, FileSet, Result, SiteError};
use crate::obs;
use crate::repo::{CommitInfo, HostError, ObjectId, RepoHost, RepoTarget, TreeEntry};

/// Rounds of re-resolving the tip after losing a ref race.
pub const DEFAULT_MAX_REF_ROUNDS: u32 = 3;

/// One change to the repository tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TreeChange {
    Upsert(FileEntry),
    Delete { path: String },
}

impl TreeChange {
    pub fn path(&self) -> &str {
        match self {
            TreeChange::Upsert(entry) => &entry.path,
            TreeChange::Delete { path } => path,
        }
    }
}

/// How the branch ref moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefUpdate {
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    pub commit_id: ObjectId,
    pub branch_advanced: RefUpdate,
}

/// Everything needed to build the tree and commit for one round.
///
/// `base_tree` and `parent` are absent exactly when the branch does not
/// exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitPlan {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub base_tree: Option<ObjectId>,
    pub parent: Option<ObjectId>,
    pub blobs: Vec<TreeEntry>,
}

/// Produces one atomic commit per call and advances the branch.
pub struct BlobTreeCommitter {
    host: Arc<dyn RepoHost>,
    max_ref_rounds: u32,
}

impl BlobTreeCommitter {
    pub fn new(host: Arc<dyn RepoHost>) -> Self {
        Self {
            host,
            max_ref_rounds: DEFAULT_MAX_REF_ROUNDS,
        }
    }

    pub fn with_max_ref_rounds(mut self, rounds: u32) -> Self {
        self.max_ref_rounds = rounds.max(1);
        self
    }

    pub fn host(&self) -> &Arc<dyn RepoHost> {
        &self.host
    }

    /// Commit every file of `files` onto `branch`.
    pub async fn commit(
        &self,
        target: &RepoTarget,
        branch: &str,
        files: &FileSet,
        message: &str,
    ) -> Result<CommitResult> {
        let changes = files.iter().cloned().map(TreeChange::Upsert).collect();
        self.commit_changes(target, branch, changes, message).await
    }

    /// Commit a mix of upserts and deletes onto `branch` as one commit.
    ///
    /// Paths are normalized and deduplicated (last change wins). An empty
    /// change list is a caller bug and fails with
    /// [`SiteError::InternalInvariantViolation`] before any remote call.
    pub async fn commit_changes(
        &self,
        target: &RepoTarget,
        branch: &str,
        changes: Vec<TreeChange>,
        message: &str,
    ) -> Result<CommitResult> {
        let changes = normalize_changes(changes)?;
        if changes.is_empty() {
            return Err(SiteError::InternalInvariantViolation(
                "commit requested with no changes".to_string(),
            ));
        }

        let entries = self.upload_blobs(target, &changes).await?;

        for round in 1..=self.max_ref_rounds {
            let tip = self.resolve_tip(target, branch).await?;
            let plan = CommitPlan {
                owner: target.owner.clone(),
                repo: target.repo.clone(),
                branch: branch.to_string(),
                base_tree: tip.as_ref().map(|c| c.tree.clone()),
                parent: tip.as_ref().map(|c| c.id.clone()),
                blobs: entries.clone(),
            };
            debug!(
                round,
                parent = ?plan.parent,
                base_tree = ?plan.base_tree,
                entries = plan.blobs.len(),
                "commit plan"
            );

            let commit_id = self.write_commit(target, &plan, message).await?;
            match self.advance_ref(target, branch, &commit_id, plan.parent.is_some()).await? {
                Some(branch_advanced) => {
                    obs::emit_commit_created(
                        &target.slug(),
                        branch,
                        commit_id.as_str(),
                        plan.blobs.len(),
                        branch_advanced,
                    );
                    return Ok(CommitResult {
                        commit_id,
                        branch_advanced,
                    });
                }
                None => {
                    warn!(
                        repo = %target,
                        branch,
                        round,
                        "branch moved while committing, rebuilding on the new tip"
                    );
                }
            }
        }

        Err(SiteError::RemoteConflict(format!(
            "branch {branch} of {target} kept moving after {} rounds",
            self.max_ref_rounds
        )))
    }

    /// Upload every upsert's blob in order, attributing failures to the
    /// first path that failed.
    async fn upload_blobs(
        &self,
        target: &RepoTarget,
        changes: &[TreeChange],
    ) -> Result<Vec<TreeEntry>> {
        let mut entries = Vec::with_capacity(changes.len());
        for change in changes {
            let entry = match change {
                TreeChange::Upsert(file) => {
                    let blob = self.host.create_blob(target, file).await.map_err(|e| {
                        SiteError::PartialBlobFailure {
                            path: file.path.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                    TreeEntry {
                        path: file.path.clone(),
                        blob: Some(blob),
                    }
                }
                TreeChange::Delete { path } => TreeEntry {
                    path: path.clone(),
                    blob: None,
                },
            };
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Current tip of `branch`, or `None` when the branch does not exist.
    async fn resolve_tip(&self, target: &RepoTarget, branch: &str) -> Result<Option<CommitInfo>> {
        match self.host.read_ref(target, branch).await {
            Ok(commit) => Ok(Some(self.host.read_commit(target, &commit).await?)),
            Err(HostError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_commit(
        &self,
        target: &RepoTarget,
        plan: &CommitPlan,
        message: &str,
    ) -> Result<ObjectId> {
        let tree = self
            .host
            .create_tree(target, plan.base_tree.as_ref(), &plan.blobs)
            .await?;
        let parents: Vec<ObjectId> = plan.parent.iter().cloned().collect();
        Ok(self
            .host
            .create_commit(target, message, &tree, &parents)
            .await?)
    }

    /// Move the branch to `commit`. Returns `None` when the branch moved
    /// underneath us and the commit must be rebuilt on the new tip.
    async fn advance_ref(
        &self,
        target: &RepoTarget,
        branch: &str,
        commit: &ObjectId,
        branch_existed: bool,
    ) -> Result<Option<RefUpdate>> {
        if !branch_existed {
            match self.host.create_ref(target, branch, commit).await {
                Ok(()) => return Ok(Some(RefUpdate::Created)),
                Err(HostError::Conflict(reason)) => {
                    info!(repo = %target, branch, %reason, "ref already exists, updating instead");
                }
                Err(e) => return Err(e.into()),
            }
        }

        match self.host.update_ref(target, branch, commit).await {
            Ok(()) => Ok(Some(RefUpdate::Updated)),
            Err(HostError::Conflict(_)) | Err(HostError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Normalize change paths, dropping empty ones; the last change for a path
/// wins while keeping the first one's position.
fn normalize_changes(changes: Vec<TreeChange>) -> Result<Vec<TreeChange>> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<TreeChange> = Vec::new();
    for change in changes {
        let Some(path) = normalize_path(change.path())? else {
            continue;
        };
        let change = match change {
            TreeChange::Upsert(mut entry) => {
                entry.path = path.clone();
                TreeChange::Upsert(entry)
            }
            TreeChange::Delete { .. } => TreeChange::Delete { path: path.clone() },
        };
        match index.get(&path) {
            Some(&pos) => out[pos] = change,
            None => {
                index.insert(path, out.len());
                out.push(change);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::MemoryRepoHost;

    fn target() -> RepoTarget {
        RepoTarget::new("acme", "site")
    }

    fn files(pairs: &[(&str, &str)]) -> FileSet {
        FileSet::new(pairs.iter().map(|(p, c)| FileEntry::utf8(*p, *c))).unwrap()
    }

    #[test]
    fn normalize_changes_last_wins() {
        let changes = normalize_changes(vec![
            TreeChange::Upsert(FileEntry::utf8("/a.txt", "1")),
            TreeChange::Upsert(FileEntry::utf8("b.txt", "2")),
            TreeChange::Delete {
                path: "a.txt".into(),
            },
            TreeChange::Delete { path: "/".into() },
        ])
        .unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(
            changes[0],
            TreeChange::Delete {
                path: "a.txt".into()
            }
        );
        assert_eq!(changes[1].path(), "b.txt");
    }

    #[tokio::test]
    async fn first_commit_on_empty_repository_creates_ref() {
        let host = Arc::new(MemoryRepoHost::with_repository(&target()));
        let committer = BlobTreeCommitter::new(host.clone());

        let result = committer
            .commit(
                &target(),
                "main",
                &files(&[("index.html", "<h1>hi</h1>"), ("style.css", "body{}")]),
                "initial",
            )
            .await
            .unwrap();

        assert_eq!(result.branch_advanced, RefUpdate::Created);
        assert_eq!(host.history(&target(), "main"), vec![result.commit_id]);
        assert_eq!(
            host.tree_paths(&target(), "main"),
            vec!["index.html", "style.css"]
        );
    }

    #[tokio::test]
    async fn empty_change_list_is_invariant_violation() {
        let host = Arc::new(MemoryRepoHost::with_repository(&target()));
        let committer = BlobTreeCommitter::new(host.clone());
        let err = committer
            .commit_changes(&target(), "main", vec![], "nothing")
            .await
            .unwrap_err();
        assert!(matches!(err, SiteError::InternalInvariantViolation(_)));
        assert!(host.history(&target(), "main").is_empty());
    }

    #[tokio::test]
    async fn blob_failure_names_path_and_leaves_branch_untouched() {
        let host = Arc::new(MemoryRepoHost::with_repository(&target()));
        host.fail_blob_upload("b.txt");
        let committer = BlobTreeCommitter::new(host.clone());

        let err = committer
            .commit(
                &target(),
                "main",
                &files(&[("a.txt", "a"), ("b.txt", "b"), ("c.txt", "c")]),
                "msg",
            )
            .await
            .unwrap_err();

        match err {
            SiteError::PartialBlobFailure { path, .. } => assert_eq!(path, "b.txt"),
            other => panic!("expected PartialBlobFailure, got {other:?}"),
        }
        assert!(host.history(&target(), "main").is_empty());
    }

    #[tokio::test]
    async fn unavailable_host_surfaces_remote_unavailable() {
        let host = Arc::new(MemoryRepoHost::with_repository(&target()));
        let committer = BlobTreeCommitter::new(host.clone());
        committer
            .commit(&target(), "main", &files(&[("a.txt", "a")]), "one")
            .await
            .unwrap();

        host.set_unavailable(true);
        let changes = vec![TreeChange::Delete {
            path: "a.txt".into(),
        }];
        let err = committer
            .commit_changes(&target(), "main", changes, "rm")
            .await
            .unwrap_err();
        assert!(matches!(err, SiteError::RemoteUnavailable(_)));
    }

    #[tokio::test]
    async fn stale_read_falls_back_to_update_and_chains() {
        let host = Arc::new(MemoryRepoHost::with_repository(&target()));
        let committer = BlobTreeCommitter::new(host.clone());
        let first = committer
            .commit(&target(), "main", &files(&[("a.txt", "a")]), "one")
            .await
            .unwrap();

        // The committer sees no branch, loses the create, and must end up
        // chained onto the existing tip rather than replacing it.
        host.simulate_stale_ref_reads(1);
        let second = committer
            .commit(&target(), "main", &files(&[("b.txt", "b")]), "two")
            .await
            .unwrap();

        assert_eq!(second.branch_advanced, RefUpdate::Updated);
        assert_eq!(
            host.history(&target(), "main"),
            vec![second.commit_id, first.commit_id]
        );
        assert_eq!(host.tree_paths(&target(), "main"), vec!["a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn persistent_stale_reads_exhaust_rounds() {
        let host = Arc::new(MemoryRepoHost::with_repository(&target()));
        let committer = BlobTreeCommitter::new(host.clone()).with_max_ref_rounds(2);
        committer
            .commit(&target(), "main", &files(&[("a.txt", "a")]), "one")
            .await
            .unwrap();

        host.simulate_stale_ref_reads(10);
        let err = committer
            .commit(&target(), "main", &files(&[("b.txt", "b")]), "two")
            .await
            .unwrap_err();
        assert!(matches!(err, SiteError::RemoteConflict(_)));
        assert_eq!(host.history(&target(), "main").len(), 1);
    }
}
