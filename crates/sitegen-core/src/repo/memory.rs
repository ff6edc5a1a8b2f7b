//! In-memory repository host.
//!
//! Models the git data API closely enough to exercise the commit protocol:
//! content-addressed blobs, trees and commits, branch refs with fast-forward
//! enforcement, and a handful of injectable faults. Used by tests and by the
//! daemon when no GitHub token is configured.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{CommitInfo, HostError, HostResult, ObjectId, RepoHost, RepoTarget, TreeEntry};
use crate::domain::FileEntry;

#[derive(Debug, Clone)]
struct StoredCommit {
    info: CommitInfo,
    message: String,
}

#[derive(Debug, Default)]
struct RepoData {
    blobs: HashMap<ObjectId, Vec<u8>>,
    trees: HashMap<ObjectId, BTreeMap<String, ObjectId>>,
    commits: HashMap<ObjectId, StoredCommit>,
    refs: HashMap<String, ObjectId>,
    seq: u64,
}

impl RepoData {
    fn tree_of_branch(&self, branch: &str) -> Option<&BTreeMap<String, ObjectId>> {
        let tip = self.refs.get(branch)?;
        let commit = self.commits.get(tip)?;
        self.trees.get(&commit.info.tree)
    }

    fn is_ancestor(&self, ancestor: &ObjectId, descendant: &ObjectId) -> bool {
        let mut queue = VecDeque::from([descendant.clone()]);
        let mut seen = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if &id == ancestor {
                return true;
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(commit) = self.commits.get(&id) {
                queue.extend(commit.info.parents.iter().cloned());
            }
        }
        false
    }
}

#[derive(Debug, Default)]
struct Faults {
    failing_blob_paths: HashSet<String>,
    stale_ref_reads: u32,
    unavailable: bool,
}

/// In-memory [`RepoHost`] keyed by `owner/repo`.
#[derive(Debug, Default)]
pub struct MemoryRepoHost {
    repos: Mutex<HashMap<RepoTarget, RepoData>>,
    faults: Mutex<Faults>,
}

impl MemoryRepoHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// A host with `target` already created (and empty).
    pub fn with_repository(target: &RepoTarget) -> Self {
        let host = Self::new();
        host.repos().insert(target.clone(), RepoData::default());
        host
    }

    fn repos(&self) -> MutexGuard<'_, HashMap<RepoTarget, RepoData>> {
        self.repos.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every blob upload for `path` fail with `Unavailable`.
    pub fn fail_blob_upload(&self, path: &str) {
        self.faults().failing_blob_paths.insert(path.to_string());
    }

    /// Make the next `n` ref reads report the branch as missing, as a stale
    /// replica would.
    pub fn simulate_stale_ref_reads(&self, n: u32) {
        self.faults().stale_ref_reads = n;
    }

    /// Make every call fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults().unavailable = unavailable;
    }

    fn check_available(&self) -> HostResult<()> {
        if self.faults().unavailable {
            return Err(HostError::Unavailable("host marked unavailable".to_string()));
        }
        Ok(())
    }

    fn with_repo<T>(
        &self,
        target: &RepoTarget,
        f: impl FnOnce(&mut RepoData) -> HostResult<T>,
    ) -> HostResult<T> {
        self.check_available()?;
        let mut repos = self.repos();
        let data = repos
            .get_mut(target)
            .ok_or_else(|| HostError::NotFound(format!("repository {target}")))?;
        f(data)
    }

    /// Content of `path` on `branch`, if present.
    pub fn file(&self, target: &RepoTarget, branch: &str, path: &str) -> Option<Vec<u8>> {
        let repos = self.repos();
        let data = repos.get(target)?;
        let blob = data.tree_of_branch(branch)?.get(path)?;
        data.blobs.get(blob).cloned()
    }

    /// Sorted paths in the tree `branch` points at.
    pub fn tree_paths(&self, target: &RepoTarget, branch: &str) -> Vec<String> {
        let repos = self.repos();
        repos
            .get(target)
            .and_then(|data| data.tree_of_branch(branch))
            .map(|tree| tree.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// First-parent history of `branch`, tip first.
    pub fn history(&self, target: &RepoTarget, branch: &str) -> Vec<ObjectId> {
        let repos = self.repos();
        let Some(data) = repos.get(target) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut cursor = data.refs.get(branch).cloned();
        while let Some(id) = cursor {
            cursor = data
                .commits
                .get(&id)
                .and_then(|c| c.info.parents.first().cloned());
            out.push(id);
        }
        out
    }

    pub fn commit_message(&self, target: &RepoTarget, commit: &ObjectId) -> Option<String> {
        let repos = self.repos();
        repos
            .get(target)?
            .commits
            .get(commit)
            .map(|c| c.message.clone())
    }

    pub fn repository_exists(&self, target: &RepoTarget) -> bool {
        self.repos().contains_key(target)
    }
}

#[async_trait]
impl RepoHost for MemoryRepoHost {
    async fn create_repository(&self, target: &RepoTarget, _private: bool) -> HostResult<()> {
        self.check_available()?;
        let mut repos = self.repos();
        if repos.contains_key(target) {
            return Err(HostError::Conflict(format!(
                "repository {target} already exists"
            )));
        }
        repos.insert(target.clone(), RepoData::default());
        Ok(())
    }

    async fn create_blob(&self, target: &RepoTarget, entry: &FileEntry) -> HostResult<ObjectId> {
        if self.faults().failing_blob_paths.contains(&entry.path) {
            return Err(HostError::Unavailable(format!(
                "injected blob failure for {}",
                entry.path
            )));
        }
        let bytes = entry.decoded().map_err(|e| HostError::Rejected {
            status: 422,
            message: e.to_string(),
        })?;
        self.with_repo(target, |data| {
            let id = ObjectId::compute("blob", &bytes);
            data.blobs.insert(id.clone(), bytes);
            Ok(id)
        })
    }

    async fn read_ref(&self, target: &RepoTarget, branch: &str) -> HostResult<ObjectId> {
        {
            let mut faults = self.faults();
            if faults.stale_ref_reads > 0 {
                faults.stale_ref_reads -= 1;
                return Err(HostError::NotFound(format!("ref heads/{branch}")));
            }
        }
        self.with_repo(target, |data| {
            data.refs
                .get(branch)
                .cloned()
                .ok_or_else(|| HostError::NotFound(format!("ref heads/{branch}")))
        })
    }

    async fn read_commit(&self, target: &RepoTarget, commit: &ObjectId) -> HostResult<CommitInfo> {
        self.with_repo(target, |data| {
            data.commits
                .get(commit)
                .map(|c| c.info.clone())
                .ok_or_else(|| HostError::NotFound(format!("commit {commit}")))
        })
    }

    async fn create_tree(
        &self,
        target: &RepoTarget,
        base_tree: Option<&ObjectId>,
        entries: &[TreeEntry],
    ) -> HostResult<ObjectId> {
        self.with_repo(target, |data| {
            let mut tree = match base_tree {
                Some(base) => data
                    .trees
                    .get(base)
                    .cloned()
                    .ok_or_else(|| HostError::NotFound(format!("tree {base}")))?,
                None => BTreeMap::new(),
            };
            for entry in entries {
                match &entry.blob {
                    Some(blob) => {
                        if !data.blobs.contains_key(blob) {
                            return Err(HostError::Rejected {
                                status: 422,
                                message: format!("unknown blob {blob} for {}", entry.path),
                            });
                        }
                        tree.insert(entry.path.clone(), blob.clone());
                    }
                    None => {
                        tree.remove(&entry.path);
                    }
                }
            }
            let encoded: String = tree
                .iter()
                .map(|(path, blob)| format!("{path}\0{blob}\n"))
                .collect();
            let id = ObjectId::compute("tree", encoded.as_bytes());
            data.trees.insert(id.clone(), tree);
            Ok(id)
        })
    }

    async fn create_commit(
        &self,
        target: &RepoTarget,
        message: &str,
        tree: &ObjectId,
        parents: &[ObjectId],
    ) -> HostResult<ObjectId> {
        self.with_repo(target, |data| {
            if !data.trees.contains_key(tree) {
                return Err(HostError::Rejected {
                    status: 422,
                    message: format!("unknown tree {tree}"),
                });
            }
            if let Some(missing) = parents.iter().find(|p| !data.commits.contains_key(*p)) {
                return Err(HostError::Rejected {
                    status: 422,
                    message: format!("unknown parent {missing}"),
                });
            }
            data.seq += 1;
            let parent_lines: String = parents.iter().map(|p| format!("parent {p}\n")).collect();
            let body = format!("tree {tree}\n{parent_lines}seq {}\n\n{message}", data.seq);
            let id = ObjectId::compute("commit", body.as_bytes());
            data.commits.insert(
                id.clone(),
                StoredCommit {
                    info: CommitInfo {
                        id: id.clone(),
                        tree: tree.clone(),
                        parents: parents.to_vec(),
                    },
                    message: message.to_string(),
                },
            );
            Ok(id)
        })
    }

    async fn create_ref(
        &self,
        target: &RepoTarget,
        branch: &str,
        commit: &ObjectId,
    ) -> HostResult<()> {
        self.with_repo(target, |data| {
            if data.refs.contains_key(branch) {
                return Err(HostError::Conflict(format!(
                    "reference heads/{branch} already exists"
                )));
            }
            if !data.commits.contains_key(commit) {
                return Err(HostError::Rejected {
                    status: 422,
                    message: format!("unknown commit {commit}"),
                });
            }
            data.refs.insert(branch.to_string(), commit.clone());
            Ok(())
        })
    }

    async fn update_ref(
        &self,
        target: &RepoTarget,
        branch: &str,
        commit: &ObjectId,
    ) -> HostResult<()> {
        self.with_repo(target, |data| {
            let current = data
                .refs
                .get(branch)
                .cloned()
                .ok_or_else(|| HostError::NotFound(format!("ref heads/{branch}")))?;
            if !data.commits.contains_key(commit) {
                return Err(HostError::Rejected {
                    status: 422,
                    message: format!("unknown commit {commit}"),
                });
            }
            if !data.is_ancestor(&current, commit) {
                return Err(HostError::Conflict(format!(
                    "update of heads/{branch} is not a fast forward"
                )));
            }
            data.refs.insert(branch.to_string(), commit.clone());
            Ok(())
        })
    }

    async fn read_content(
        &self,
        target: &RepoTarget,
        branch: &str,
        path: &str,
    ) -> HostResult<Vec<u8>> {
        self.with_repo(target, |data| {
            let tree = data
                .tree_of_branch(branch)
                .ok_or_else(|| HostError::NotFound(format!("ref heads/{branch}")))?;
            let blob = tree
                .get(path)
                .ok_or_else(|| HostError::NotFound(format!("{path} on {branch}")))?;
            data.blobs
                .get(blob)
                .cloned()
                .ok_or_else(|| HostError::NotFound(format!("blob {blob}")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> RepoTarget {
        RepoTarget::new("acme", "site")
    }

    #[tokio::test]
    async fn unknown_repository_is_not_found() {
        let host = MemoryRepoHost::new();
        let err = host.read_ref(&target(), "main").await.unwrap_err();
        assert!(matches!(err, HostError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_repository_twice_conflicts() {
        let host = MemoryRepoHost::new();
        host.create_repository(&target(), true).await.unwrap();
        let err = host.create_repository(&target(), true).await.unwrap_err();
        assert!(matches!(err, HostError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_ref_requires_fast_forward() {
        let t = target();
        let host = MemoryRepoHost::with_repository(&t);
        let blob = host
            .create_blob(&t, &FileEntry::utf8("a.txt", "a"))
            .await
            .unwrap();
        let entries = [TreeEntry {
            path: "a.txt".into(),
            blob: Some(blob),
        }];
        let tree = host.create_tree(&t, None, &entries).await.unwrap();
        let first = host.create_commit(&t, "one", &tree, &[]).await.unwrap();
        host.create_ref(&t, "main", &first).await.unwrap();

        let unrelated = host.create_commit(&t, "other", &tree, &[]).await.unwrap();
        let err = host.update_ref(&t, "main", &unrelated).await.unwrap_err();
        assert!(matches!(err, HostError::Conflict(_)));

        let child = host
            .create_commit(&t, "two", &tree, &[first.clone()])
            .await
            .unwrap();
        host.update_ref(&t, "main", &child).await.unwrap();
        assert_eq!(host.history(&t, "main"), vec![child, first]);
    }

    #[tokio::test]
    async fn tree_entry_without_blob_deletes() {
        let t = target();
        let host = MemoryRepoHost::with_repository(&t);
        let a = host
            .create_blob(&t, &FileEntry::utf8("a.txt", "a"))
            .await
            .unwrap();
        let base = host
            .create_tree(
                &t,
                None,
                &[TreeEntry {
                    path: "a.txt".into(),
                    blob: Some(a),
                }],
            )
            .await
            .unwrap();
        let pruned = host
            .create_tree(
                &t,
                Some(&base),
                &[TreeEntry {
                    path: "a.txt".into(),
                    blob: None,
                }],
            )
            .await
            .unwrap();
        let commit = host.create_commit(&t, "rm", &pruned, &[]).await.unwrap();
        host.create_ref(&t, "main", &commit).await.unwrap();
        assert!(host.tree_paths(&t, "main").is_empty());
    }

    #[tokio::test]
    async fn faults_are_injectable() {
        let t = target();
        let host = MemoryRepoHost::with_repository(&t);

        host.fail_blob_upload("bad.txt");
        let err = host
            .create_blob(&t, &FileEntry::utf8("bad.txt", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Unavailable(_)));

        host.set_unavailable(true);
        let err = host.read_ref(&t, "main").await.unwrap_err();
        assert!(matches!(err, HostError::Unavailable(_)));
    }
}
