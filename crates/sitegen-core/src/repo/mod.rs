//! Remote repository host boundary.
//!
//! [`RepoHost`] is the narrow set of git-data operations the committer needs:
//! blob, tree, commit and ref manipulation plus content reads. Every
//! implementation reports failures as a tagged [`HostError`], mapped once at
//! the edge of the external call.

pub mod github;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use thiserror::Error;

use crate::domain::{FileEntry, Result, SiteError};

pub use github::{GithubConfig, GithubRepoHost};
pub use memory::MemoryRepoHost;

/// Errors from repository host calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The remote rejected the write because of its current state
    /// (ref already exists, update is not a fast-forward).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Transport failure, timeout or 5xx.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Any other refusal (authentication, permissions, bad request).
    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
}

pub type HostResult<T> = std::result::Result<T, HostError>;

/// Identifier of a blob, tree or commit on the host.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub String);

impl ObjectId {
    /// Content address of `data` tagged with its object kind, git style.
    pub fn compute(kind: &str, data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(format!("{kind} {}\0", data.len()).as_bytes());
        hasher.update(data);
        ObjectId(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.short())
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        ObjectId(s.to_string())
    }
}

/// An `owner/repo` pair on the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoTarget {
    pub owner: String,
    pub repo: String,
}

impl RepoTarget {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    /// Parse `owner/repo`.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let (owner, repo) = trimmed.split_once('/').ok_or_else(|| {
            SiteError::Validation(format!("invalid repository '{raw}', expected owner/repo"))
        })?;
        let owner = owner.trim();
        let repo = repo.trim();
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return Err(SiteError::Validation(format!(
                "invalid repository '{raw}', expected owner/repo"
            )));
        }
        Ok(Self::new(owner, repo))
    }

    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

impl fmt::Display for RepoTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// One entry layered onto a base tree. `blob: None` removes the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: String,
    pub blob: Option<ObjectId>,
}

/// A commit as read back from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub id: ObjectId,
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
}

/// Git-data operations against a remote repository host.
///
/// Implementations never retry internally; retry policy belongs to callers.
#[async_trait]
pub trait RepoHost: Send + Sync {
    /// Create the repository. `Conflict` if it already exists.
    async fn create_repository(&self, target: &RepoTarget, private: bool) -> HostResult<()>;

    /// Upload one file's content as a blob.
    async fn create_blob(&self, target: &RepoTarget, entry: &FileEntry) -> HostResult<ObjectId>;

    /// Commit id the branch points at. `NotFound` if the branch does not exist.
    async fn read_ref(&self, target: &RepoTarget, branch: &str) -> HostResult<ObjectId>;

    async fn read_commit(&self, target: &RepoTarget, commit: &ObjectId) -> HostResult<CommitInfo>;

    /// Create a tree from `entries`, layered over `base_tree` when given.
    async fn create_tree(
        &self,
        target: &RepoTarget,
        base_tree: Option<&ObjectId>,
        entries: &[TreeEntry],
    ) -> HostResult<ObjectId>;

    async fn create_commit(
        &self,
        target: &RepoTarget,
        message: &str,
        tree: &ObjectId,
        parents: &[ObjectId],
    ) -> HostResult<ObjectId>;

    /// Create a branch ref. `Conflict` if it already exists.
    async fn create_ref(
        &self,
        target: &RepoTarget,
        branch: &str,
        commit: &ObjectId,
    ) -> HostResult<()>;

    /// Move an existing branch ref. Never forced: `Conflict` unless the
    /// new commit descends from the current tip.
    async fn update_ref(
        &self,
        target: &RepoTarget,
        branch: &str,
        commit: &ObjectId,
    ) -> HostResult<()>;

    /// Raw bytes of `path` on `branch`. `NotFound` if absent.
    async fn read_content(
        &self,
        target: &RepoTarget,
        branch: &str,
        path: &str,
    ) -> HostResult<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_is_kind_tagged() {
        let blob = ObjectId::compute("blob", b"hello");
        let tree = ObjectId::compute("tree", b"hello");
        assert_ne!(blob, tree);
        assert_eq!(blob, ObjectId::compute("blob", b"hello"));
        assert_eq!(blob.as_str().len(), 64);
        assert_eq!(blob.short().len(), 12);
    }

    #[test]
    fn repo_target_parse() {
        let target = RepoTarget::parse(" acme / site ").unwrap();
        assert_eq!(target, RepoTarget::new("acme", "site"));
        assert_eq!(target.slug(), "acme/site");

        assert!(RepoTarget::parse("acme").is_err());
        assert!(RepoTarget::parse("/site").is_err());
        assert!(RepoTarget::parse("acme/site/extra").is_err());
    }
}
