//! Run lifecycle and build attempt tracking.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId.
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().simple().to_string())
    }

    /// First 8 characters, for names and log lines.
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        RunId(s.to_string())
    }
}

/// Coarse, externally visible run status.
///
/// Only ever advances: `Pending` -> `Building` -> `Ready` | `Failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Building,
    Ready,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Ready | RunStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            RunStatus::Pending => 0,
            RunStatus::Building => 1,
            RunStatus::Ready | RunStatus::Failed => 2,
        }
    }

    /// Whether moving from `self` to `next` keeps the status monotone.
    pub fn can_advance_to(self, next: RunStatus) -> bool {
        if self.is_terminal() {
            return self == next;
        }
        next.rank() >= self.rank()
    }
}

/// Fine-grained pipeline phase. Informational; cycles through
/// `Generating` -> `Committing` -> `Building` on every retry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Pending,
    Generating,
    Committing,
    Building,
    Ready,
    Failed,
}

impl RunPhase {
    /// The coarse status a run reports while in this phase.
    pub fn status(self) -> RunStatus {
        match self {
            RunPhase::Pending => RunStatus::Pending,
            RunPhase::Generating | RunPhase::Committing | RunPhase::Building => {
                RunStatus::Building
            }
            RunPhase::Ready => RunStatus::Ready,
            RunPhase::Failed => RunStatus::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Pending => "pending",
            RunPhase::Generating => "generating",
            RunPhase::Committing => "committing",
            RunPhase::Building => "building",
            RunPhase::Ready => "ready",
            RunPhase::Failed => "failed",
        }
    }
}

/// Sealed outcome of one build attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// One generate-and-build cycle within a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildAttempt {
    pub run_id: RunId,

    /// 1-based attempt number.
    pub attempt_number: u32,

    /// Working directory used by the attempt. Removed once sealed.
    pub work_dir: PathBuf,

    pub outcome: AttemptOutcome,

    /// Extracted error excerpt for failed attempts.
    pub error_excerpt: Option<String>,

    pub duration_ms: u64,
}

/// Where a run's files are committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoCoordinates {
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

/// Full lifecycle state of one run, owned by the run registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunState {
    pub run_id: RunId,
    pub prompt: String,
    pub status: RunStatus,
    pub phase: RunPhase,

    /// Last error excerpt. Present only once the run has failed.
    pub build_error: Option<String>,

    pub attempts: Vec<BuildAttempt>,

    /// Stable location of the built site once ready.
    pub artifact_path: Option<PathBuf>,

    pub repository: Option<RepoCoordinates>,
    pub last_commit_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(run_id: RunId, prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            prompt: prompt.into(),
            status: RunStatus::Pending,
            phase: RunPhase::Pending,
            build_error: None,
            attempts: Vec::new(),
            artifact_path: None,
            repository: None,
            last_commit_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A partial update to a [`RunState`], applied atomically by the registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunPatch {
    pub phase: Option<RunPhase>,
    pub build_error: Option<String>,
    pub push_attempt: Option<BuildAttempt>,
    pub artifact_path: Option<PathBuf>,
    pub repository: Option<RepoCoordinates>,
    pub last_commit_id: Option<String>,
}

impl RunPatch {
    pub fn phase(phase: RunPhase) -> Self {
        Self {
            phase: Some(phase),
            ..Default::default()
        }
    }

    pub fn attempt(attempt: BuildAttempt) -> Self {
        Self {
            push_attempt: Some(attempt),
            ..Default::default()
        }
    }

    pub fn ready(artifact_path: PathBuf) -> Self {
        Self {
            phase: Some(RunPhase::Ready),
            artifact_path: Some(artifact_path),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            phase: Some(RunPhase::Failed),
            build_error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn committed(repository: RepoCoordinates, commit_id: impl Into<String>) -> Self {
        Self {
            repository: Some(repository),
            last_commit_id: Some(commit_id.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_advances() {
        assert!(RunStatus::Pending.can_advance_to(RunStatus::Building));
        assert!(RunStatus::Building.can_advance_to(RunStatus::Building));
        assert!(RunStatus::Building.can_advance_to(RunStatus::Failed));
        assert!(!RunStatus::Building.can_advance_to(RunStatus::Pending));
        assert!(!RunStatus::Ready.can_advance_to(RunStatus::Failed));
        assert!(!RunStatus::Failed.can_advance_to(RunStatus::Building));
        assert!(RunStatus::Ready.can_advance_to(RunStatus::Ready));
    }

    #[test]
    fn phases_map_to_status() {
        assert_eq!(RunPhase::Pending.status(), RunStatus::Pending);
        assert_eq!(RunPhase::Generating.status(), RunStatus::Building);
        assert_eq!(RunPhase::Committing.status(), RunStatus::Building);
        assert_eq!(RunPhase::Ready.status(), RunStatus::Ready);
    }

    #[test]
    fn run_state_serializes_snake_case() {
        let state = RunState::new(RunId::from("abc"), "todo app");
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["run_id"], "abc");
        assert!(json["build_error"].is_null());
    }

    #[test]
    fn run_id_short() {
        let id = RunId::new();
        assert_eq!(id.as_str().len(), 32);
        assert_eq!(id.short().len(), 8);
        assert_eq!(RunId::from("ab").short(), "ab");
    }
}
