//! Run registry: the only state shared between concurrent runs.
//!
//! Each update reads the full [`RunState`], applies a [`RunPatch`] and writes
//! the full state back under one lock, so readers always see a complete
//! snapshot. Status transitions are checked here so no caller can move a run
//! backwards or out of a terminal state.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use crate::domain::{Result, RunId, RunPatch, RunState, RunStatus, SiteError};

/// Keyed store of run lifecycle state.
#[async_trait]
pub trait RunRegistry: Send + Sync {
    /// Register a new pending run.
    async fn create(&self, prompt: &str) -> Result<RunState>;

    /// Snapshot of a run. `RunNotFound` if unknown.
    async fn get(&self, run_id: &RunId) -> Result<RunState>;

    /// Atomically apply `patch` and return the new snapshot.
    async fn update(&self, run_id: &RunId, patch: RunPatch) -> Result<RunState>;

    /// All runs, oldest first.
    async fn list(&self) -> Result<Vec<RunState>>;
}

/// Validate and apply `patch` to a copy of `state`.
pub fn apply_patch(state: &RunState, patch: RunPatch) -> Result<RunState> {
    let mut next = state.clone();

    if let Some(phase) = patch.phase {
        if state.status.is_terminal() {
            return Err(SiteError::InternalInvariantViolation(format!(
                "run {} is already {:?}, cannot enter {}",
                state.run_id,
                state.status,
                phase.as_str()
            )));
        }
        let status = phase.status();
        if !state.status.can_advance_to(status) {
            return Err(SiteError::InternalInvariantViolation(format!(
                "run {} cannot move from {:?} to {:?}",
                state.run_id, state.status, status
            )));
        }
        next.phase = phase;
        next.status = status;
    }

    if let Some(error) = patch.build_error {
        if next.status != RunStatus::Failed {
            return Err(SiteError::InternalInvariantViolation(format!(
                "run {} records a build error while {:?}",
                state.run_id, next.status
            )));
        }
        next.build_error = Some(error);
    }

    if let Some(attempt) = patch.push_attempt {
        let expected = next.attempts.len() as u32 + 1;
        if attempt.run_id != state.run_id || attempt.attempt_number != expected {
            return Err(SiteError::InternalInvariantViolation(format!(
                "run {} expected attempt {expected}, got attempt {} of run {}",
                state.run_id, attempt.attempt_number, attempt.run_id
            )));
        }
        next.attempts.push(attempt);
    }

    if let Some(path) = patch.artifact_path {
        next.artifact_path = Some(path);
    }
    if let Some(repository) = patch.repository {
        next.repository = Some(repository);
    }
    if let Some(commit) = patch.last_commit_id {
        next.last_commit_id = Some(commit);
    }

    next.updated_at = Utc::now();
    Ok(next)
}

/// In-memory registry backed by a `HashMap<RunId, RunState>`.
#[derive(Debug, Default)]
pub struct MemoryRunRegistry {
    runs: Mutex<HashMap<RunId, RunState>>,
}

impl MemoryRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<RunId, RunState>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RunRegistry for MemoryRunRegistry {
    async fn create(&self, prompt: &str) -> Result<RunState> {
        let state = RunState::new(RunId::new(), prompt);
        self.runs().insert(state.run_id.clone(), state.clone());
        Ok(state)
    }

    async fn get(&self, run_id: &RunId) -> Result<RunState> {
        self.runs()
            .get(run_id)
            .cloned()
            .ok_or_else(|| SiteError::RunNotFound(run_id.to_string()))
    }

    async fn update(&self, run_id: &RunId, patch: RunPatch) -> Result<RunState> {
        let mut runs = self.runs();
        let current = runs
            .get(run_id)
            .ok_or_else(|| SiteError::RunNotFound(run_id.to_string()))?;
        let next = apply_patch(current, patch)?;
        runs.insert(run_id.clone(), next.clone());
        Ok(next)
    }

    async fn list(&self) -> Result<Vec<RunState>> {
        let mut all: Vec<RunState> = self.runs().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }
}
