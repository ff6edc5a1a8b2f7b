//! Structured observability hooks for site run lifecycle events.
//!
//! Every event carries an `event` field so log pipelines can filter on it.
//! Events are emitted at `info!` (failures at `warn!`); verbosity follows
//! `RUST_LOG`.

use tracing::{info, warn};

use crate::commit::RefUpdate;

/// RAII guard that enters a run-scoped tracing span for the duration of a run.
///
/// # Example
///
/// ```ignore
/// let _span = RunSpan::enter("3f2a9c1e...");
/// // every tracing call below is tagged with run_id
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str) -> Self {
        let span = tracing::info_span!("sitegen.run", run_id = %run_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Run accepted and registered.
pub fn emit_run_started(run_id: &str, max_attempts: u32) {
    info!(event = "run.started", run_id = %run_id, max_attempts = max_attempts);
}

pub fn emit_phase_changed(run_id: &str, phase: &str, attempt: u32) {
    info!(event = "run.phase", run_id = %run_id, phase = %phase, attempt = attempt);
}

/// A commit landed and the branch now points at it.
pub fn emit_commit_created(
    repo: &str,
    branch: &str,
    commit_id: &str,
    entries: usize,
    update: RefUpdate,
) {
    info!(
        event = "commit.created",
        repo = %repo,
        branch = %branch,
        commit_id = %commit_id,
        entries = entries,
        ref_update = ?update,
    );
}

/// One build attempt finished.
pub fn emit_build_attempt(run_id: &str, attempt: u32, success: bool, duration_ms: u64) {
    if success {
        info!(
            event = "build.attempt",
            run_id = %run_id,
            attempt = attempt,
            success = true,
            duration_ms = duration_ms,
        );
    } else {
        warn!(
            event = "build.attempt",
            run_id = %run_id,
            attempt = attempt,
            success = false,
            duration_ms = duration_ms,
        );
    }
}

/// Run reached a terminal state.
pub fn emit_run_finished(run_id: &str, attempts: u32, duration_ms: u64, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        attempts = attempts,
        duration_ms = duration_ms,
        success = success,
    );
}

pub fn emit_changes_applied(run_id: &str, applied: usize, failed: usize) {
    info!(
        event = "changes.applied",
        run_id = %run_id,
        applied = applied,
        failed = failed,
    );
}

/// Registry write or cleanup that failed after the run outcome was decided.
pub fn emit_run_finalize_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.finalize_error", run_id = %run_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_span_enters() {
        let _span = RunSpan::enter("test-run-id");
        emit_phase_changed("test-run-id", "generating", 1);
    }
}
