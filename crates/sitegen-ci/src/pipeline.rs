//! Generate / commit / build / fix loop.
//!
//! One [`GenerateFixLoop::run`] call drives one run to a terminal state:
//!
//! ```text
//! pending → generating → committing → building → ready
//!                ↑                        │
//!                └──── retry with excerpt ┘ → failed
//! ```
//!
//! Every transition is written to the [`RunRegistry`] before the next step
//! starts. The attempt budget counts generation calls, so a generator that
//! always fails is invoked exactly `max_attempts` times.

use std::sync::Arc;
use std::time::Instant;

use sitegen_core::commit::BlobTreeCommitter;
use sitegen_core::extract::{extract, truncate_chars, DEFAULT_MAX_CHARS};
use sitegen_core::obs;
use sitegen_core::repo::RepoTarget;
use sitegen_core::{
    AttemptOutcome, BuildAttempt, CommitStage, FileGenerator, FileSet, FixContext,
    PipelineSettings, RepoCoordinates, Result, RunId, RunPatch, RunPhase, RunRegistry, RunState,
    RunStatus, SiteError,
};
use tracing::{debug, info, warn, Instrument};

use crate::build::{BuildOutcome, SiteBuilder};
use crate::changes::RunLocks;

/// Retry bound and commit placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub max_attempts: u32,
    pub commit_stage: CommitStage,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_settings(&PipelineSettings::default())
    }
}

impl PipelineConfig {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            commit_stage: settings.commit_stage,
        }
    }
}

/// Repository and branch a run commits to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitDestination {
    pub target: RepoTarget,
    pub branch: String,
}

impl CommitDestination {
    pub fn coordinates(&self) -> RepoCoordinates {
        RepoCoordinates {
            owner: self.target.owner.clone(),
            repo: self.target.repo.clone(),
            branch: self.branch.clone(),
        }
    }
}

/// Bounded generate/build state machine.
pub struct GenerateFixLoop {
    registry: Arc<dyn RunRegistry>,
    generator: Arc<dyn FileGenerator>,
    builder: Arc<dyn SiteBuilder>,
    committer: Option<Arc<BlobTreeCommitter>>,
    locks: Arc<RunLocks>,
    config: PipelineConfig,
}

/// What ended one loop iteration.
enum Step {
    Done(RunState),
    Retry(Option<FixContext>),
}

impl GenerateFixLoop {
    pub fn new(
        registry: Arc<dyn RunRegistry>,
        generator: Arc<dyn FileGenerator>,
        builder: Arc<dyn SiteBuilder>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            registry,
            generator,
            builder,
            committer: None,
            locks: Arc::new(RunLocks::default()),
            config,
        }
    }

    pub fn with_committer(mut self, committer: Arc<BlobTreeCommitter>) -> Self {
        self.committer = Some(committer);
        self
    }

    /// Share commit serialization with other writers of the same runs.
    pub fn with_locks(mut self, locks: Arc<RunLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn config(&self) -> PipelineConfig {
        self.config
    }

    /// Drive `run_id` to `ready` or `failed` and return the final snapshot.
    ///
    /// Build and generation failures end in a `failed` snapshot, not an
    /// `Err`. An `Err` means the registry itself refused an update.
    pub async fn run(
        &self,
        run_id: &RunId,
        prompt: &str,
        destination: Option<&CommitDestination>,
    ) -> Result<RunState> {
        let span = tracing::info_span!("sitegen.run", run_id = %run_id);
        self.drive(run_id, prompt, destination)
            .instrument(span)
            .await
    }

    async fn drive(
        &self,
        run_id: &RunId,
        prompt: &str,
        destination: Option<&CommitDestination>,
    ) -> Result<RunState> {
        let start = Instant::now();
        let destination = match (self.config.commit_stage, &self.committer) {
            (CommitStage::Disabled, _) | (_, None) => None,
            _ => destination,
        };

        let mut context: Option<FixContext> = None;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let step = self
                .attempt(run_id, prompt, destination, attempt, context.take())
                .await?;
            match step {
                Step::Done(state) => {
                    obs::emit_run_finished(
                        run_id.as_str(),
                        attempt,
                        start.elapsed().as_millis() as u64,
                        state.status == RunStatus::Ready,
                    );
                    return Ok(state);
                }
                Step::Retry(next) => {
                    debug!(attempt, "retrying with corrective context");
                    context = next;
                }
            }
        }
    }

    async fn attempt(
        &self,
        run_id: &RunId,
        prompt: &str,
        destination: Option<&CommitDestination>,
        attempt: u32,
        context: Option<FixContext>,
    ) -> Result<Step> {
        let retries_left = attempt < self.config.max_attempts;

        self.enter(run_id, RunPhase::Generating, attempt).await?;
        let files = match self.generator.generate(prompt, context.as_ref()).await {
            Ok(files) => files,
            Err(err) => {
                warn!(attempt, error = %err, "generation failed");
                if err.is_recoverable() && retries_left {
                    return Ok(Step::Retry(context));
                }
                return self.fail(run_id, err.to_string()).await.map(Step::Done);
            }
        };
        info!(attempt, files = files.len(), "generated files");

        if self.config.commit_stage == CommitStage::BeforeBuild {
            if let Some(dest) = destination {
                if let Err(err) = self.commit(run_id, dest, &files, attempt).await {
                    return self.fail(run_id, err.to_string()).await.map(Step::Done);
                }
            }
        }

        self.enter(run_id, RunPhase::Building, attempt).await?;
        let build_number = self.registry.get(run_id).await?.attempts.len() as u32 + 1;
        let report = self.builder.build(run_id, build_number, &files).await;
        let excerpt = report.raw_error().map(|raw| extract(&raw));

        self.registry
            .update(
                run_id,
                RunPatch::attempt(BuildAttempt {
                    run_id: run_id.clone(),
                    attempt_number: build_number,
                    work_dir: report.work_dir.clone(),
                    outcome: if report.succeeded() {
                        AttemptOutcome::Success
                    } else {
                        AttemptOutcome::Failure
                    },
                    error_excerpt: excerpt.clone(),
                    duration_ms: report.duration_ms,
                }),
            )
            .await?;
        obs::emit_build_attempt(
            run_id.as_str(),
            build_number,
            report.succeeded(),
            report.duration_ms,
        );

        match report.outcome {
            BuildOutcome::Success { artifact_path } => {
                if self.config.commit_stage == CommitStage::AfterBuild {
                    if let Some(dest) = destination {
                        if let Err(err) = self.commit(run_id, dest, &files, attempt).await {
                            return self.fail(run_id, err.to_string()).await.map(Step::Done);
                        }
                    }
                }
                let state = self
                    .registry
                    .update(run_id, RunPatch::ready(artifact_path))
                    .await?;
                obs::emit_phase_changed(run_id.as_str(), RunPhase::Ready.as_str(), attempt);
                Ok(Step::Done(state))
            }
            BuildOutcome::Failure(err) => {
                let excerpt = excerpt.unwrap_or_else(|| err.to_string());
                if err.is_recoverable() && retries_left {
                    Ok(Step::Retry(Some(FixContext {
                        previous: files,
                        error_excerpt: excerpt,
                    })))
                } else {
                    self.fail(run_id, excerpt).await.map(Step::Done)
                }
            }
        }
    }

    async fn commit(
        &self,
        run_id: &RunId,
        dest: &CommitDestination,
        files: &FileSet,
        attempt: u32,
    ) -> Result<()> {
        let committer = self.committer.as_ref().ok_or_else(|| {
            SiteError::InternalInvariantViolation("commit requested without a committer".into())
        })?;
        self.enter(run_id, RunPhase::Committing, attempt).await?;

        let message = if attempt == 1 {
            "Initial site generation".to_string()
        } else {
            format!("Fix build errors (attempt {attempt})")
        };
        let lock = self.locks.lock_for(run_id);
        let _guard = lock.lock().await;
        let result = committer
            .commit(&dest.target, &dest.branch, files, &message)
            .await?;
        self.registry
            .update(
                run_id,
                RunPatch::committed(dest.coordinates(), result.commit_id.as_str()),
            )
            .await?;
        Ok(())
    }

    async fn enter(&self, run_id: &RunId, phase: RunPhase, attempt: u32) -> Result<RunState> {
        let state = self.registry.update(run_id, RunPatch::phase(phase)).await?;
        obs::emit_phase_changed(run_id.as_str(), phase.as_str(), attempt);
        Ok(state)
    }

    async fn fail(&self, run_id: &RunId, message: String) -> Result<RunState> {
        let message = truncate_chars(&message, DEFAULT_MAX_CHARS);
        let state = self
            .registry
            .update(run_id, RunPatch::failed(message))
            .await?;
        obs::emit_phase_changed(run_id.as_str(), RunPhase::Failed.as_str(), 0);
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use sitegen_core::{FileEntry, MemoryRepoHost, MemoryRunRegistry};

    use super::*;
    use crate::build::BuildReport;

    /// Builder that fails the first `failures` builds.
    struct FlakyBuilder {
        failures: u32,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl SiteBuilder for FlakyBuilder {
        async fn build(&self, run_id: &RunId, _attempt: u32, _files: &FileSet) -> BuildReport {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            let outcome = if call <= self.failures {
                BuildOutcome::Failure(SiteError::ProcessFailure {
                    command: "npm run build".into(),
                    exit_code: 1,
                    output: "noise\nType error: Foo is not defined\n  at x".into(),
                })
            } else {
                BuildOutcome::Success {
                    artifact_path: PathBuf::from(format!("/srv/{run_id}")),
                }
            };
            BuildReport {
                work_dir: PathBuf::from("/tmp/gone"),
                duration_ms: 5,
                outcome,
            }
        }
    }

    struct FixedGenerator;

    #[async_trait]
    impl FileGenerator for FixedGenerator {
        async fn generate(&self, _prompt: &str, _ctx: Option<&FixContext>) -> Result<FileSet> {
            FileSet::new(vec![FileEntry::utf8("app/page.tsx", "export default 1")])
        }
    }

    fn pipeline(
        registry: Arc<MemoryRunRegistry>,
        failures: u32,
        config: PipelineConfig,
    ) -> GenerateFixLoop {
        GenerateFixLoop::new(
            registry,
            Arc::new(FixedGenerator),
            Arc::new(FlakyBuilder {
                failures,
                calls: Mutex::new(0),
            }),
            config,
        )
    }

    #[tokio::test]
    async fn exhausted_builds_fail_with_last_excerpt() {
        let registry = Arc::new(MemoryRunRegistry::new());
        let run = registry.create("site").await.unwrap();
        let state = pipeline(registry.clone(), 10, PipelineConfig::default())
            .run(&run.run_id, "site", None)
            .await
            .unwrap();

        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.attempts.len(), 3);
        assert_eq!(
            state.build_error.as_deref(),
            Some("Type error: Foo is not defined\n  at x")
        );
        assert!(state.artifact_path.is_none());
    }

    #[tokio::test]
    async fn max_attempts_is_configurable() {
        let registry = Arc::new(MemoryRunRegistry::new());
        let run = registry.create("site").await.unwrap();
        let config = PipelineConfig {
            max_attempts: 1,
            commit_stage: CommitStage::Disabled,
        };
        let state = pipeline(registry.clone(), 1, config)
            .run(&run.run_id, "site", None)
            .await
            .unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.attempts.len(), 1);
    }

    #[tokio::test]
    async fn after_build_commits_only_the_passing_version() {
        let registry = Arc::new(MemoryRunRegistry::new());
        let run = registry.create("site").await.unwrap();
        let target = RepoTarget::new("acme", "site");
        let host = Arc::new(MemoryRepoHost::with_repository(&target));
        let committer = Arc::new(BlobTreeCommitter::new(host.clone()));
        let config = PipelineConfig {
            max_attempts: 3,
            commit_stage: CommitStage::AfterBuild,
        };
        let dest = CommitDestination {
            target: target.clone(),
            branch: "main".into(),
        };

        let state = pipeline(registry.clone(), 1, config)
            .with_committer(committer)
            .run(&run.run_id, "site", Some(&dest))
            .await
            .unwrap();

        assert_eq!(state.status, RunStatus::Ready);
        assert_eq!(host.history(&target, "main").len(), 1);
        assert_eq!(state.repository, Some(dest.coordinates()));
        assert_eq!(
            state.last_commit_id.as_deref(),
            Some(host.history(&target, "main")[0].as_str())
        );
    }

    #[tokio::test]
    async fn unavailable_remote_is_terminal() {
        let registry = Arc::new(MemoryRunRegistry::new());
        let run = registry.create("site").await.unwrap();
        let target = RepoTarget::new("acme", "site");
        let host = Arc::new(MemoryRepoHost::with_repository(&target));
        host.set_unavailable(true);
        let dest = CommitDestination {
            target,
            branch: "main".into(),
        };

        let state = pipeline(registry.clone(), 0, PipelineConfig::default())
            .with_committer(Arc::new(BlobTreeCommitter::new(host)))
            .run(&run.run_id, "site", Some(&dest))
            .await
            .unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert!(state.attempts.is_empty());
        assert!(state.build_error.is_some());
    }
}
