//! Request-facing facade: start runs, report status, apply changes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sitegen_core::commit::{BlobTreeCommitter, TreeChange};
use sitegen_core::obs;
use sitegen_core::repo::{HostError, RepoTarget};
use sitegen_core::{
    CommitStage, FileGenerator, PipelineSettings, Result, RunId, RunPatch, RunRegistry, RunState,
    SiteError,
};
use tracing::{debug, info, warn};

use crate::build::SiteBuilder;
use crate::changes::{apply_changes, ChangeResult, RunLocks};
use crate::pipeline::{CommitDestination, GenerateFixLoop, PipelineConfig};

/// Longest accepted prompt, in characters.
pub const MAX_PROMPT_CHARS: usize = 8000;

const MAX_SLUG_CHARS: usize = 40;

/// Whether `start_run` returns immediately or after the run finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Detached,
    Awaited,
}

/// Where and how a run's files are committed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitOptions {
    /// Repository owner. Falls back to the service default.
    pub owner: Option<String>,
    /// Repository name. Derived from the prompt when absent.
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub create_repository: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub mode: RunMode,
    pub commit: Option<CommitOptions>,
}

/// Commit target resolved before the run exists.
struct PlannedCommit {
    owner: String,
    repo: Option<String>,
    branch: String,
    create_repository: bool,
}

impl PlannedCommit {
    fn destination(self, prompt: &str, run_id: &RunId) -> (CommitDestination, bool) {
        let repo = self
            .repo
            .unwrap_or_else(|| derive_repo_name(prompt, run_id));
        (
            CommitDestination {
                target: RepoTarget::new(self.owner, repo),
                branch: self.branch,
            },
            self.create_repository,
        )
    }
}

/// Owns the registry, generator, builder and optional committer.
#[derive(Clone)]
pub struct SiteService {
    registry: Arc<dyn RunRegistry>,
    generator: Arc<dyn FileGenerator>,
    builder: Arc<dyn SiteBuilder>,
    committer: Option<Arc<BlobTreeCommitter>>,
    default_owner: Option<String>,
    locks: Arc<RunLocks>,
    settings: PipelineSettings,
}

impl SiteService {
    pub fn new(
        registry: Arc<dyn RunRegistry>,
        generator: Arc<dyn FileGenerator>,
        builder: Arc<dyn SiteBuilder>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            registry,
            generator,
            builder,
            committer: None,
            default_owner: None,
            locks: Arc::new(RunLocks::default()),
            settings,
        }
    }

    pub fn with_committer(
        mut self,
        committer: Arc<BlobTreeCommitter>,
        default_owner: Option<String>,
    ) -> Self {
        self.committer = Some(committer);
        self.default_owner = default_owner;
        self
    }

    pub fn registry(&self) -> &Arc<dyn RunRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    fn pipeline(&self) -> GenerateFixLoop {
        let pipeline = GenerateFixLoop::new(
            self.registry.clone(),
            self.generator.clone(),
            self.builder.clone(),
            PipelineConfig::from_settings(&self.settings),
        )
        .with_locks(self.locks.clone());
        match &self.committer {
            Some(committer) => pipeline.with_committer(committer.clone()),
            None => pipeline,
        }
    }

    /// Validate `prompt`, register a run and drive it per `options.mode`.
    pub async fn start_run(&self, prompt: &str, options: RunOptions) -> Result<RunId> {
        let prompt = validate_prompt(prompt)?;
        let planned = match options.commit {
            Some(commit) if self.settings.commit_stage != CommitStage::Disabled => {
                Some(self.plan_commit(commit)?)
            }
            _ => None,
        };

        let run = self.registry.create(&prompt).await?;
        let run_id = run.run_id;
        obs::emit_run_started(run_id.as_str(), self.settings.max_attempts);
        let planned = planned.map(|p| p.destination(&prompt, &run_id));

        match options.mode {
            RunMode::Detached => {
                let service = self.clone();
                let id = run_id.clone();
                tokio::spawn(async move {
                    service.execute(&id, &prompt, planned).await;
                });
            }
            RunMode::Awaited => self.execute(&run_id, &prompt, planned).await,
        }
        Ok(run_id)
    }

    pub async fn get_run_status(&self, run_id: &RunId) -> Result<RunState> {
        self.registry.get(run_id).await
    }

    pub async fn list_runs(&self) -> Result<Vec<RunState>> {
        self.registry.list().await
    }

    /// Apply `ops` to the run's repository in order, one commit each.
    ///
    /// Batches for the same run never interleave with each other or with the
    /// run's own pipeline commits.
    pub async fn apply_changes(
        &self,
        run_id: &RunId,
        ops: Vec<TreeChange>,
    ) -> Result<Vec<ChangeResult>> {
        if ops.is_empty() {
            return Err(SiteError::Validation("no change operations given".into()));
        }
        let state = self.registry.get(run_id).await?;
        let repository = state.repository.ok_or_else(|| {
            SiteError::Validation(format!("run {run_id} has no repository yet"))
        })?;
        let committer = self.committer.as_ref().ok_or_else(|| {
            SiteError::Validation("no repository host is configured".into())
        })?;
        let target = RepoTarget::new(repository.owner.clone(), repository.repo.clone());

        let lock = self.locks.lock_for(run_id);
        let _guard = lock.lock().await;
        let results = apply_changes(committer, &target, &repository.branch, ops).await;

        if let Some(last) = results.iter().rev().find_map(ChangeResult::committed_id) {
            self.registry
                .update(run_id, RunPatch::committed(repository.clone(), last))
                .await?;
        }
        let applied = results.iter().filter(|r| r.committed_id().is_some()).count();
        obs::emit_changes_applied(run_id.as_str(), applied, results.len() - applied);
        Ok(results)
    }

    fn plan_commit(&self, options: CommitOptions) -> Result<PlannedCommit> {
        if self.committer.is_none() {
            return Err(SiteError::Validation(
                "commit requested but no repository host is configured".into(),
            ));
        }
        let owner = options
            .owner
            .or_else(|| self.default_owner.clone())
            .ok_or_else(|| SiteError::Validation("repository owner is required".into()))?;
        let branch = options
            .branch
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| self.settings.default_branch.clone());
        Ok(PlannedCommit {
            owner,
            repo: options.repo,
            branch,
            create_repository: options.create_repository,
        })
    }

    async fn execute(
        &self,
        run_id: &RunId,
        prompt: &str,
        planned: Option<(CommitDestination, bool)>,
    ) {
        if let Some((dest, true)) = &planned {
            if let Err(err) = self.provision(&dest.target).await {
                self.record_failure(run_id, &err).await;
                return;
            }
        }
        let destination = planned.as_ref().map(|(dest, _)| dest);
        match self.pipeline().run(run_id, prompt, destination).await {
            Ok(state) => info!(run_id = %run_id, status = ?state.status, "run finished"),
            Err(err) => self.record_failure(run_id, &err).await,
        }
    }

    async fn provision(&self, target: &RepoTarget) -> Result<()> {
        let Some(committer) = &self.committer else {
            return Ok(());
        };
        match committer
            .host()
            .create_repository(target, self.settings.private_repositories)
            .await
        {
            Ok(()) => {
                info!(repo = %target, "created repository");
                Ok(())
            }
            Err(HostError::Conflict(_)) => {
                info!(repo = %target, "repository already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn record_failure(&self, run_id: &RunId, err: &SiteError) {
        obs::emit_run_finalize_error(run_id.as_str(), err);
        if let Err(e) = self
            .registry
            .update(run_id, RunPatch::failed(err.to_string()))
            .await
        {
            warn!(run_id = %run_id, error = %e, "could not mark run failed");
        }
    }
}

/// Trim and bound a prompt.
pub fn validate_prompt(prompt: &str) -> Result<String> {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return Err(SiteError::Validation("prompt must not be empty".into()));
    }
    let chars = trimmed.chars().count();
    if chars > MAX_PROMPT_CHARS {
        debug!(chars, "prompt too long");
        return Err(SiteError::Validation(format!(
            "prompt is {chars} characters, limit is {MAX_PROMPT_CHARS}"
        )));
    }
    Ok(trimmed.to_string())
}

/// Repository name for a run: a lowercase slug of the prompt plus the short
/// run id.
pub fn derive_repo_name(prompt: &str, run_id: &RunId) -> String {
    let mut slug = String::new();
    for c in prompt.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
        if slug.len() >= MAX_SLUG_CHARS {
            break;
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        format!("site-{}", run_id.short())
    } else {
        format!("{slug}-{}", run_id.short())
    }
}
