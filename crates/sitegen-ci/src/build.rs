//! Isolated site builds.
//!
//! [`BuildRunner`] materializes a [`FileSet`] into a fresh working directory,
//! runs the configured commands there, copies the output directory to a
//! run-keyed artifact location and always removes the working directory.

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use sitegen_core::{BuildSettings, FileEntry, FileSet, Result, RunId, SiteError};
use tracing::{debug, info, warn};

use crate::runner::CommandRunner;
use crate::stage::BuildCommand;

/// Build runner configuration.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub commands: Vec<BuildCommand>,
    pub work_root: PathBuf,
    pub artifact_root: PathBuf,
    pub output_dir: String,
    pub forced_files: Vec<FileEntry>,
    pub shadowed_paths: Vec<String>,
}

impl BuildConfig {
    pub fn from_settings(settings: &BuildSettings) -> Self {
        Self {
            commands: settings
                .commands
                .iter()
                .map(|line| BuildCommand::from_line(line, settings.timeout_secs))
                .collect(),
            work_root: settings.work_root.clone(),
            artifact_root: settings.artifact_root.clone(),
            output_dir: settings.output_dir.clone(),
            forced_files: settings.forced_files.clone(),
            shadowed_paths: settings.shadowed_paths.clone(),
        }
    }

    pub fn with_commands(mut self, commands: Vec<BuildCommand>) -> Self {
        self.commands = commands;
        self
    }

    /// Artifact directory for `run_id`.
    pub fn artifact_dir(&self, run_id: &RunId) -> PathBuf {
        self.artifact_root.join(run_id.as_str())
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self::from_settings(&BuildSettings::default())
    }
}

/// How a sealed build attempt ended.
#[derive(Debug)]
pub enum BuildOutcome {
    Success { artifact_path: PathBuf },
    Failure(SiteError),
}

/// A sealed build attempt.
#[derive(Debug)]
pub struct BuildReport {
    /// Working directory used by the attempt. Already removed.
    pub work_dir: PathBuf,
    pub duration_ms: u64,
    pub outcome: BuildOutcome,
}

impl BuildReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, BuildOutcome::Success { .. })
    }

    /// Raw text for the error extractor. `None` on success.
    pub fn raw_error(&self) -> Option<String> {
        match &self.outcome {
            BuildOutcome::Success { .. } => None,
            BuildOutcome::Failure(err) => Some(
                err.raw_output()
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string()),
            ),
        }
    }
}

/// Validates that a file set builds.
#[async_trait]
pub trait SiteBuilder: Send + Sync {
    /// Build `files` as attempt `attempt` of `run_id`. Never fails outright;
    /// failures are carried in the report.
    async fn build(&self, run_id: &RunId, attempt: u32, files: &FileSet) -> BuildReport;
}

/// [`SiteBuilder`] running external commands in a temporary directory.
pub struct BuildRunner {
    config: BuildConfig,
}

impl BuildRunner {
    pub fn new(config: BuildConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Build with an explicit command list instead of the configured one.
    pub async fn build_with(
        &self,
        run_id: &RunId,
        attempt: u32,
        files: &FileSet,
        commands: &[BuildCommand],
    ) -> BuildReport {
        let start = Instant::now();

        let work_dir = match self.allocate(run_id, attempt).await {
            Ok(dir) => dir,
            Err(err) => {
                return BuildReport {
                    work_dir: self.config.work_root.clone(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    outcome: BuildOutcome::Failure(err),
                }
            }
        };
        let work_path = work_dir.path().to_path_buf();
        debug!(
            run_id = %run_id,
            attempt,
            work_dir = %work_path.display(),
            "allocated working directory"
        );

        let result = self.run_in(run_id, &work_path, files, commands).await;

        if let Err(e) = work_dir.close() {
            warn!(run_id = %run_id, attempt, error = %e, "failed to remove working directory");
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let outcome = match result {
            Ok(artifact_path) => {
                info!(
                    run_id = %run_id,
                    attempt,
                    duration_ms,
                    artifact = %artifact_path.display(),
                    "build succeeded"
                );
                BuildOutcome::Success { artifact_path }
            }
            Err(err) => {
                info!(run_id = %run_id, attempt, duration_ms, error = %err, "build failed");
                BuildOutcome::Failure(err)
            }
        };
        BuildReport {
            work_dir: work_path,
            duration_ms,
            outcome,
        }
    }

    async fn allocate(&self, run_id: &RunId, attempt: u32) -> Result<tempfile::TempDir> {
        tokio::fs::create_dir_all(&self.config.work_root)
            .await
            .map_err(|e| SiteError::WriteFailure {
                path: self.config.work_root.display().to_string(),
                reason: e.to_string(),
            })?;
        tempfile::Builder::new()
            .prefix(&format!("{run_id}-attempt-{attempt}-"))
            .tempdir_in(&self.config.work_root)
            .map_err(|e| SiteError::WriteFailure {
                path: self.config.work_root.display().to_string(),
                reason: e.to_string(),
            })
    }

    async fn run_in(
        &self,
        run_id: &RunId,
        work_dir: &Path,
        files: &FileSet,
        commands: &[BuildCommand],
    ) -> Result<PathBuf> {
        self.materialize(work_dir, files).await?;

        for command in commands {
            let output = CommandRunner::execute(command, work_dir).await?;
            debug!(
                command = %output.name,
                exit_code = output.exit_code,
                duration_ms = output.duration_ms,
                "command finished"
            );
            if !output.passed() {
                return Err(SiteError::ProcessFailure {
                    command: output.name.clone(),
                    exit_code: output.exit_code,
                    output: output.combined(),
                });
            }
        }

        let produced = work_dir.join(&self.config.output_dir);
        if !produced.is_dir() {
            return Err(SiteError::ProcessFailure {
                command: "collect output".to_string(),
                exit_code: 0,
                output: format!(
                    "Error: build finished but produced no '{}' directory",
                    self.config.output_dir
                ),
            });
        }

        let artifact = self.config.artifact_dir(run_id);
        publish(produced, artifact.clone()).await?;
        Ok(artifact)
    }

    async fn materialize(&self, work_dir: &Path, files: &FileSet) -> Result<()> {
        let shadowed = |path: &str| {
            self.config.shadowed_paths.iter().any(|s| s == path)
                || self.config.forced_files.iter().any(|f| f.path == path)
        };

        for entry in files.iter().filter(|e| !shadowed(&e.path)) {
            write_entry(work_dir, entry).await?;
        }
        for entry in &self.config.forced_files {
            write_entry(work_dir, entry).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SiteBuilder for BuildRunner {
    async fn build(&self, run_id: &RunId, attempt: u32, files: &FileSet) -> BuildReport {
        self.build_with(run_id, attempt, files, &self.config.commands)
            .await
    }
}

async fn write_entry(work_dir: &Path, entry: &FileEntry) -> Result<()> {
    let write_failure = |reason: String| SiteError::WriteFailure {
        path: entry.path.clone(),
        reason,
    };
    let bytes = entry.decoded().map_err(|e| write_failure(e.to_string()))?;
    let target = work_dir.join(&entry.path);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| write_failure(e.to_string()))?;
    }
    tokio::fs::write(&target, bytes)
        .await
        .map_err(|e| write_failure(e.to_string()))
}

/// Replace `dest` with a copy of `src`.
async fn publish(src: PathBuf, dest: PathBuf) -> Result<()> {
    let label = dest.display().to_string();
    tokio::task::spawn_blocking(move || copy_tree(&src, &dest))
        .await
        .map_err(|e| SiteError::WriteFailure {
            path: label.clone(),
            reason: format!("copy task failed: {e}"),
        })?
        .map_err(|e| SiteError::WriteFailure {
            path: label,
            reason: e.to_string(),
        })
}

fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    if dest.exists() {
        std::fs::remove_dir_all(dest)?;
    }
    std::fs::create_dir_all(dest)?;
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(std::io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
