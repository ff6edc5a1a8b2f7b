//! sitegen - prompt-to-site pipeline CLI
//!
//! ## Commands
//!
//! - `run`: generate, commit and build a site from a prompt
//! - `build`: validate a local site directory with the build runner
//! - `push`: commit a local directory to a repository as one commit
//! - `extract`: print the error excerpt of a build log

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};

use sitegen_ci::{
    BuildConfig, BuildOutcome, BuildRunner, CommitOptions, RunMode, RunOptions, SiteBuilder,
    SiteService,
};
use sitegen_core::obs::RunSpan;
use sitegen_core::{
    BlobTreeCommitter, ChatCompletionsGenerator, FileEntry, FileSet, GithubRepoHost,
    MemoryRunRegistry, RepoTarget, RunId, RunStatus, SitegenConfig,
};

/// Directories never read from a local site.
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", ".next", "out"];

#[derive(Parser)]
#[command(name = "sitegen")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Generate, commit and build static sites from prompts", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a site from a prompt, commit it and build it
    Run {
        /// What the site should be
        prompt: String,

        /// Target repository as owner/name (default: derived from the prompt)
        #[arg(long)]
        repo: Option<String>,

        /// Branch to commit to
        #[arg(long, default_value = "main")]
        branch: String,

        /// Build only; do not commit
        #[arg(long)]
        no_commit: bool,
    },

    /// Build a local site directory and report the outcome
    Build {
        /// Site directory
        dir: PathBuf,
    },

    /// Commit a local directory to a repository as a single commit
    Push {
        /// Site directory
        dir: PathBuf,

        /// Target repository as owner/name
        #[arg(long)]
        repo: String,

        /// Branch to commit to
        #[arg(long, default_value = "main")]
        branch: String,

        /// Commit message
        #[arg(short, long, default_value = "Update site")]
        message: String,
    },

    /// Print the error excerpt extracted from a build log
    Extract {
        /// Log file to read
        log_file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    sitegen_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            prompt,
            repo,
            branch,
            no_commit,
        } => {
            let config = SitegenConfig::from_env().context("Invalid configuration")?;
            cmd_run(&config, &prompt, repo.as_deref(), &branch, no_commit).await
        }
        Commands::Build { dir } => {
            let config = SitegenConfig::from_env().context("Invalid configuration")?;
            cmd_build(&config, &dir).await
        }
        Commands::Push {
            dir,
            repo,
            branch,
            message,
        } => {
            let config = SitegenConfig::from_env().context("Invalid configuration")?;
            cmd_push(&config, &dir, &repo, &branch, &message).await
        }
        Commands::Extract { log_file } => cmd_extract(&log_file),
    }
}

async fn cmd_run(
    config: &SitegenConfig,
    prompt: &str,
    repo: Option<&str>,
    branch: &str,
    no_commit: bool,
) -> Result<()> {
    let generator = ChatCompletionsGenerator::new(config.generator.clone())
        .context("Failed to create generator client")?;
    let builder = BuildRunner::new(BuildConfig::from_settings(&config.build));
    let mut service = SiteService::new(
        Arc::new(MemoryRunRegistry::new()),
        Arc::new(generator),
        Arc::new(builder),
        config.pipeline.clone(),
    );

    let commit = if no_commit {
        None
    } else {
        let host = GithubRepoHost::new(&config.github)
            .context("Committing needs SITEGEN_GITHUB_TOKEN (or pass --no-commit)")?;
        service = service.with_committer(
            Arc::new(BlobTreeCommitter::new(Arc::new(host))),
            config.github.owner.clone(),
        );
        let target = repo.map(RepoTarget::parse).transpose()?;
        Some(CommitOptions {
            owner: target.as_ref().map(|t| t.owner.clone()),
            repo: target.map(|t| t.repo),
            branch: Some(branch.to_string()),
            create_repository: true,
        })
    };

    let run_id = service
        .start_run(
            prompt,
            RunOptions {
                mode: RunMode::Awaited,
                commit,
            },
        )
        .await?;
    let state = service.get_run_status(&run_id).await?;

    println!("Run:       {}", state.run_id);
    println!("Status:    {:?}", state.status);
    println!("Attempts:  {}", state.attempts.len());
    if let Some(repo) = &state.repository {
        println!("Repo:      {}/{} ({})", repo.owner, repo.repo, repo.branch);
    }
    if let Some(commit) = &state.last_commit_id {
        println!("Commit:    {commit}");
    }
    if let Some(path) = &state.artifact_path {
        println!("Artifact:  {}", path.display());
    }
    if let Some(error) = &state.build_error {
        println!("\n{error}");
    }

    if state.status != RunStatus::Ready {
        bail!("run {} did not produce a site", state.run_id);
    }
    Ok(())
}

async fn cmd_build(config: &SitegenConfig, dir: &Path) -> Result<()> {
    let files = load_site_dir(dir)?;
    let run_id = RunId::new();
    let _span = RunSpan::enter(run_id.as_str());
    info!(files = files.len(), dir = %dir.display(), "building local site");

    let runner = BuildRunner::new(BuildConfig::from_settings(&config.build));
    let report = runner.build(&run_id, 1, &files).await;

    match &report.outcome {
        BuildOutcome::Success { artifact_path } => {
            println!("Build succeeded in {} ms", report.duration_ms);
            println!("Artifact:  {}", artifact_path.display());
            Ok(())
        }
        BuildOutcome::Failure(_) => {
            let raw = report.raw_error().unwrap_or_default();
            println!("Build failed after {} ms\n", report.duration_ms);
            println!("{}", sitegen_core::extract(&raw));
            bail!("build failed")
        }
    }
}

async fn cmd_push(
    config: &SitegenConfig,
    dir: &Path,
    repo: &str,
    branch: &str,
    message: &str,
) -> Result<()> {
    let target = RepoTarget::parse(repo)?;
    let files = load_site_dir(dir)?;
    let host = GithubRepoHost::new(&config.github).context("Pushing needs SITEGEN_GITHUB_TOKEN")?;
    let committer = BlobTreeCommitter::new(Arc::new(host));

    let result = committer
        .commit(&target, branch, &files, message)
        .await
        .with_context(|| format!("Failed to commit to {target}"))?;

    println!("[{}] {} ({})", branch, message, result.commit_id.short());
    println!("Commit:    {}", result.commit_id);
    println!("Files:     {}", files.len());
    println!("Ref:       {:?}", result.branch_advanced);
    Ok(())
}

fn cmd_extract(log_file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(log_file)
        .with_context(|| format!("Failed to read log file: {}", log_file.display()))?;
    println!("{}", sitegen_core::extract(&raw));
    Ok(())
}

/// Read every file under `dir` into a file set, skipping dependency and
/// output directories. Non-UTF-8 files are carried as base64.
fn load_site_dir(dir: &Path) -> Result<FileSet> {
    let walker = walkdir::WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir()
                    && SKIPPED_DIRS.iter().any(|s| e.file_name() == *s))
        });

    let mut entries = Vec::new();
    for entry in walker {
        let entry = entry.context("Failed to walk site directory")?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .context("Walked outside the site directory")?
            .to_string_lossy()
            .replace('\\', "/");
        let bytes = std::fs::read(entry.path())
            .with_context(|| format!("Failed to read {}", entry.path().display()))?;
        entries.push(match String::from_utf8(bytes) {
            Ok(text) => FileEntry::utf8(relative, text),
            Err(e) => FileEntry::binary(relative, e.as_bytes()),
        });
    }
    FileSet::new(entries).with_context(|| format!("No usable files in {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitegen_core::FileEncoding;

    #[test]
    fn load_site_dir_skips_build_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("app")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/react")).unwrap();
        std::fs::create_dir_all(root.join("out")).unwrap();
        std::fs::write(root.join("app/page.tsx"), "export default 1").unwrap();
        std::fs::write(root.join("package.json"), "{}").unwrap();
        std::fs::write(root.join("logo.bin"), [0xff, 0x00, 0xfe]).unwrap();
        std::fs::write(root.join("node_modules/react/index.js"), "x").unwrap();
        std::fs::write(root.join("out/index.html"), "x").unwrap();

        let files = load_site_dir(root).unwrap();
        let mut paths: Vec<&str> = files.paths().collect();
        paths.sort();
        assert_eq!(paths, vec!["app/page.tsx", "logo.bin", "package.json"]);
        let logo = files.get("logo.bin").unwrap();
        assert_eq!(logo.encoding, FileEncoding::Base64);
        assert_eq!(logo.decoded().unwrap(), vec![0xff, 0x00, 0xfe]);
    }

    #[test]
    fn load_empty_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_site_dir(dir.path()).is_err());
    }

    #[test]
    fn cli_parses_run() {
        let cli = Cli::try_parse_from([
            "sitegen", "--json", "run", "todo app", "--repo", "acme/todo", "--no-commit",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Run {
                prompt,
                repo,
                branch,
                no_commit,
            } => {
                assert_eq!(prompt, "todo app");
                assert_eq!(repo.as_deref(), Some("acme/todo"));
                assert_eq!(branch, "main");
                assert!(no_commit);
            }
            _ => panic!("expected run"),
        }
    }
}
