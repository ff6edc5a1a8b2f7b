//! sitegend - HTTP service for prompt-to-site runs.
//!
//! Exposes run creation, status polling and incremental changes under
//! `/api`, and serves the artifacts of ready runs under `/sites/{run_id}/`.

mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};

use sitegen_ci::{BuildConfig, BuildRunner, SiteService};
use sitegen_core::{
    BlobTreeCommitter, ChatCompletionsGenerator, GithubRepoHost, MemoryRepoHost,
    MemoryRunRegistry, RepoHost, SitegenConfig,
};

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "sitegend")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "HTTP service for generating, committing and serving sites")]
struct Args {
    /// Address to bind the server to
    #[arg(long, env = "SITEGEN_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, env = "SITEGEN_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    sitegen_core::init_tracing(args.json, level);

    let config = SitegenConfig::from_env().context("Invalid configuration")?;

    let (host, owner): (Arc<dyn RepoHost>, Option<String>) = if config.github.token.is_some() {
        let host = GithubRepoHost::new(&config.github).context("Failed to create GitHub client")?;
        (Arc::new(host), config.github.owner.clone())
    } else {
        warn!("SITEGEN_GITHUB_TOKEN not set, committing to an in-memory repository host");
        let owner = config.github.owner.clone().unwrap_or_else(|| "sitegen".to_string());
        (Arc::new(MemoryRepoHost::new()), Some(owner))
    };

    let generator = ChatCompletionsGenerator::new(config.generator.clone())
        .context("Failed to create generator client")?;
    let build = BuildConfig::from_settings(&config.build);
    let artifact_root = build.artifact_root.clone();

    let service = SiteService::new(
        Arc::new(MemoryRunRegistry::new()),
        Arc::new(generator),
        Arc::new(BuildRunner::new(build)),
        config.pipeline.clone(),
    )
    .with_committer(Arc::new(BlobTreeCommitter::new(host)), owner);

    let app = routes::router(AppState::new(service, artifact_root.clone()));

    info!(
        addr = %args.bind,
        artifact_root = %artifact_root.display(),
        max_attempts = config.pipeline.max_attempts,
        commit_stage = ?config.pipeline.commit_stage,
        "listening"
    );
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
