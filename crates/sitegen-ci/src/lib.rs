//! Sitegen CI - site build validation and the generate/fix pipeline
//!
//! Provides:
//! - Isolated build execution with per-command timeouts
//! - The bounded generate → commit → build → fix state machine
//! - Ordered incremental changes against a run's repository
//! - The `SiteService` facade used by the CLI and the daemon

pub mod build;
pub mod changes;
pub mod pipeline;
pub mod runner;
pub mod service;
pub mod stage;

// Re-export key types
pub use build::{BuildConfig, BuildOutcome, BuildReport, BuildRunner, SiteBuilder};
pub use changes::{apply_changes, ChangeOutcome, ChangeResult, RunLocks};
pub use pipeline::{CommitDestination, GenerateFixLoop, PipelineConfig};
pub use runner::{CommandOutput, CommandRunner};
pub use service::{derive_repo_name, CommitOptions, RunMode, RunOptions, SiteService};
pub use stage::BuildCommand;
