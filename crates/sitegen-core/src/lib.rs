//! Sitegen Core Library
//!
//! Domain types, build-log extraction, the run registry, remote repository
//! hosts and the atomic blob/tree/commit writer shared by the pipeline, the
//! CLI and the daemon.

pub mod commit;
pub mod config;
pub mod domain;
pub mod extract;
pub mod generator;
pub mod obs;
pub mod registry;
pub mod repo;
pub mod telemetry;

pub use commit::{BlobTreeCommitter, CommitResult, RefUpdate, TreeChange};

pub use config::{BuildSettings, CommitStage, PipelineSettings, SitegenConfig};

pub use domain::{
    normalize_path, AttemptOutcome, BuildAttempt, FileEncoding, FileEntry, FileSet,
    RepoCoordinates, Result, RunId, RunPatch, RunPhase, RunState, RunStatus, SiteError,
};

pub use extract::{extract, extract_with, ExtractorConfig};

pub use generator::{ChatCompletionsGenerator, FileGenerator, FixContext, GeneratorConfig};

pub use registry::{MemoryRunRegistry, RunRegistry};

pub use repo::{
    GithubConfig, GithubRepoHost, HostError, MemoryRepoHost, ObjectId, RepoHost, RepoTarget,
};

pub use telemetry::init_tracing;
