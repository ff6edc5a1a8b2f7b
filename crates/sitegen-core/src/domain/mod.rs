//! Domain models for sitegen.
//!
//! Canonical definitions for the core entities:
//! - `FileSet`: Normalized, deduplicated site files
//! - `RunState`: Lifecycle of one prompt-to-site run
//! - `BuildAttempt`: One sealed build within a run

pub mod error;
pub mod fileset;
pub mod run;

pub use error::{Result, SiteError};
pub use fileset::{normalize_path, FileEncoding, FileEntry, FileSet};
pub use run::{
    AttemptOutcome, BuildAttempt, RepoCoordinates, RunId, RunPatch, RunPhase, RunState,
    RunStatus,
};
