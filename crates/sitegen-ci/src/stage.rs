//! Build command definitions.

use serde::{Deserialize, Serialize};

/// One external process invocation in a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildCommand {
    /// Human-readable name used in logs and errors.
    pub name: String,

    /// Command to execute (first element is executable).
    pub command: Vec<String>,

    /// Wall-clock ceiling in seconds. Zero disables the ceiling.
    pub timeout_secs: u64,
}

impl BuildCommand {
    pub fn new(name: impl Into<String>, command: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            name: name.into(),
            command,
            timeout_secs,
        }
    }

    /// Split a command line on whitespace. The line itself is the name.
    pub fn from_line(line: &str, timeout_secs: u64) -> Self {
        let command = line.split_whitespace().map(str::to_string).collect();
        Self::new(line.trim(), command, timeout_secs)
    }

    /// Run `script` through `sh -c`.
    pub fn shell(name: impl Into<String>, script: &str, timeout_secs: u64) -> Self {
        Self::new(
            name,
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout_secs,
        )
    }

    /// The default Next.js install and build commands.
    pub fn npm_defaults(timeout_secs: u64) -> Vec<Self> {
        vec![
            Self::from_line("npm install --no-audit --no-fund", timeout_secs),
            Self::from_line("npm run build", timeout_secs),
        ]
    }
}
