//! Service configuration.
//!
//! Every field has a default; [`SitegenConfig::from_env`] overlays
//! `SITEGEN_*` environment variables on top.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::{FileEntry, Result, SiteError};
use crate::generator::GeneratorConfig;
use crate::repo::GithubConfig;

/// Config file forced into every build so `next build` emits a static export.
pub const STATIC_EXPORT_CONFIG: &str = r#"/** @type {import('next').NextConfig} */
const nextConfig = {
  output: 'export',
  images: { unoptimized: true },
  trailingSlash: true,
};

module.exports = nextConfig;
"#;

/// Where in the fix loop generated files are committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStage {
    /// Commit every generated version before building it.
    #[default]
    BeforeBuild,
    /// Commit only the version that built successfully.
    AfterBuild,
    /// Validate only; never commit.
    Disabled,
}

impl FromStr for CommitStage {
    type Err = SiteError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "before_build" => Ok(CommitStage::BeforeBuild),
            "after_build" => Ok(CommitStage::AfterBuild),
            "disabled" | "none" => Ok(CommitStage::Disabled),
            other => Err(SiteError::Validation(format!(
                "unknown commit stage '{other}'"
            ))),
        }
    }
}

/// Build execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSettings {
    /// Commands run in order inside the working directory.
    pub commands: Vec<String>,

    /// Wall-clock ceiling per command.
    pub timeout_secs: u64,

    /// Parent of per-attempt working directories.
    pub work_root: PathBuf,

    /// Parent of per-run artifact directories.
    pub artifact_root: PathBuf,

    /// Build output directory, relative to the working directory.
    pub output_dir: String,

    /// Files always written over whatever the file set contains.
    pub forced_files: Vec<FileEntry>,

    /// Paths removed from the file set before materialization.
    pub shadowed_paths: Vec<String>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            commands: vec![
                "npm install --no-audit --no-fund".to_string(),
                "npm run build".to_string(),
            ],
            timeout_secs: 300,
            work_root: std::env::temp_dir().join("sitegen-work"),
            artifact_root: PathBuf::from("sites"),
            output_dir: "out".to_string(),
            forced_files: vec![FileEntry::utf8("next.config.js", STATIC_EXPORT_CONFIG)],
            shadowed_paths: vec!["next.config.mjs".to_string(), "next.config.ts".to_string()],
        }
    }
}

/// Fix loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Total generate/build attempts per run, including the first.
    pub max_attempts: u32,
    pub commit_stage: CommitStage,
    pub default_branch: String,
    pub private_repositories: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            commit_stage: CommitStage::default(),
            default_branch: "main".to_string(),
            private_repositories: true,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SitegenConfig {
    pub github: GithubConfig,
    pub generator: GeneratorConfig,
    pub build: BuildSettings,
    pub pipeline: PipelineSettings,
}

impl SitegenConfig {
    /// Defaults overlaid with `SITEGEN_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = SitegenConfig::default();

        if let Some(v) = get("SITEGEN_GITHUB_API") {
            config.github.api_base = v;
        }
        config.github.token = get("SITEGEN_GITHUB_TOKEN").or_else(|| get("GITHUB_TOKEN"));
        config.github.owner = get("SITEGEN_GITHUB_OWNER");
        if let Some(v) = parse(&get, "SITEGEN_GITHUB_OWNER_IS_ORG")? {
            config.github.owner_is_org = v;
        }
        if let Some(v) = parse(&get, "SITEGEN_GITHUB_TIMEOUT_SECS")? {
            config.github.request_timeout_secs = v;
        }

        if let Some(v) = get("SITEGEN_GENERATOR_ENDPOINT") {
            config.generator.endpoint = v;
        }
        config.generator.api_key =
            get("SITEGEN_GENERATOR_API_KEY").or_else(|| get("OPENAI_API_KEY"));
        if let Some(v) = get("SITEGEN_GENERATOR_MODEL") {
            config.generator.model = v;
        }
        if let Some(v) = parse(&get, "SITEGEN_GENERATOR_TIMEOUT_SECS")? {
            config.generator.request_timeout_secs = v;
        }

        if let Some(v) = get("SITEGEN_BUILD_COMMANDS") {
            config.build.commands = v
                .split(';')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = parse(&get, "SITEGEN_BUILD_TIMEOUT_SECS")? {
            config.build.timeout_secs = v;
        }
        if let Some(v) = get("SITEGEN_WORK_ROOT") {
            config.build.work_root = PathBuf::from(v);
        }
        if let Some(v) = get("SITEGEN_ARTIFACT_ROOT") {
            config.build.artifact_root = PathBuf::from(v);
        }
        if let Some(v) = get("SITEGEN_OUTPUT_DIR") {
            config.build.output_dir = v;
        }

        if let Some(v) = parse(&get, "SITEGEN_MAX_ATTEMPTS")? {
            config.pipeline.max_attempts = v;
        }
        if let Some(v) = parse(&get, "SITEGEN_COMMIT_STAGE")? {
            config.pipeline.commit_stage = v;
        }
        if let Some(v) = get("SITEGEN_BRANCH") {
            config.pipeline.default_branch = v;
        }
        if let Some(v) = parse(&get, "SITEGEN_PRIVATE_REPOS")? {
            config.pipeline.private_repositories = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no run could succeed with.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.max_attempts == 0 {
            return Err(SiteError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.build.commands.is_empty() {
            return Err(SiteError::Validation(
                "at least one build command is required".to_string(),
            ));
        }
        if self.build.timeout_secs == 0 {
            return Err(SiteError::Validation(
                "build timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse<T, G>(get: &G, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| SiteError::Validation(format!("invalid {key}='{raw}': {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = SitegenConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.pipeline.max_attempts, 3);
        assert_eq!(config.pipeline.commit_stage, CommitStage::BeforeBuild);
        assert_eq!(config.build.commands.len(), 2);
        assert_eq!(config.build.output_dir, "out");
        assert!(config.github.token.is_none());
        assert!(config.build.forced_files[0].content.contains("output: 'export'"));
    }

    #[test]
    fn env_overrides_apply() {
        let config = SitegenConfig::from_lookup(lookup(&[
            ("SITEGEN_MAX_ATTEMPTS", "5"),
            ("SITEGEN_COMMIT_STAGE", "after-build"),
            ("SITEGEN_BUILD_COMMANDS", "pnpm install; pnpm build ;"),
            ("GITHUB_TOKEN", "ghp_x"),
            ("SITEGEN_BUILD_TIMEOUT_SECS", "60"),
        ]))
        .unwrap();
        assert_eq!(config.pipeline.max_attempts, 5);
        assert_eq!(config.pipeline.commit_stage, CommitStage::AfterBuild);
        assert_eq!(config.build.commands, vec!["pnpm install", "pnpm build"]);
        assert_eq!(config.github.token.as_deref(), Some("ghp_x"));
        assert_eq!(config.build.timeout_secs, 60);
    }

    #[test]
    fn invalid_values_are_errors() {
        let err = SitegenConfig::from_lookup(lookup(&[("SITEGEN_MAX_ATTEMPTS", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("SITEGEN_MAX_ATTEMPTS"));

        assert!(SitegenConfig::from_lookup(lookup(&[("SITEGEN_MAX_ATTEMPTS", "0")])).is_err());
        assert!(
            SitegenConfig::from_lookup(lookup(&[("SITEGEN_COMMIT_STAGE", "sometimes")])).is_err()
        );
    }

    #[test]
    fn commit_stage_parses() {
        assert_eq!("disabled".parse::<CommitStage>().unwrap(), CommitStage::Disabled);
        assert_eq!(
            "BEFORE_BUILD".parse::<CommitStage>().unwrap(),
            CommitStage::BeforeBuild
        );
    }
}
