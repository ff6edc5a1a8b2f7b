//! GitHub git-data API client.
//!
//! Status codes are mapped to [`HostError`] in exactly one place
//! ([`map_status`]); callers only ever see the tagged error.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{CommitInfo, HostError, HostResult, ObjectId, RepoHost, RepoTarget, TreeEntry};
use crate::domain::{FileEncoding, FileEntry, Result, SiteError};

const ERROR_BODY_LIMIT: usize = 500;

/// GitHub client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GithubConfig {
    /// API base, e.g. `https://api.github.com`.
    pub api_base: String,

    /// Token with `repo` scope. `None` disables the GitHub host.
    pub token: Option<String>,

    /// Default owner for repositories created by runs.
    pub owner: Option<String>,

    /// Create repositories under `owner` as an organization instead of the
    /// authenticated user.
    pub owner_is_org: bool,

    pub request_timeout_secs: u64,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            token: None,
            owner: None,
            owner_is_org: false,
            request_timeout_secs: 30,
        }
    }
}

/// [`RepoHost`] backed by the GitHub REST API.
pub struct GithubRepoHost {
    http: reqwest::Client,
    api_base: Url,
    owner_is_org: bool,
}

#[derive(Deserialize)]
struct ShaResponse {
    sha: String,
}

#[derive(Deserialize)]
struct RefResponse {
    object: ShaResponse,
}

#[derive(Deserialize)]
struct CommitResponse {
    sha: String,
    tree: ShaResponse,
    #[serde(default)]
    parents: Vec<ShaResponse>,
}

#[derive(Deserialize)]
struct ContentResponse {
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: String,
}

impl GithubRepoHost {
    /// Build a client. Fails with `Validation` when no token is configured.
    pub fn new(config: &GithubConfig) -> Result<Self> {
        let token = config
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SiteError::Validation("github token is not configured".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("sitegen"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "x-github-api-version",
            HeaderValue::from_static("2022-11-28"),
        );
        let auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| SiteError::Validation(format!("invalid github token: {e}")))?;
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| SiteError::Validation(format!("failed to build http client: {e}")))?;

        let api_base = Url::parse(config.api_base.trim_end_matches('/'))
            .map_err(|e| SiteError::Validation(format!("invalid github api base: {e}")))?;

        Ok(Self {
            http,
            api_base,
            owner_is_org: config.owner_is_org,
        })
    }

    /// Join path segments onto the API base, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> HostResult<Url> {
        let mut url = self.api_base.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| HostError::Rejected {
                status: 0,
                message: format!("api base {} cannot be a base url", self.api_base),
            })?;
            path.pop_if_empty();
            for segment in segments {
                path.extend(segment.split('/').filter(|s| !s.is_empty()));
            }
        }
        Ok(url)
    }

    fn repo_endpoint(&self, target: &RepoTarget, rest: &[&str]) -> HostResult<Url> {
        let mut segments = vec!["repos", target.owner.as_str(), target.repo.as_str()];
        segments.extend_from_slice(rest);
        self.endpoint(&segments)
    }

    async fn send(
        &self,
        operation: &str,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> HostResult<reqwest::Response> {
        debug!(operation, %method, %url, "github request");
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(|e| map_transport(operation, &e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(map_status(operation, status, &body))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> HostResult<T> {
        let response = self.send(operation, method, url, body).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| {
                HostError::Unavailable(format!("failed to decode github {operation}: {e}"))
            })
    }
}

/// Operations whose 422 means "already exists" or "not a fast forward".
/// Everywhere else a 422 is a payload the API refused.
const CONFLICT_ON_UNPROCESSABLE: &[&str] = &["create ref", "update ref", "create repository"];

/// Map a non-success HTTP status to a tagged host error.
pub fn map_status(operation: &str, status: StatusCode, body: &str) -> HostError {
    let message = format!(
        "github {operation}: {}",
        truncate_for_error(body, ERROR_BODY_LIMIT)
    );
    match status.as_u16() {
        404 => HostError::NotFound(message),
        409 => HostError::Conflict(message),
        422 if CONFLICT_ON_UNPROCESSABLE.contains(&operation) => HostError::Conflict(message),
        408 | 429 => HostError::Unavailable(message),
        s if s >= 500 => HostError::Unavailable(message),
        s => HostError::Rejected { status: s, message },
    }
}

fn map_transport(operation: &str, error: &reqwest::Error) -> HostError {
    if error.is_timeout() {
        HostError::Unavailable(format!("github {operation} timed out"))
    } else {
        HostError::Unavailable(format!("github {operation} request failed: {error}"))
    }
}

fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated = text.chars().take(max_chars).collect::<String>();
    truncated.push_str("...");
    truncated
}

#[async_trait]
impl RepoHost for GithubRepoHost {
    async fn create_repository(&self, target: &RepoTarget, private: bool) -> HostResult<()> {
        let url = if self.owner_is_org {
            self.endpoint(&["orgs", &target.owner, "repos"])?
        } else {
            self.endpoint(&["user", "repos"])?
        };
        // auto_init gives the repository a first commit; the git data API
        // refuses blob writes on a repository with no commits at all.
        let body = json!({ "name": target.repo, "private": private, "auto_init": true });
        self.send("create repository", Method::POST, url, Some(body))
            .await
            .map(|_| ())
    }

    async fn create_blob(&self, target: &RepoTarget, entry: &FileEntry) -> HostResult<ObjectId> {
        let encoding = match entry.encoding {
            FileEncoding::Utf8 => "utf-8",
            FileEncoding::Base64 => "base64",
        };
        let url = self.repo_endpoint(target, &["git", "blobs"])?;
        let body = json!({ "content": entry.content, "encoding": encoding });
        let created: ShaResponse = self
            .send_json("create blob", Method::POST, url, Some(body))
            .await?;
        Ok(ObjectId(created.sha))
    }

    async fn read_ref(&self, target: &RepoTarget, branch: &str) -> HostResult<ObjectId> {
        let url = self.repo_endpoint(target, &["git", "ref", "heads", branch])?;
        match self
            .send_json::<RefResponse>("read ref", Method::GET, url, None)
            .await
        {
            Ok(found) => Ok(ObjectId(found.object.sha)),
            // Repositories without any commit answer ref reads with 409.
            Err(HostError::Conflict(message)) => Err(HostError::NotFound(message)),
            Err(e) => Err(e),
        }
    }

    async fn read_commit(&self, target: &RepoTarget, commit: &ObjectId) -> HostResult<CommitInfo> {
        let url = self.repo_endpoint(target, &["git", "commits", commit.as_str()])?;
        let found: CommitResponse = self
            .send_json("read commit", Method::GET, url, None)
            .await?;
        Ok(CommitInfo {
            id: ObjectId(found.sha),
            tree: ObjectId(found.tree.sha),
            parents: found.parents.into_iter().map(|p| ObjectId(p.sha)).collect(),
        })
    }

    async fn create_tree(
        &self,
        target: &RepoTarget,
        base_tree: Option<&ObjectId>,
        entries: &[TreeEntry],
    ) -> HostResult<ObjectId> {
        let tree: Vec<serde_json::Value> = entries
            .iter()
            .map(|e| {
                json!({
                    "path": e.path,
                    "mode": "100644",
                    "type": "blob",
                    "sha": e.blob.as_ref().map(ObjectId::as_str),
                })
            })
            .collect();
        let mut body = json!({ "tree": tree });
        if let Some(base) = base_tree {
            body["base_tree"] = json!(base.as_str());
        }
        let url = self.repo_endpoint(target, &["git", "trees"])?;
        let created: ShaResponse = self
            .send_json("create tree", Method::POST, url, Some(body))
            .await?;
        Ok(ObjectId(created.sha))
    }

    async fn create_commit(
        &self,
        target: &RepoTarget,
        message: &str,
        tree: &ObjectId,
        parents: &[ObjectId],
    ) -> HostResult<ObjectId> {
        let url = self.repo_endpoint(target, &["git", "commits"])?;
        let parents: Vec<&str> = parents.iter().map(ObjectId::as_str).collect();
        let body = json!({ "message": message, "tree": tree.as_str(), "parents": parents });
        let created: ShaResponse = self
            .send_json("create commit", Method::POST, url, Some(body))
            .await?;
        Ok(ObjectId(created.sha))
    }

    async fn create_ref(
        &self,
        target: &RepoTarget,
        branch: &str,
        commit: &ObjectId,
    ) -> HostResult<()> {
        let url = self.repo_endpoint(target, &["git", "refs"])?;
        let body = json!({ "ref": format!("refs/heads/{branch}"), "sha": commit.as_str() });
        self.send("create ref", Method::POST, url, Some(body))
            .await
            .map(|_| ())
    }

    async fn update_ref(
        &self,
        target: &RepoTarget,
        branch: &str,
        commit: &ObjectId,
    ) -> HostResult<()> {
        let url = self.repo_endpoint(target, &["git", "refs", "heads", branch])?;
        let body = json!({ "sha": commit.as_str(), "force": false });
        self.send("update ref", Method::PATCH, url, Some(body))
            .await
            .map(|_| ())
    }

    async fn read_content(
        &self,
        target: &RepoTarget,
        branch: &str,
        path: &str,
    ) -> HostResult<Vec<u8>> {
        let mut url = self.repo_endpoint(target, &["contents", path])?;
        url.query_pairs_mut().append_pair("ref", branch);
        let found: ContentResponse = self
            .send_json("read content", Method::GET, url, None)
            .await?;
        if found.encoding != "base64" {
            return Ok(found.content.into_bytes());
        }
        let compact: String = found.content.split_whitespace().collect();
        STANDARD
            .decode(compact)
            .map_err(|e| HostError::Unavailable(format!("github returned invalid base64: {e}")))
    }
}
