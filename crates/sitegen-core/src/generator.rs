//! File generation boundary.
//!
//! [`FileGenerator`] turns a prompt (and, on fix attempts, the previous files
//! plus an error excerpt) into a complete [`FileSet`].
//! [`ChatCompletionsGenerator`] implements it against any OpenAI-compatible
//! chat completions endpoint.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::domain::{FileEntry, FileSet, Result, SiteError};

/// Corrective context for a fix attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixContext {
    pub previous: FileSet,
    pub error_excerpt: String,
}

/// Produces site files from a prompt.
#[async_trait]
pub trait FileGenerator: Send + Sync {
    /// Generate a full file set. Fails with [`SiteError::Generation`].
    async fn generate(&self, prompt: &str, context: Option<&FixContext>) -> Result<FileSet>;
}

const SYSTEM_PROMPT: &str = "You generate complete Next.js (app router, TypeScript) static \
websites. Reply with a single JSON object of the form \
{\"files\":[{\"path\":\"...\",\"content\":\"...\"}]} and nothing else. Include \
package.json with `next`, `react` and `react-dom` dependencies and a `build` script, and every \
file needed for `npm run build` to succeed. Do not include next.config files.";

const FIX_INSTRUCTIONS: &str = "The previous version of the site failed to build. \
Return the corrected, complete file set in the same JSON format. \
Keep files that were fine unchanged.";

/// Chat completions client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Full URL of the chat completions endpoint.
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub request_timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: None,
            model: "gpt-4o".to_string(),
            temperature: 0.2,
            request_timeout_secs: 180,
        }
    }
}

/// [`FileGenerator`] backed by an OpenAI-compatible chat completions API.
pub struct ChatCompletionsGenerator {
    http: reqwest::Client,
    config: GeneratorConfig,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct GeneratedFiles {
    files: Vec<FileEntry>,
}

impl ChatCompletionsGenerator {
    pub fn new(config: GeneratorConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("sitegen")
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| SiteError::Validation(format!("failed to build http client: {e}")))?;
        Ok(Self { http, config })
    }
}

/// Render the user message for a generation or fix request.
pub fn render_user_message(prompt: &str, context: Option<&FixContext>) -> String {
    let mut message = format!("Build this website: {prompt}");
    if let Some(ctx) = context {
        let _ = write!(
            message,
            "\n\n{FIX_INSTRUCTIONS}\n\nBuild error:\n{}\n\nPrevious files:",
            ctx.error_excerpt
        );
        for entry in &ctx.previous {
            let _ = write!(message, "\n--- {} ---\n{}", entry.path, entry.content);
        }
    }
    message
}

/// Parse a model reply into a file set. Tolerates markdown code fences and
/// prose around the JSON object.
pub fn parse_files_reply(reply: &str) -> Result<FileSet> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &reply[s..=e],
        _ => {
            return Err(SiteError::Generation(
                "reply did not contain a JSON object".to_string(),
            ))
        }
    };
    let parsed: GeneratedFiles = serde_json::from_str(json)
        .map_err(|e| SiteError::Generation(format!("reply was not a valid file list: {e}")))?;
    FileSet::new(parsed.files)
        .map_err(|e| SiteError::Generation(format!("reply contained no usable files: {e}")))
}

#[async_trait]
impl FileGenerator for ChatCompletionsGenerator {
    async fn generate(&self, prompt: &str, context: Option<&FixContext>) -> Result<FileSet> {
        let body = json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": render_user_message(prompt, context) },
            ],
        });

        let mut request = self.http.post(&self.config.endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        debug!(model = %self.config.model, fix = context.is_some(), "requesting generation");

        let response = request
            .send()
            .await
            .map_err(|e| SiteError::Generation(format!("generator request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SiteError::Generation(format!(
                "generator returned status {}: {}",
                status.as_u16(),
                crate::extract::truncate_chars(&text, 500)
            )));
        }
        let reply: ChatResponse = response
            .json()
            .await
            .map_err(|e| SiteError::Generation(format!("failed to decode generator reply: {e}")))?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| SiteError::Generation("generator reply had no content".to_string()))?;
        parse_files_reply(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_reply() {
        let reply = concat!(
            "Here you go:\n```json\n",
            "{\"files\":[{\"path\":\"/app/page.tsx\",\"content\":\"export default 1\"}]}",
            "\n```"
        );
        let files = parse_files_reply(reply).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files.entries()[0].path, "app/page.tsx");
    }

    #[test]
    fn rejects_unusable_replies() {
        assert!(matches!(
            parse_files_reply("sorry, I can't"),
            Err(SiteError::Generation(_))
        ));
        assert!(matches!(
            parse_files_reply("{\"files\":[]}"),
            Err(SiteError::Generation(_))
        ));
        assert!(matches!(
            parse_files_reply("{\"pages\":{}}"),
            Err(SiteError::Generation(_))
        ));
    }

    #[test]
    fn fix_message_carries_excerpt_and_files() {
        let previous =
            FileSet::new(vec![FileEntry::utf8("app/page.tsx", "import x from 'xyz'")]).unwrap();
        let ctx = FixContext {
            previous,
            error_excerpt: "Module not found: Can't resolve 'xyz'".to_string(),
        };
        let message = render_user_message("todo app", Some(&ctx));
        assert!(message.starts_with("Build this website: todo app"));
        assert!(message.contains("Module not found: Can't resolve 'xyz'"));
        assert!(message.contains("--- app/page.tsx ---\nimport x from 'xyz'"));

        let plain = render_user_message("todo app", None);
        assert!(!plain.contains("Build error"));
    }
}
