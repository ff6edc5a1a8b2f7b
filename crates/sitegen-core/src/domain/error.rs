//! Domain-level error taxonomy for sitegen.

use crate::repo::HostError;

/// sitegen domain errors.
#[derive(Debug, thiserror::Error)]
pub enum SiteError {
    /// Malformed input, rejected before any side effect.
    #[error("validation error: {0}")]
    Validation(String),

    /// The file generator produced unusable or incomplete output.
    #[error("generation failed: {0}")]
    Generation(String),

    #[error("remote conflict: {0}")]
    RemoteConflict(String),

    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("blob upload failed for {path}: {reason}")]
    PartialBlobFailure { path: String, reason: String },

    #[error("failed to write {path}: {reason}")]
    WriteFailure { path: String, reason: String },

    #[error("command `{command}` exited with code {exit_code}")]
    ProcessFailure {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("command `{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    /// A caller bug. Always fatal, never retried.
    #[error("internal invariant violated: {0}")]
    InternalInvariantViolation(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SiteError {
    /// Whether the generate/fix loop may spend another attempt on this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SiteError::Generation(_)
                | SiteError::ProcessFailure { .. }
                | SiteError::Timeout { .. }
                | SiteError::WriteFailure { .. }
        )
    }

    /// Raw process output carried by the error, if any.
    pub fn raw_output(&self) -> Option<&str> {
        match self {
            SiteError::ProcessFailure { output, .. } => Some(output),
            _ => None,
        }
    }
}

impl From<HostError> for SiteError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::Conflict(msg) => SiteError::RemoteConflict(msg),
            HostError::NotFound(msg) => {
                SiteError::RemoteUnavailable(format!("unexpected not found: {msg}"))
            }
            HostError::Unavailable(msg) => SiteError::RemoteUnavailable(msg),
            HostError::Rejected { status, message } => {
                SiteError::RemoteUnavailable(format!("rejected with status {status}: {message}"))
            }
        }
    }
}

/// Result type for sitegen domain operations.
pub type Result<T> = std::result::Result<T, SiteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_error_display() {
        let err = SiteError::Validation("prompt must not be empty".to_string());
        assert!(err.to_string().contains("validation error"));

        let err = SiteError::PartialBlobFailure {
            path: "app/page.tsx".to_string(),
            reason: "502".to_string(),
        };
        assert!(err.to_string().contains("app/page.tsx"));

        let err = SiteError::Timeout {
            command: "npm run build".to_string(),
            timeout_secs: 300,
        };
        assert!(err.to_string().contains("300s"));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(SiteError::Generation("empty reply".into()).is_recoverable());
        assert!(SiteError::Timeout {
            command: "npm".into(),
            timeout_secs: 1
        }
        .is_recoverable());
        assert!(!SiteError::RemoteUnavailable("503".into()).is_recoverable());
        assert!(!SiteError::Validation("bad".into()).is_recoverable());
        assert!(!SiteError::InternalInvariantViolation("empty".into()).is_recoverable());
    }

    #[test]
    fn test_host_error_mapping() {
        let err: SiteError = HostError::Unavailable("connection reset".into()).into();
        assert!(matches!(err, SiteError::RemoteUnavailable(_)));

        let err: SiteError = HostError::Conflict("ref exists".into()).into();
        assert!(matches!(err, SiteError::RemoteConflict(_)));

        let err: SiteError = HostError::Rejected {
            status: 401,
            message: "bad credentials".into(),
        }
        .into();
        assert!(err.to_string().contains("401"));
    }

    #[test]
    fn test_raw_output_only_for_process_failure() {
        let err = SiteError::ProcessFailure {
            command: "npm run build".into(),
            exit_code: 1,
            output: "Type error: x".into(),
        };
        assert_eq!(err.raw_output(), Some("Type error: x"));
        assert_eq!(SiteError::Generation("x".into()).raw_output(), None);
    }
}
