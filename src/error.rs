use std::time::Duration;

use thiserror::Error;

/// Errors returned by ComfyUI operations.
///
/// Every variant renders a message that can be shown to an end user as-is.
#[derive(Error, Debug)]
pub enum ComfyError {
    /// The workflow template is structurally invalid or an override does not
    /// fit the field it targets.
    #[error("Template error: {0}")]
    Template(String),

    /// ComfyUI rejected the submitted workflow. Retrying will not help.
    #[error("ComfyUI rejected the workflow: {diagnostic}")]
    Submission {
        status: Option<u16>,
        diagnostic: String,
    },

    /// Network-level request failure with context.
    #[error("{context}: {source}")]
    Transport {
        context: String,
        source: reqwest::Error,
    },

    /// ComfyUI returned a non-success HTTP status.
    #[error("ComfyUI returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// No terminal state was observed before the deadline. The job may still
    /// finish on the server.
    #[error("Timed out after {}s waiting for job {job_id}", waited.as_secs())]
    TrackingTimeout { job_id: String, waited: Duration },

    /// The event channel dropped and could not be re-established.
    #[error("Event channel lost: {0}")]
    ConnectionLost(String),

    /// Fewer bytes arrived than the server announced.
    #[error("Download of {filename} incomplete: received {received} of {expected} bytes")]
    DownloadIncomplete {
        filename: String,
        expected: u64,
        received: u64,
    },

    /// ComfyUI reported an execution error during generation.
    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    /// The response from ComfyUI was missing expected fields.
    #[error("{0}")]
    InvalidResponse(String),

    /// A configuration value could not be used.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A named template or prompt does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Local filesystem failure with context.
    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ComfyError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ComfyError::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether a caller may retry the failed operation.
    ///
    /// Only transport failures and gateway-style HTTP statuses qualify.
    pub fn is_retryable(&self) -> bool {
        match self {
            ComfyError::Transport { .. } => true,
            ComfyError::Http { status, .. } => matches!(status, 502..=504),
            _ => false,
        }
    }
}

impl From<std::io::Error> for ComfyError {
    fn from(err: std::io::Error) -> Self {
        ComfyError::io("I/O error", err)
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ComfyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ComfyError::Http {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!ComfyError::Http {
            status: 400,
            body: String::new()
        }
        .is_retryable());
        assert!(!ComfyError::Submission {
            status: Some(400),
            diagnostic: "bad".into()
        }
        .is_retryable());
        assert!(!ComfyError::Template("x".into()).is_retryable());
    }

    #[test]
    fn test_messages_are_presentable() {
        let err = ComfyError::TrackingTimeout {
            job_id: "job-42".into(),
            waited: Duration::from_secs(120),
        };
        assert_eq!(err.to_string(), "Timed out after 120s waiting for job job-42");

        let err = ComfyError::DownloadIncomplete {
            filename: "fox_001.png".into(),
            expected: 100,
            received: 40,
        };
        assert!(err.to_string().contains("40 of 100"));
    }
}
