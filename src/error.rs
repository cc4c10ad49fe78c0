use crate::JobStatus;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

#[derive(Debug, Clone, Error)]
pub enum ScrapeError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Browser setup failed: {0}")]
    Browser(String),

    #[error("Navigation failed: {0}")]
    Network(String),

    #[error("Render timeout after {timeout:?}: {message}")]
    RenderTimeout { timeout: Duration, message: String },

    #[error("Time limit exceeded after {0:?}")]
    TimeLimitExceeded(Duration),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Failure classification used for retry decisions, metrics and the
/// persisted `error_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Validation,
    Browser,
    Network,
    Timeout,
    Storage,
    Unexpected,
}

impl FailureKind {
    pub fn error_code(&self) -> &'static str {
        match self {
            FailureKind::Validation => "VALIDATION_ERROR",
            FailureKind::Browser => "BROWSER_ERROR",
            FailureKind::Network => "NETWORK_ERROR",
            FailureKind::Timeout => "TIMEOUT_ERROR",
            FailureKind::Storage => "STORAGE_ERROR",
            FailureKind::Unexpected => "INTERNAL_ERROR",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::Browser => "browser",
            FailureKind::Network => "network",
            FailureKind::Timeout => "timeout",
            FailureKind::Storage => "storage",
            FailureKind::Unexpected => "unexpected",
        }
    }
}

impl ScrapeError {
    /// Browser setup, navigation and render-wait failures are worth another
    /// attempt. Everything else ends the job on first occurrence.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScrapeError::Browser(_) | ScrapeError::Network(_) | ScrapeError::RenderTimeout { .. }
        )
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ScrapeError::Validation(_) => FailureKind::Validation,
            ScrapeError::Browser(_) => FailureKind::Browser,
            ScrapeError::Network(_) => FailureKind::Network,
            ScrapeError::RenderTimeout { .. } | ScrapeError::TimeLimitExceeded(_) => {
                FailureKind::Timeout
            }
            ScrapeError::Storage(_) => FailureKind::Storage,
            _ => FailureKind::Unexpected,
        }
    }

    pub fn error_code(&self) -> &'static str {
        self.kind().error_code()
    }

    /// Terminal status a job lands in when this error ends it.
    pub fn terminal_status(&self) -> JobStatus {
        match self.kind() {
            FailureKind::Timeout => JobStatus::Timeout,
            _ => JobStatus::Failed,
        }
    }

    /// Human-readable message persisted on the job record.
    pub fn describe(&self) -> String {
        format!("[{}] {}", self.error_code(), self)
    }
}

impl From<AcquireError> for ScrapeError {
    fn from(err: AcquireError) -> Self {
        ScrapeError::Browser(format!("browser pool closed: {err}"))
    }
}

impl From<std::io::Error> for ScrapeError {
    fn from(err: std::io::Error) -> Self {
        ScrapeError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ScrapeError {
    fn from(err: serde_json::Error) -> Self {
        ScrapeError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ScrapeError::Browser("launch".into()).is_retryable());
        assert!(ScrapeError::Network("dns".into()).is_retryable());
        assert!(ScrapeError::RenderTimeout {
            timeout: Duration::from_secs(60),
            message: "network idle".into()
        }
        .is_retryable());

        assert!(!ScrapeError::Storage("bucket".into()).is_retryable());
        assert!(!ScrapeError::Extraction("body".into()).is_retryable());
        assert!(!ScrapeError::TimeLimitExceeded(Duration::from_secs(300)).is_retryable());
        assert!(!ScrapeError::Validation("url".into()).is_retryable());
    }

    #[test]
    fn test_terminal_status_mapping() {
        let timeout = ScrapeError::RenderTimeout {
            timeout: Duration::from_secs(1),
            message: "selector".into(),
        };
        assert_eq!(timeout.terminal_status(), JobStatus::Timeout);
        assert_eq!(
            ScrapeError::TimeLimitExceeded(Duration::from_secs(300)).terminal_status(),
            JobStatus::Timeout
        );
        assert_eq!(
            ScrapeError::Network("reset".into()).terminal_status(),
            JobStatus::Failed
        );
        assert_eq!(
            ScrapeError::Storage("full".into()).terminal_status(),
            JobStatus::Failed
        );
    }

    #[test]
    fn test_describe_carries_error_code() {
        let message = ScrapeError::Storage("put failed".into()).describe();
        assert_eq!(message, "[STORAGE_ERROR] Storage error: put failed");

        let message = ScrapeError::Conflict("busy".into()).describe();
        assert!(message.starts_with("[INTERNAL_ERROR]"));
    }
}
