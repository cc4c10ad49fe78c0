//! Job record and lifecycle state machine
//!
//! A [`JobRecord`] is the persisted state of one capture request. Every status
//! change goes through the transition methods on the record so that the
//! timestamp and terminal-state invariants hold regardless of which backend
//! stores it.

use crate::{validate_url, ScrapeError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub type JobId = Uuid;

/// Upper bound for `wait_time`, in seconds.
pub const MAX_WAIT_TIME_SECS: u32 = 60;

/// Error message recorded on a job cancelled while still pending.
pub const CANCELLED_MESSAGE: &str = "Job was canceled by user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ScrapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "timeout" => Ok(JobStatus::Timeout),
            other => Err(ScrapeError::Validation(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// How long to wait after navigation before extracting content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStrategy {
    /// Wait until network activity is idle
    #[default]
    Auto,
    /// Sleep for `wait_time` seconds
    FixedDelay,
    /// Wait until `wait_for_selector` appears in the document
    #[serde(rename = "wait_for_element", alias = "wait_for_selector")]
    WaitForSelector,
}

impl FromStr for RenderStrategy {
    type Err = ScrapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "auto" => Ok(RenderStrategy::Auto),
            "fixed_delay" => Ok(RenderStrategy::FixedDelay),
            "wait_for_element" | "wait_for_selector" => Ok(RenderStrategy::WaitForSelector),
            other => Err(ScrapeError::Validation(format!(
                "unknown render strategy '{other}' (expected auto, fixed_delay or wait_for_element)"
            ))),
        }
    }
}

/// Artifact kinds a job can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Html,
    Text,
    Screenshot,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Html => "html",
            ArtifactKind::Text => "text",
            ArtifactKind::Screenshot => "screenshot",
        }
    }
}

impl FromStr for ArtifactKind {
    type Err = ScrapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "html" => Ok(ArtifactKind::Html),
            "text" => Ok(ArtifactKind::Text),
            "screenshot" => Ok(ArtifactKind::Screenshot),
            _ => Err(ScrapeError::Validation(
                "Invalid result type. Valid types are: html, text, screenshot".to_string(),
            )),
        }
    }
}

/// Input accepted by the submission gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRequest {
    pub url: String,
    pub wait_time: u32,
    pub render_strategy: RenderStrategy,
    pub wait_for_selector: Option<String>,
    pub extract_text: bool,
    pub extract_html: bool,
    pub capture_screenshot: bool,
}

impl Default for JobRequest {
    fn default() -> Self {
        Self {
            url: String::new(),
            wait_time: 0,
            render_strategy: RenderStrategy::Auto,
            wait_for_selector: None,
            extract_text: true,
            extract_html: true,
            capture_screenshot: true,
        }
    }
}

impl JobRequest {
    /// Checks the request before any record is created.
    pub fn validate(&self) -> Result<(), ScrapeError> {
        validate_url(&self.url)?;

        if self.wait_time > MAX_WAIT_TIME_SECS {
            return Err(ScrapeError::Validation(format!(
                "wait_time must be between 0 and {MAX_WAIT_TIME_SECS} seconds, got {}",
                self.wait_time
            )));
        }

        Ok(())
    }
}

/// Result references produced by the tiering store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArtifacts {
    pub screenshot_path: Option<String>,
    pub html_path: Option<String>,
    pub text_path: Option<String>,
    pub text_content: Option<String>,
}

/// Page metadata captured on every successful attempt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub page_title: Option<String>,
    pub final_url: Option<String>,
    pub http_status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub url: String,
    pub status: JobStatus,

    pub render_strategy: RenderStrategy,
    pub wait_time: u32,
    pub wait_for_selector: Option<String>,

    pub extract_text: bool,
    pub extract_html: bool,
    pub capture_screenshot: bool,

    pub screenshot_path: Option<String>,
    pub html_path: Option<String>,
    pub text_path: Option<String>,
    pub text_content: Option<String>,

    pub page_title: Option<String>,
    pub final_url: Option<String>,
    pub http_status: Option<u16>,
    pub error_message: Option<String>,
    pub retry_count: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Builds a pending record from an already validated request.
    ///
    /// `wait_for_selector` is only kept for the selector strategy.
    pub fn new(request: JobRequest, now: DateTime<Utc>) -> Self {
        let wait_for_selector = match request.render_strategy {
            RenderStrategy::WaitForSelector => request
                .wait_for_selector
                .filter(|selector| !selector.trim().is_empty()),
            _ => None,
        };

        Self {
            id: Uuid::new_v4(),
            url: request.url,
            status: JobStatus::Pending,
            render_strategy: request.render_strategy,
            wait_time: request.wait_time,
            wait_for_selector,
            extract_text: request.extract_text,
            extract_html: request.extract_html,
            capture_screenshot: request.capture_screenshot,
            screenshot_path: None,
            html_path: None,
            text_path: None,
            text_content: None,
            page_title: None,
            final_url: None,
            http_status: None,
            error_message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn wait_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.wait_time))
    }

    /// Pending -> Running on dequeue. A redelivered retry finds the record
    /// already Running and keeps it there.
    pub fn start_attempt(&mut self, now: DateTime<Utc>) -> Result<(), ScrapeError> {
        self.ensure_not_terminal("start")?;
        self.status = JobStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.updated_at = now;
        Ok(())
    }

    /// Counts a retryable failure. The visible status stays Running.
    pub fn record_retry(
        &mut self,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<u32, ScrapeError> {
        self.ensure_running("retry")?;
        if self.retry_count >= max_retries {
            return Err(ScrapeError::Conflict(format!(
                "job {} already used its {} retries",
                self.id, max_retries
            )));
        }
        self.retry_count += 1;
        self.updated_at = now;
        Ok(self.retry_count)
    }

    pub fn complete(
        &mut self,
        artifacts: StoredArtifacts,
        metadata: PageMetadata,
        now: DateTime<Utc>,
    ) -> Result<(), ScrapeError> {
        self.ensure_running("complete")?;
        self.screenshot_path = artifacts.screenshot_path;
        self.html_path = artifacts.html_path;
        self.text_path = artifacts.text_path;
        self.text_content = artifacts.text_content;
        self.page_title = metadata.page_title;
        self.final_url = metadata.final_url;
        self.http_status = metadata.http_status;
        self.error_message = None;
        self.finish(JobStatus::Completed, now);
        Ok(())
    }

    /// Running -> Failed or Timeout.
    pub fn fail(
        &mut self,
        status: JobStatus,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<(), ScrapeError> {
        if !matches!(status, JobStatus::Failed | JobStatus::Timeout) {
            return Err(ScrapeError::Unexpected(format!(
                "{status} is not a failure status"
            )));
        }
        self.ensure_running("fail")?;
        self.error_message = Some(message);
        self.finish(status, now);
        Ok(())
    }

    /// Pending -> Failed on user request. Any other state is a conflict and
    /// leaves the record untouched.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), ScrapeError> {
        if self.status != JobStatus::Pending {
            return Err(ScrapeError::Conflict(format!(
                "Cannot cancel job that is not in pending status (current status: {})",
                self.status
            )));
        }
        self.fail_pending(CANCELLED_MESSAGE.to_string(), now)
    }

    /// Pending -> Failed for jobs that never reached a worker.
    pub fn fail_pending(&mut self, message: String, now: DateTime<Utc>) -> Result<(), ScrapeError> {
        if self.status != JobStatus::Pending {
            return Err(ScrapeError::Conflict(format!(
                "cannot fail job {} before start: status is {}",
                self.id, self.status
            )));
        }
        self.error_message = Some(message);
        self.finish(JobStatus::Failed, now);
        Ok(())
    }

    /// Reference to where an artifact lives in the external store.
    pub fn artifact_path(&self, kind: ArtifactKind) -> Option<&str> {
        match kind {
            ArtifactKind::Html => self.html_path.as_deref(),
            ArtifactKind::Text => self.text_path.as_deref(),
            ArtifactKind::Screenshot => self.screenshot_path.as_deref(),
        }
    }

    fn finish(&mut self, status: JobStatus, now: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    fn ensure_not_terminal(&self, action: &str) -> Result<(), ScrapeError> {
        if self.status.is_terminal() {
            return Err(ScrapeError::Conflict(format!(
                "cannot {action} job {}: already {}",
                self.id, self.status
            )));
        }
        Ok(())
    }

    fn ensure_running(&self, action: &str) -> Result<(), ScrapeError> {
        if self.status != JobStatus::Running {
            return Err(ScrapeError::Conflict(format!(
                "cannot {action} job {}: status is {}",
                self.id, self.status
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> JobRequest {
        JobRequest {
            url: "https://example.com".to_string(),
            ..Default::default()
        }
    }

    fn running_record() -> JobRecord {
        let mut record = JobRecord::new(request(), Utc::now());
        record.start_attempt(Utc::now()).unwrap();
        record
    }

    #[test]
    fn test_request_validation() {
        assert!(request().validate().is_ok());

        let bad_url = JobRequest {
            url: "ftp://example.com".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            bad_url.validate(),
            Err(ScrapeError::Validation(_))
        ));

        let too_long = JobRequest {
            wait_time: 61,
            ..request()
        };
        assert!(matches!(
            too_long.validate(),
            Err(ScrapeError::Validation(_))
        ));

        let upper_bound = JobRequest {
            wait_time: 60,
            ..request()
        };
        assert!(upper_bound.validate().is_ok());
    }

    #[test]
    fn test_request_deserializes_wire_names() {
        let request: JobRequest = serde_json::from_str(
            r##"{"url":"https://example.com","render_strategy":"wait_for_element","wait_for_selector":"#app"}"##,
        )
        .unwrap();
        assert_eq!(request.render_strategy, RenderStrategy::WaitForSelector);
        assert!(request.extract_text && request.extract_html && request.capture_screenshot);
    }

    #[test]
    fn test_selector_only_kept_for_selector_strategy() {
        let record = JobRecord::new(
            JobRequest {
                wait_for_selector: Some("#app".into()),
                ..request()
            },
            Utc::now(),
        );
        assert!(record.wait_for_selector.is_none());

        let record = JobRecord::new(
            JobRequest {
                render_strategy: RenderStrategy::WaitForSelector,
                wait_for_selector: Some("#app".into()),
                ..request()
            },
            Utc::now(),
        );
        assert_eq!(record.wait_for_selector.as_deref(), Some("#app"));
    }

    #[test]
    fn test_start_sets_started_at_once() {
        let mut record = JobRecord::new(request(), Utc::now());
        assert_eq!(record.status, JobStatus::Pending);
        assert!(record.started_at.is_none());

        record.start_attempt(Utc::now()).unwrap();
        let first_start = record.started_at;
        assert_eq!(record.status, JobStatus::Running);
        assert!(first_start.is_some());

        record
            .start_attempt(Utc::now() + chrono::Duration::seconds(5))
            .unwrap();
        assert_eq!(record.started_at, first_start);
        assert_eq!(record.status, JobStatus::Running);
    }

    #[test]
    fn test_completed_at_only_on_terminal() {
        let mut record = running_record();
        assert!(record.completed_at.is_none());

        record
            .complete(
                StoredArtifacts::default(),
                PageMetadata::default(),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn test_no_transition_after_terminal() {
        let mut record = running_record();
        record
            .fail(JobStatus::Failed, "boom".into(), Utc::now())
            .unwrap();
        let snapshot = record.clone();

        assert!(record.start_attempt(Utc::now()).is_err());
        assert!(record
            .complete(
                StoredArtifacts::default(),
                PageMetadata::default(),
                Utc::now()
            )
            .is_err());
        assert!(record
            .fail(JobStatus::Timeout, "late".into(), Utc::now())
            .is_err());
        assert!(record.cancel(Utc::now()).is_err());
        assert_eq!(record, snapshot);
    }

    #[test]
    fn test_fail_rejects_non_failure_status() {
        let mut record = running_record();
        assert!(record
            .fail(JobStatus::Completed, "x".into(), Utc::now())
            .is_err());
        assert_eq!(record.status, JobStatus::Running);
    }

    #[test]
    fn test_retry_budget() {
        let mut record = running_record();
        assert_eq!(record.record_retry(2, Utc::now()).unwrap(), 1);
        assert_eq!(record.record_retry(2, Utc::now()).unwrap(), 2);
        assert!(record.record_retry(2, Utc::now()).is_err());
        assert_eq!(record.retry_count, 2);
        assert_eq!(record.status, JobStatus::Running);
    }

    #[test]
    fn test_cancel_only_from_pending() {
        let mut pending = JobRecord::new(request(), Utc::now());
        pending.cancel(Utc::now()).unwrap();
        assert_eq!(pending.status, JobStatus::Failed);
        assert_eq!(pending.error_message.as_deref(), Some(CANCELLED_MESSAGE));
        assert!(pending.completed_at.is_some());

        let mut running = running_record();
        let before = running.clone();
        assert!(matches!(
            running.cancel(Utc::now()),
            Err(ScrapeError::Conflict(_))
        ));
        assert_eq!(running, before);
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!(
            "fixed-delay".parse::<RenderStrategy>().unwrap(),
            RenderStrategy::FixedDelay
        );
        assert_eq!("Timeout".parse::<JobStatus>().unwrap(), JobStatus::Timeout);
        assert_eq!(
            "screenshot".parse::<ArtifactKind>().unwrap(),
            ArtifactKind::Screenshot
        );
        assert!("pdf".parse::<ArtifactKind>().is_err());
    }
}
