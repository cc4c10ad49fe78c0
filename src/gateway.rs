//! Submission gateway
//!
//! [`JobService`] is the caller-facing surface of the engine: it validates and
//! records new jobs, queues their tasks, and serves records, listings, status
//! streams and finished artifacts.

use crate::{
    ArtifactKind, Clock, Config, JobId, JobPage, JobQuery, JobRecord, JobRepository, JobRequest,
    JobStatus, JobTask, Metrics, ObjectStore, ResultStore, ScrapeError, StatusEvent,
    StatusStreamer, TaskBroker,
};
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// How a fetched artifact should be presented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Download,
    Preview,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPayload {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub filename: String,
    pub disposition: Disposition,
}

impl ArtifactPayload {
    /// Value for a `Content-Disposition` header
    pub fn content_disposition(&self) -> String {
        match self.disposition {
            Disposition::Download => format!("attachment; filename=\"{}\"", self.filename),
            Disposition::Preview => "inline".to_string(),
        }
    }
}

pub fn parse_job_id(raw: &str) -> Result<JobId, ScrapeError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| ScrapeError::Validation("Invalid job ID format".to_string()))
}

pub struct JobService {
    repo: Arc<dyn JobRepository>,
    broker: Arc<dyn TaskBroker>,
    results: ResultStore,
    streamer: StatusStreamer,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl JobService {
    pub fn new(
        config: &Config,
        repo: Arc<dyn JobRepository>,
        broker: Arc<dyn TaskBroker>,
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            streamer: StatusStreamer::new(repo.clone(), clock.clone(), config.status_poll_interval),
            results: ResultStore::new(store, config.inline_text_limit, config.screenshot_format),
            repo,
            broker,
            clock,
            metrics,
        }
    }

    /// Validates `request`, records a Pending job and queues its task.
    ///
    /// Nothing is recorded for an invalid request. When queueing fails the
    /// record is moved to Failed before the error is returned.
    pub async fn create_job(&self, request: JobRequest) -> Result<JobRecord, ScrapeError> {
        request.validate()?;

        let record = JobRecord::new(request, self.clock.now());
        let job_id = record.id;
        self.repo.insert(record.clone()).await?;

        if let Err(e) = self.broker.enqueue(JobTask::new(job_id)).await {
            error!("Failed to queue job {}: {}", job_id, e);
            let message = format!("Failed to queue scraping task: {e}");
            let now = self.clock.now();
            if let Err(update_error) = self
                .repo
                .update(job_id, Box::new(move |job| job.fail_pending(message, now)))
                .await
            {
                warn!("Could not mark job {} as failed: {}", job_id, update_error);
            }
            return Err(e);
        }

        self.metrics.record_submitted();
        info!("Created job {} for {}", job_id, record.url);
        Ok(record)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<JobRecord, ScrapeError> {
        self.repo
            .get(job_id)
            .await?
            .ok_or_else(|| ScrapeError::NotFound(format!("job {job_id}")))
    }

    /// Pending -> Failed. Any other status is a conflict.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<JobRecord, ScrapeError> {
        let now = self.clock.now();
        let record = self
            .repo
            .update(job_id, Box::new(move |job| job.cancel(now)))
            .await?;
        self.metrics.record_cancelled();
        info!("Cancelled job {}", job_id);
        Ok(record)
    }

    pub async fn list_jobs(&self, query: &JobQuery) -> Result<JobPage, ScrapeError> {
        self.repo.list(query).await
    }

    pub fn stream_status(
        &self,
        job_id: JobId,
        cancel: CancellationToken,
    ) -> BoxStream<'static, StatusEvent> {
        self.streamer.stream(job_id, cancel)
    }

    /// Bytes of one artifact of a completed job.
    pub async fn fetch_artifact(
        &self,
        job_id: JobId,
        kind: ArtifactKind,
        disposition: Disposition,
    ) -> Result<ArtifactPayload, ScrapeError> {
        let job = self.get_job(job_id).await?;
        if job.status != JobStatus::Completed {
            return Err(ScrapeError::Conflict(format!(
                "Job is not completed (current status: {})",
                job.status
            )));
        }

        let filename = self.artifact_filename(&job, kind);

        if kind == ArtifactKind::Text {
            if let Some(text) = &job.text_content {
                return Ok(ArtifactPayload {
                    bytes: text.clone().into_bytes(),
                    content_type: self.results.content_type(kind),
                    filename,
                    disposition,
                });
            }
        }

        let key = job.artifact_path(kind).ok_or_else(|| {
            ScrapeError::NotFound(format!("{} not available for job {job_id}", kind.as_str()))
        })?;
        let bytes = self.results.fetch(key).await?;

        Ok(ArtifactPayload {
            bytes,
            content_type: self.results.content_type_for_key(kind, key),
            filename,
            disposition,
        })
    }

    fn artifact_filename(&self, job: &JobRecord, kind: ArtifactKind) -> String {
        match kind {
            ArtifactKind::Screenshot => {
                let extension = job
                    .screenshot_path
                    .as_deref()
                    .and_then(|key| key.rsplit_once('.'))
                    .map(|(_, ext)| ext)
                    .unwrap_or_else(|| self.results.screenshot_format().extension());
                format!("job_{}_screenshot.{}", job.id, extension)
            }
            ArtifactKind::Html => format!("job_{}_page.html", job.id),
            ArtifactKind::Text => format!("job_{}_content.txt", job.id),
        }
    }
}
