//! Live status of a job for callers
//!
//! The streamer re-reads the job record on a fixed interval and yields one
//! event per read. It never takes locks beyond the repository's own reads, so
//! what it reports may lag the engine by one interval.

use crate::{Clock, JobId, JobRepository, JobStatus};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const JOB_NOT_FOUND: &str = "Job not found";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusEvent {
    pub fn for_status(job_id: JobId, status: JobStatus, timestamp: DateTime<Utc>) -> Self {
        let message = if status.is_terminal() {
            format!("Job completed with status: {status}")
        } else {
            format!("Job is {status}")
        };
        Self {
            job_id,
            status: Some(status),
            message,
            timestamp,
            error: None,
        }
    }

    pub fn error(job_id: JobId, error: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        let error = error.into();
        Self {
            job_id,
            status: None,
            message: error.clone(),
            timestamp,
            error: Some(error),
        }
    }

    /// True for the last event a stream yields.
    pub fn is_final(&self) -> bool {
        self.error.is_some() || self.status.map_or(false, |status| status.is_terminal())
    }

    /// Error events carry only the error, the way the HTTP surface reports them.
    pub fn to_json(&self) -> String {
        match &self.error {
            Some(error) => serde_json::json!({ "error": error }).to_string(),
            None => serde_json::to_string(self).unwrap_or_default(),
        }
    }

    /// Server-sent event frame
    pub fn to_sse(&self) -> String {
        format!("data: {}\n\n", self.to_json())
    }
}

#[derive(Clone)]
pub struct StatusStreamer {
    repo: Arc<dyn JobRepository>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

struct PollState {
    repo: Arc<dyn JobRepository>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    cancel: CancellationToken,
    job_id: JobId,
    first: bool,
    done: bool,
}

impl StatusStreamer {
    pub fn new(repo: Arc<dyn JobRepository>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            repo,
            clock,
            interval,
        }
    }

    /// Events for `job_id` until one terminal event, an error event, or
    /// `cancel` fires. The first read happens immediately.
    pub fn stream(
        &self,
        job_id: JobId,
        cancel: CancellationToken,
    ) -> BoxStream<'static, StatusEvent> {
        let state = PollState {
            repo: self.repo.clone(),
            clock: self.clock.clone(),
            interval: self.interval,
            cancel,
            job_id,
            first: true,
            done: false,
        };

        stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }

            if !state.first {
                tokio::select! {
                    biased;
                    _ = state.cancel.cancelled() => {
                        debug!("Status stream for job {} cancelled", state.job_id);
                        return None;
                    }
                    _ = state.clock.sleep(state.interval) => {}
                }
            } else if state.cancel.is_cancelled() {
                return None;
            }
            state.first = false;

            let now = state.clock.now();
            let event = match state.repo.get(state.job_id).await {
                Ok(Some(job)) => StatusEvent::for_status(state.job_id, job.status, now),
                Ok(None) => StatusEvent::error(state.job_id, JOB_NOT_FOUND, now),
                Err(e) => StatusEvent::error(state.job_id, e.to_string(), now),
            };
            state.done = event.is_final();
            Some((event, state))
        })
        .boxed()
    }
}
