//! Worker execution engine
//!
//! [`JobEngine::execute`] takes one task through a job's lifecycle: mark the
//! record Running, capture the page under the soft and hard time limits, tier
//! the results and commit the terminal state, or hand the failure to the retry
//! controller. [`WorkerPool`] runs a fixed number of workers that pull tasks
//! from the broker one at a time.

use crate::{
    CaptureRequest, Clock, Config, JobId, JobRecord, JobRepository, JobStatus, JobTask, Metrics,
    ObjectStore, PageArtifacts, ResultStore, RetryController, RetryDecision, ScrapeError,
    SessionController, SessionFactory, StoredArtifacts, TaskBroker,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// What one execution did to the job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    /// Redelivery scheduled; the job stays Running.
    Retrying {
        retry_count: u32,
        delay: Duration,
    },
    /// Terminal failure committed (Failed or Timeout).
    Failed(JobStatus),
    /// The job was already terminal; nothing was done.
    Skipped(JobStatus),
    /// No record exists for the task.
    Missing,
}

pub struct JobEngine {
    repo: Arc<dyn JobRepository>,
    broker: Arc<dyn TaskBroker>,
    sessions: SessionController,
    results: ResultStore,
    retry: RetryController,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    soft_time_limit: Duration,
    hard_time_limit: Duration,
}

impl JobEngine {
    pub fn new(
        config: &Config,
        repo: Arc<dyn JobRepository>,
        broker: Arc<dyn TaskBroker>,
        factory: Arc<dyn SessionFactory>,
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            repo,
            broker,
            sessions: SessionController::new(
                factory,
                config.navigation_timeout,
                config.rendering_timeout,
            ),
            results: ResultStore::new(store, config.inline_text_limit, config.screenshot_format),
            retry: RetryController::new(config.retry.clone()),
            clock,
            metrics,
            soft_time_limit: config.soft_time_limit,
            hard_time_limit: config.hard_time_limit,
        }
    }

    /// Executes one delivery of `task`.
    ///
    /// Errors are infrastructure failures (repository or broker) that leave
    /// the task worth redelivering; capture failures are committed to the
    /// record and reported through the outcome.
    #[instrument(skip(self, task), fields(job_id = %task.job_id))]
    pub async fn execute(&self, task: JobTask) -> Result<ExecutionOutcome, ScrapeError> {
        let job_id = task.job_id;

        let job = match self.repo.get(job_id).await? {
            Some(job) => job,
            None => {
                warn!("Job {} not found, dropping task", job_id);
                return Ok(ExecutionOutcome::Missing);
            }
        };

        if job.status.is_terminal() {
            debug!(
                "Job {} already {}, skipping redelivered task",
                job_id, job.status
            );
            return Ok(ExecutionOutcome::Skipped(job.status));
        }

        let now = self.clock.now();
        let job = match self
            .repo
            .update(job_id, Box::new(move |job| job.start_attempt(now)))
            .await
        {
            Ok(job) => job,
            Err(ScrapeError::Conflict(reason)) => {
                // Cancelled between the read and the transition
                debug!("Job {} not started: {}", job_id, reason);
                let status = self
                    .repo
                    .get(job_id)
                    .await?
                    .map_or(JobStatus::Failed, |job| job.status);
                return Ok(ExecutionOutcome::Skipped(status));
            }
            Err(e) => return Err(e),
        };

        info!(
            "Job {} running (attempt {}) for {}",
            job_id,
            job.retry_count + 1,
            job.url
        );

        self.metrics.job_started();
        let started = Instant::now();
        let attempt = self.run_attempt(&job).await;
        self.metrics.job_finished(started.elapsed());

        match attempt {
            Ok((artifacts, stored)) => self.commit_success(&job, artifacts, stored).await,
            Err(e) => self.handle_failure(&job, e).await,
        }
    }

    /// Capture and tiering under the time limits. When the soft limit passes,
    /// the capture is told to stop; when the hard limit passes the attempt is
    /// abandoned outright.
    async fn run_attempt(
        &self,
        job: &JobRecord,
    ) -> Result<(PageArtifacts, StoredArtifacts), ScrapeError> {
        let request = CaptureRequest::from(job);
        let soft_limit = CancellationToken::new();

        let work = async {
            let artifacts = self.sessions.capture(&request, &soft_limit).await?;
            if soft_limit.is_cancelled() {
                return Err(ScrapeError::TimeLimitExceeded(self.soft_time_limit));
            }
            let stored = self
                .results
                .persist(job.id, &artifacts, request.toggles)
                .await?;
            Ok((artifacts, stored))
        };

        let soft_timer = {
            let soft_limit = soft_limit.clone();
            let after = self.soft_time_limit;
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                soft_limit.cancel();
            })
        };

        let result = match tokio::time::timeout(self.hard_time_limit, work).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Job {} exceeded the hard time limit of {:?}",
                    job.id, self.hard_time_limit
                );
                self.discard_artifacts(job.id).await;
                Err(ScrapeError::TimeLimitExceeded(self.hard_time_limit))
            }
        };
        soft_timer.abort();
        result
    }

    /// Removes the objects of an attempt that will not be committed. Nothing is
    /// deleted once the record is Completed, since its paths point at the same
    /// keys. Returns the status read from the repository, if any.
    async fn discard_artifacts(&self, job_id: JobId) -> Option<JobStatus> {
        let status = match self.repo.get(job_id).await {
            Ok(record) => record.map(|job| job.status),
            Err(e) => {
                warn!("Failed to read job {} before cleanup: {}", job_id, e);
                return None;
            }
        };
        if status == Some(JobStatus::Completed) {
            return status;
        }
        if let Err(e) = self.results.purge(job_id).await {
            warn!("Failed to remove artifacts of job {}: {}", job_id, e);
        }
        status
    }

    async fn commit_success(
        &self,
        job: &JobRecord,
        artifacts: PageArtifacts,
        stored: StoredArtifacts,
    ) -> Result<ExecutionOutcome, ScrapeError> {
        let now = self.clock.now();
        let metadata = artifacts.metadata();

        if let Err(e) = self
            .repo
            .update(
                job.id,
                Box::new(move |job| job.complete(stored, metadata, now)),
            )
            .await
        {
            // A duplicate delivery may have finished the job first
            if let Some(current) = self.discard_artifacts(job.id).await {
                if current.is_terminal() {
                    warn!(
                        "Job {} was already {} when committing, dropping this attempt",
                        job.id, current
                    );
                    return Ok(ExecutionOutcome::Skipped(current));
                }
            }
            error!("Failed to commit job {}: {}", job.id, e);
            return Err(e);
        }

        self.metrics.record_completed(&artifacts);
        info!("Job {} completed", job.id);
        Ok(ExecutionOutcome::Completed)
    }

    async fn handle_failure(
        &self,
        job: &JobRecord,
        err: ScrapeError,
    ) -> Result<ExecutionOutcome, ScrapeError> {
        match self.retry.decide(&err, job.retry_count) {
            RetryDecision::Retry { retry_count, delay } => {
                warn!(
                    "Job {} attempt failed ({}), retry {}/{} in {:?}",
                    job.id,
                    err,
                    retry_count,
                    self.retry.max_retries(),
                    delay
                );

                let max_retries = self.retry.max_retries();
                let now = self.clock.now();
                self.repo
                    .update(
                        job.id,
                        Box::new(move |job| job.record_retry(max_retries, now).map(|_| ())),
                    )
                    .await?;
                self.metrics.record_retry(err.kind());

                if let Err(e) = self.broker.enqueue_after(JobTask::new(job.id), delay).await {
                    error!("Failed to schedule retry of job {}: {}", job.id, e);
                    let message = ScrapeError::Unexpected(format!("Failed to schedule retry: {e}"))
                        .describe();
                    return self
                        .commit_failure(job.id, JobStatus::Failed, message, &err)
                        .await;
                }

                Ok(ExecutionOutcome::Retrying { retry_count, delay })
            }
            RetryDecision::GiveUp { status, message } => {
                error!("Job {} {}: {}", job.id, status, message);
                self.commit_failure(job.id, status, message, &err).await
            }
        }
    }

    async fn commit_failure(
        &self,
        job_id: JobId,
        status: JobStatus,
        message: String,
        cause: &ScrapeError,
    ) -> Result<ExecutionOutcome, ScrapeError> {
        let now = self.clock.now();
        self.repo
            .update(job_id, Box::new(move |job| job.fail(status, message, now)))
            .await?;
        self.metrics.record_terminal_failure(status, cause.kind());
        Ok(ExecutionOutcome::Failed(status))
    }
}

/// Pulls tasks from the broker and executes them one at a time
pub struct JobWorker {
    id: usize,
    engine: Arc<JobEngine>,
    broker: Arc<dyn TaskBroker>,
    is_running: AtomicBool,
    processed_count: AtomicUsize,
    error_count: AtomicUsize,
}

impl JobWorker {
    pub fn new(id: usize, engine: Arc<JobEngine>, broker: Arc<dyn TaskBroker>) -> Self {
        Self {
            id,
            engine,
            broker,
            is_running: AtomicBool::new(false),
            processed_count: AtomicUsize::new(0),
            error_count: AtomicUsize::new(0),
        }
    }

    /// Runs until `shutdown` fires or the broker closes. A job in progress
    /// is finished before the worker stops.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Starting worker {}", self.id);
        self.is_running.store(true, Ordering::Relaxed);

        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                delivery = self.broker.dequeue() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let job_id = delivery.task.job_id;
            match self.engine.execute(delivery.task).await {
                Ok(outcome) => {
                    self.processed_count.fetch_add(1, Ordering::Relaxed);
                    debug!("Worker {} finished job {}: {:?}", self.id, job_id, outcome);
                    if let Err(e) = self.broker.ack(delivery.tag).await {
                        error!("Worker {} failed to ack job {}: {}", self.id, job_id, e);
                    }
                }
                Err(e) if !delivery.redelivered => {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Worker {} could not execute job {}, requeueing: {}",
                        self.id, job_id, e
                    );
                    if let Err(e) = self.broker.reject(delivery.tag).await {
                        error!("Worker {} failed to requeue job {}: {}", self.id, job_id, e);
                    }
                }
                Err(e) => {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "Worker {} dropping job {} after repeated infrastructure failure: {}",
                        self.id, job_id, e
                    );
                    if let Err(e) = self.broker.ack(delivery.tag).await {
                        error!("Worker {} failed to ack job {}: {}", self.id, job_id, e);
                    }
                }
            }
        }

        self.is_running.store(false, Ordering::Relaxed);
        info!("Worker {} stopped", self.id);
    }

    pub fn get_stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id,
            is_running: self.is_running.load(Ordering::Relaxed),
            processed_count: self.processed_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub id: usize,
    pub is_running: bool,
    pub processed_count: usize,
    pub error_count: usize,
}

/// Fixed-size set of workers sharing one broker
pub struct WorkerPool {
    workers: Vec<Arc<JobWorker>>,
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn start(size: usize, engine: Arc<JobEngine>, broker: Arc<dyn TaskBroker>) -> Self {
        let shutdown = CancellationToken::new();
        let mut workers = Vec::with_capacity(size);
        let mut handles = Vec::with_capacity(size);

        for id in 0..size {
            let worker = Arc::new(JobWorker::new(id, engine.clone(), broker.clone()));
            let runner = worker.clone();
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move { runner.run(token).await }));
            workers.push(worker);
        }

        info!("Worker pool started with {} workers", size);
        Self {
            workers,
            handles,
            shutdown,
        }
    }

    pub fn get_worker_stats(&self) -> Vec<WorkerStats> {
        self.workers
            .iter()
            .map(|worker| worker.get_stats())
            .collect()
    }

    pub fn total_processed(&self) -> usize {
        self.get_worker_stats()
            .iter()
            .map(|stats| stats.processed_count)
            .sum()
    }

    /// Stops taking new tasks and waits for running jobs to finish.
    pub async fn shutdown(self) {
        info!("Shutting down worker pool...");
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker task panicked: {}", e);
            }
        }
        info!("Worker pool shutdown complete");
    }
}
