use crate::{FailureKind, JobStatus, PageArtifacts};
use metrics::{Counter, Gauge, Histogram};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Engine and gateway metrics.
///
/// Handles are registered against whatever recorder is installed when the
/// struct is built; without one they are no-ops.
pub struct Metrics {
    pub jobs_submitted: Counter,
    pub jobs_completed: Counter,
    pub jobs_failed: Counter,
    pub jobs_timed_out: Counter,
    pub jobs_retried: Counter,
    pub jobs_cancelled: Counter,
    pub artifact_bytes: Counter,
    pub browser_restarts: Counter,
    pub active_jobs: Gauge,
    pub capture_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_submitted: metrics::register_counter!("scrapeflow_jobs_submitted_total"),
            jobs_completed: metrics::register_counter!("scrapeflow_jobs_completed_total"),
            jobs_failed: metrics::register_counter!("scrapeflow_jobs_failed_total"),
            jobs_timed_out: metrics::register_counter!("scrapeflow_jobs_timed_out_total"),
            jobs_retried: metrics::register_counter!("scrapeflow_jobs_retried_total"),
            jobs_cancelled: metrics::register_counter!("scrapeflow_jobs_cancelled_total"),
            artifact_bytes: metrics::register_counter!("scrapeflow_artifact_bytes_total"),
            browser_restarts: metrics::register_counter!("scrapeflow_browser_restarts_total"),
            active_jobs: metrics::register_gauge!("scrapeflow_active_jobs"),
            capture_duration: metrics::register_histogram!("scrapeflow_capture_duration_seconds"),
        }
    }

    pub fn noop() -> Self {
        Self {
            jobs_submitted: Counter::noop(),
            jobs_completed: Counter::noop(),
            jobs_failed: Counter::noop(),
            jobs_timed_out: Counter::noop(),
            jobs_retried: Counter::noop(),
            jobs_cancelled: Counter::noop(),
            artifact_bytes: Counter::noop(),
            browser_restarts: Counter::noop(),
            active_jobs: Gauge::noop(),
            capture_duration: Histogram::noop(),
        }
    }

    pub fn record_submitted(&self) {
        self.jobs_submitted.increment(1);
    }

    pub fn record_cancelled(&self) {
        self.jobs_cancelled.increment(1);
    }

    pub fn job_started(&self) {
        self.active_jobs.increment(1.0);
    }

    pub fn job_finished(&self, duration: Duration) {
        self.active_jobs.decrement(1.0);
        self.capture_duration.record(duration.as_secs_f64());
    }

    pub fn record_completed(&self, artifacts: &PageArtifacts) {
        self.jobs_completed.increment(1);

        let bytes = artifacts.html.as_ref().map_or(0, |html| html.len())
            + artifacts.text.as_ref().map_or(0, |text| text.len())
            + artifacts.screenshot.as_ref().map_or(0, |png| png.len());
        self.artifact_bytes.increment(bytes as u64);
    }

    pub fn record_retry(&self, kind: FailureKind) {
        self.jobs_retried.increment(1);
        metrics::increment_counter!("scrapeflow_retries_by_kind_total", "kind" => kind.label());
    }

    pub fn record_terminal_failure(&self, status: JobStatus, kind: FailureKind) {
        match status {
            JobStatus::Timeout => self.jobs_timed_out.increment(1),
            _ => self.jobs_failed.increment(1),
        }
        metrics::increment_counter!("scrapeflow_failures_by_kind_total", "kind" => kind.label());
    }

    pub fn record_browser_restart(&self) {
        self.browser_restarts.increment(1);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serves the Prometheus scrape endpoint on `port`.
pub struct PrometheusExporter {
    port: u16,
}

impl PrometheusExporter {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    /// Installs the global recorder. Must run inside the tokio runtime and
    /// before any [`Metrics`] is built.
    pub fn start(&self) -> Result<(), metrics_exporter_prometheus::BuildError> {
        let address = SocketAddr::from(([0, 0, 0, 0], self.port));
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(address)
            .install()?;

        info!("Prometheus metrics available on http://{}/metrics", address);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_recorder_are_inert() {
        let metrics = Metrics::new();
        metrics.record_submitted();
        metrics.job_started();
        metrics.record_retry(FailureKind::Network);
        metrics.record_terminal_failure(JobStatus::Timeout, FailureKind::Timeout);
        metrics.record_completed(&PageArtifacts {
            html: Some("<p>x</p>".into()),
            ..Default::default()
        });
        metrics.job_finished(Duration::from_millis(250));
        metrics.record_browser_restart();
    }
}
