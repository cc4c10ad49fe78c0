//! Retry and backoff decisions for failed capture attempts

use crate::{JobStatus, RetryConfig, ScrapeError};
use rand::Rng;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Redeliver the task after `delay`; the job has used `retry_count`
    /// retries once this one is recorded.
    Retry { retry_count: u32, delay: Duration },
    /// End the job in `status` with `message` as its error message.
    GiveUp { status: JobStatus, message: String },
}

#[derive(Debug, Clone)]
pub struct RetryController {
    config: RetryConfig,
}

impl RetryController {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Decides what happens to a job whose attempt failed with `error` after
    /// `retry_count` earlier retries.
    pub fn decide(&self, error: &ScrapeError, retry_count: u32) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::GiveUp {
                status: error.terminal_status(),
                message: error.describe(),
            };
        }

        if retry_count >= self.config.max_retries {
            return RetryDecision::GiveUp {
                status: error.terminal_status(),
                message: format!(
                    "{} (gave up after {} retries)",
                    error.describe(),
                    retry_count
                ),
            };
        }

        let delay = self.backoff_delay(retry_count);
        debug!(
            "Retryable {} failure, retry {}/{} in {:?}",
            error.kind().label(),
            retry_count + 1,
            self.config.max_retries,
            delay
        );
        RetryDecision::Retry {
            retry_count: retry_count + 1,
            delay,
        }
    }

    /// Scheduled delay for the given attempt index, clamped to the last
    /// schedule entry, plus jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        base + self.jitter(base)
    }

    pub fn base_delay(&self, attempt: u32) -> Duration {
        let schedule = &self.config.backoff_schedule;
        match schedule.last() {
            Some(last) => schedule.get(attempt as usize).copied().unwrap_or(*last),
            None => Duration::ZERO,
        }
    }

    fn jitter(&self, base: Duration) -> Duration {
        if self.config.jitter_ratio <= 0.0 || base.is_zero() {
            return Duration::ZERO;
        }
        let ratio = rand::thread_rng().gen_range(0.0..=self.config.jitter_ratio);
        base.mul_f64(ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(jitter_ratio: f64) -> RetryController {
        RetryController::new(RetryConfig {
            jitter_ratio,
            ..Default::default()
        })
    }

    fn render_timeout() -> ScrapeError {
        ScrapeError::RenderTimeout {
            timeout: Duration::from_secs(60),
            message: "waiting for network idle".into(),
        }
    }

    #[test]
    fn test_backoff_schedule_clamps() {
        let retry = controller(0.0);
        assert_eq!(retry.backoff_delay(0), Duration::from_secs(5));
        assert_eq!(retry.backoff_delay(1), Duration::from_secs(15));
        assert_eq!(retry.backoff_delay(2), Duration::from_secs(45));
        assert_eq!(retry.backoff_delay(3), Duration::from_secs(45));
        assert_eq!(retry.backoff_delay(10), Duration::from_secs(45));
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let retry = controller(0.2);
        for _ in 0..100 {
            let delay = retry.backoff_delay(1);
            assert!(delay >= Duration::from_secs(15));
            assert!(delay <= Duration::from_secs(18));
        }
    }

    #[test]
    fn test_retryable_with_budget() {
        let retry = controller(0.0);
        let decision = retry.decide(&ScrapeError::Network("refused".into()), 0);
        assert_eq!(
            decision,
            RetryDecision::Retry {
                retry_count: 1,
                delay: Duration::from_secs(5)
            }
        );

        let decision = retry.decide(&render_timeout(), 2);
        assert_eq!(
            decision,
            RetryDecision::Retry {
                retry_count: 3,
                delay: Duration::from_secs(45)
            }
        );
    }

    #[test]
    fn test_exhausted_timeout_stays_timeout() {
        let retry = controller(0.0);
        match retry.decide(&render_timeout(), 3) {
            RetryDecision::GiveUp { status, message } => {
                assert_eq!(status, JobStatus::Timeout);
                assert!(message.contains("TIMEOUT_ERROR"));
                assert!(message.contains("Render timeout"));
                assert!(message.contains("gave up after 3 retries"));
            }
            other => panic!("expected give up, got {other:?}"),
        }
    }

    #[test]
    fn test_exhausted_network_fails() {
        let retry = controller(0.0);
        match retry.decide(&ScrapeError::Browser("crashed".into()), 3) {
            RetryDecision::GiveUp { status, .. } => assert_eq!(status, JobStatus::Failed),
            other => panic!("expected give up, got {other:?}"),
        }
    }

    #[test]
    fn test_non_retryable_fails_immediately() {
        let retry = controller(0.0);
        match retry.decide(&ScrapeError::Storage("disk full".into()), 0) {
            RetryDecision::GiveUp { status, message } => {
                assert_eq!(status, JobStatus::Failed);
                assert!(message.starts_with("[STORAGE_ERROR]"));
            }
            other => panic!("expected give up, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_schedule_means_no_delay() {
        let retry = RetryController::new(RetryConfig {
            backoff_schedule: Vec::new(),
            jitter_ratio: 0.5,
            ..Default::default()
        });
        assert_eq!(retry.backoff_delay(0), Duration::ZERO);
    }
}
