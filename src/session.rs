//! Browser session lifecycle for one capture attempt
//!
//! [`BrowserSession`] hides the browser driver. [`SessionController`] drives a
//! session through navigate, one render wait and extraction, classifies every
//! failure and closes the session on every exit path.

use crate::{JobRecord, PageMetadata, RenderStrategy, ScrapeError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Which artifacts an attempt should extract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionToggles {
    pub text: bool,
    pub html: bool,
    pub screenshot: bool,
}

impl ExtractionToggles {
    pub fn all() -> Self {
        Self {
            text: true,
            html: true,
            screenshot: true,
        }
    }
}

/// Everything one successful attempt produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageArtifacts {
    pub html: Option<String>,
    pub text: Option<String>,
    pub screenshot: Option<Vec<u8>>,
    pub page_title: Option<String>,
    pub final_url: Option<String>,
    pub http_status: Option<u16>,
}

impl PageArtifacts {
    pub fn metadata(&self) -> PageMetadata {
        PageMetadata {
            page_title: self.page_title.clone(),
            final_url: self.final_url.clone(),
            http_status: self.http_status,
        }
    }

    /// Drops anything the job did not ask for.
    fn retain(mut self, toggles: ExtractionToggles) -> Self {
        if !toggles.html {
            self.html = None;
        }
        if !toggles.text {
            self.text = None;
        }
        if !toggles.screenshot {
            self.screenshot = None;
        }
        self
    }
}

/// One isolated browser context.
///
/// Implementations must tolerate `close` after any failed call.
#[async_trait]
pub trait BrowserSession: Send {
    /// Loads `url`; returns the main document's HTTP status when known.
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<Option<u16>, ScrapeError>;

    /// Waits until the page's network activity is idle.
    async fn wait_auto(&mut self, timeout: Duration) -> Result<(), ScrapeError>;

    async fn wait_fixed_delay(&mut self, delay: Duration) -> Result<(), ScrapeError>;

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), ScrapeError>;

    async fn extract(&mut self, toggles: ExtractionToggles) -> Result<PageArtifacts, ScrapeError>;

    async fn close(&mut self) -> Result<(), ScrapeError>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn BrowserSession>, ScrapeError>;
}

/// The single render wait an attempt performs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitPlan {
    NetworkIdle,
    FixedDelay(Duration),
    Selector(String),
}

impl WaitPlan {
    /// A selector strategy without a usable selector waits for network idle.
    pub fn resolve(strategy: RenderStrategy, wait_time: Duration, selector: Option<&str>) -> Self {
        match strategy {
            RenderStrategy::Auto => WaitPlan::NetworkIdle,
            RenderStrategy::FixedDelay => WaitPlan::FixedDelay(wait_time),
            RenderStrategy::WaitForSelector => match selector.map(str::trim) {
                Some(selector) if !selector.is_empty() => WaitPlan::Selector(selector.to_string()),
                _ => {
                    debug!("No selector given for wait_for_element, waiting for network idle");
                    WaitPlan::NetworkIdle
                }
            },
        }
    }
}

/// What the controller needs to know about a job
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub url: String,
    pub wait: WaitPlan,
    pub toggles: ExtractionToggles,
}

impl From<&JobRecord> for CaptureRequest {
    fn from(job: &JobRecord) -> Self {
        Self {
            url: job.url.clone(),
            wait: WaitPlan::resolve(
                job.render_strategy,
                job.wait_duration(),
                job.wait_for_selector.as_deref(),
            ),
            toggles: ExtractionToggles {
                text: job.extract_text,
                html: job.extract_html,
                screenshot: job.capture_screenshot,
            },
        }
    }
}

pub struct SessionController {
    factory: Arc<dyn SessionFactory>,
    navigation_timeout: Duration,
    rendering_timeout: Duration,
}

impl SessionController {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        navigation_timeout: Duration,
        rendering_timeout: Duration,
    ) -> Self {
        Self {
            factory,
            navigation_timeout,
            rendering_timeout,
        }
    }

    /// Runs one attempt. `cancel` is the soft time limit: once it fires the
    /// attempt stops where it is and the session is torn down.
    pub async fn capture(
        &self,
        request: &CaptureRequest,
        cancel: &CancellationToken,
    ) -> Result<PageArtifacts, ScrapeError> {
        let started = Instant::now();

        let mut session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ScrapeError::TimeLimitExceeded(started.elapsed())),
            opened = self.factory.open() => opened.map_err(as_browser_error)?,
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Soft time limit reached while capturing {}", request.url);
                Err(ScrapeError::TimeLimitExceeded(started.elapsed()))
            }
            result = self.drive(session.as_mut(), request) => result,
        };

        if let Err(e) = session.close().await {
            warn!("Failed to close browser session for {}: {}", request.url, e);
        }

        result
    }

    async fn drive(
        &self,
        session: &mut dyn BrowserSession,
        request: &CaptureRequest,
    ) -> Result<PageArtifacts, ScrapeError> {
        debug!("Navigating to {}", request.url);
        let http_status = match timeout(
            self.navigation_timeout,
            session.navigate(&request.url, self.navigation_timeout),
        )
        .await
        {
            Ok(result) => result.map_err(as_network_error)?,
            Err(_) => {
                return Err(ScrapeError::Network(format!(
                    "navigation to {} timed out after {:?}",
                    request.url, self.navigation_timeout
                )))
            }
        };

        self.wait(session, &request.wait).await?;

        let mut artifacts = session
            .extract(request.toggles)
            .await
            .map_err(as_extraction_error)?
            .retain(request.toggles);
        if artifacts.http_status.is_none() {
            artifacts.http_status = http_status;
        }
        Ok(artifacts)
    }

    async fn wait(
        &self,
        session: &mut dyn BrowserSession,
        plan: &WaitPlan,
    ) -> Result<(), ScrapeError> {
        let (label, outcome) = match plan {
            WaitPlan::NetworkIdle => (
                "network idle".to_string(),
                timeout(
                    self.rendering_timeout,
                    session.wait_auto(self.rendering_timeout),
                )
                .await,
            ),
            WaitPlan::Selector(selector) => (
                format!("selector '{selector}'"),
                timeout(
                    self.rendering_timeout,
                    session.wait_for_selector(selector, self.rendering_timeout),
                )
                .await,
            ),
            WaitPlan::FixedDelay(delay) => {
                return session
                    .wait_fixed_delay(*delay)
                    .await
                    .map_err(as_wait_error);
            }
        };

        match outcome {
            Ok(result) => result.map_err(as_wait_error),
            Err(_) => Err(ScrapeError::RenderTimeout {
                timeout: self.rendering_timeout,
                message: format!("waiting for {label}"),
            }),
        }
    }
}

fn as_browser_error(err: ScrapeError) -> ScrapeError {
    match err {
        ScrapeError::Browser(_) => err,
        other => ScrapeError::Browser(other.to_string()),
    }
}

fn as_network_error(err: ScrapeError) -> ScrapeError {
    match err {
        ScrapeError::Network(_) => err,
        other => ScrapeError::Network(other.to_string()),
    }
}

fn as_wait_error(err: ScrapeError) -> ScrapeError {
    match err {
        ScrapeError::RenderTimeout { .. } | ScrapeError::Browser(_) | ScrapeError::Network(_) => {
            err
        }
        other => ScrapeError::Network(other.to_string()),
    }
}

fn as_extraction_error(err: ScrapeError) -> ScrapeError {
    match err {
        ScrapeError::Extraction(_) | ScrapeError::Browser(_) => err,
        other => ScrapeError::Extraction(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobRequest;
    use chrono::Utc;
    use mockall::mock;
    use mockall::predicate::eq;

    mock! {
        pub Session {}

        #[async_trait]
        impl BrowserSession for Session {
            async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<Option<u16>, ScrapeError>;
            async fn wait_auto(&mut self, timeout: Duration) -> Result<(), ScrapeError>;
            async fn wait_fixed_delay(&mut self, delay: Duration) -> Result<(), ScrapeError>;
            async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<(), ScrapeError>;
            async fn extract(&mut self, toggles: ExtractionToggles) -> Result<PageArtifacts, ScrapeError>;
            async fn close(&mut self) -> Result<(), ScrapeError>;
        }
    }

    mock! {
        pub Factory {}

        #[async_trait]
        impl SessionFactory for Factory {
            async fn open(&self) -> Result<Box<dyn BrowserSession>, ScrapeError>;
        }
    }

    fn controller_with(session: MockSession) -> SessionController {
        let mut factory = MockFactory::new();
        factory
            .expect_open()
            .return_once(move || Ok(Box::new(session) as Box<dyn BrowserSession>));
        SessionController::new(
            Arc::new(factory),
            Duration::from_secs(30),
            Duration::from_secs(60),
        )
    }

    fn request(wait: WaitPlan) -> CaptureRequest {
        CaptureRequest {
            url: "https://example.com".to_string(),
            wait,
            toggles: ExtractionToggles {
                text: true,
                html: true,
                screenshot: false,
            },
        }
    }

    fn page() -> PageArtifacts {
        PageArtifacts {
            html: Some("<html></html>".into()),
            text: Some("hello".into()),
            screenshot: Some(vec![1, 2, 3]),
            page_title: Some("Example".into()),
            final_url: Some("https://example.com/".into()),
            http_status: None,
        }
    }

    #[test]
    fn test_wait_plan_resolution() {
        let wait = Duration::from_secs(3);
        assert_eq!(
            WaitPlan::resolve(RenderStrategy::Auto, wait, Some("#app")),
            WaitPlan::NetworkIdle
        );
        assert_eq!(
            WaitPlan::resolve(RenderStrategy::FixedDelay, wait, None),
            WaitPlan::FixedDelay(wait)
        );
        assert_eq!(
            WaitPlan::resolve(RenderStrategy::WaitForSelector, wait, Some(" #app ")),
            WaitPlan::Selector("#app".into())
        );
        assert_eq!(
            WaitPlan::resolve(RenderStrategy::WaitForSelector, wait, None),
            WaitPlan::NetworkIdle
        );
        assert_eq!(
            WaitPlan::resolve(RenderStrategy::WaitForSelector, wait, Some("   ")),
            WaitPlan::NetworkIdle
        );
    }

    #[test]
    fn test_capture_request_from_record() {
        let record = JobRecord::new(
            JobRequest {
                url: "https://example.com".into(),
                render_strategy: RenderStrategy::FixedDelay,
                wait_time: 7,
                capture_screenshot: false,
                ..Default::default()
            },
            Utc::now(),
        );
        let request = CaptureRequest::from(&record);
        assert_eq!(request.wait, WaitPlan::FixedDelay(Duration::from_secs(7)));
        assert!(!request.toggles.screenshot);
        assert!(request.toggles.text && request.toggles.html);
    }

    #[tokio::test]
    async fn test_successful_capture_keeps_requested_artifacts() {
        let mut session = MockSession::new();
        session
            .expect_navigate()
            .times(1)
            .returning(|_, _| Ok(Some(200)));
        session.expect_wait_auto().times(1).returning(|_| Ok(()));
        session.expect_extract().times(1).returning(|_| Ok(page()));
        session.expect_close().times(1).returning(|| Ok(()));

        let artifacts = controller_with(session)
            .capture(&request(WaitPlan::NetworkIdle), &CancellationToken::new())
            .await
            .unwrap();

        assert!(artifacts.html.is_some());
        assert!(artifacts.text.is_some());
        assert!(artifacts.screenshot.is_none());
        assert_eq!(artifacts.http_status, Some(200));
        assert_eq!(artifacts.page_title.as_deref(), Some("Example"));
    }

    #[tokio::test]
    async fn test_navigation_failure_is_network_and_closes() {
        let mut session = MockSession::new();
        session
            .expect_navigate()
            .returning(|_, _| Err(ScrapeError::Extraction("net::ERR_NAME_NOT_RESOLVED".into())));
        session.expect_wait_auto().never();
        session.expect_close().times(1).returning(|| Ok(()));

        let err = controller_with(session)
            .capture(&request(WaitPlan::NetworkIdle), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Network(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_render_wait_overrun_is_timeout() {
        let mut session = MockSession::new();
        session.expect_navigate().returning(|_, _| Ok(None));
        session
            .expect_wait_for_selector()
            .withf(|selector, timeout| selector == "#late" && *timeout == Duration::from_secs(60))
            .returning(|_, _| {
                Err(ScrapeError::RenderTimeout {
                    timeout: Duration::from_secs(60),
                    message: "selector '#late' never appeared".into(),
                })
            });
        session.expect_extract().never();
        session.expect_close().times(1).returning(|| Ok(()));

        let err = controller_with(session)
            .capture(
                &request(WaitPlan::Selector("#late".into())),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::RenderTimeout { .. }));
        assert_eq!(err.terminal_status(), crate::JobStatus::Timeout);
    }

    #[tokio::test]
    async fn test_fixed_delay_uses_wait_time() {
        let mut session = MockSession::new();
        session.expect_navigate().returning(|_, _| Ok(Some(200)));
        session
            .expect_wait_fixed_delay()
            .with(eq(Duration::from_secs(5)))
            .times(1)
            .returning(|_| Ok(()));
        session.expect_extract().returning(|_| Ok(page()));
        session.expect_close().times(1).returning(|| Ok(()));

        let result = controller_with(session)
            .capture(
                &request(WaitPlan::FixedDelay(Duration::from_secs(5))),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_extraction_failure_not_retryable() {
        let mut session = MockSession::new();
        session.expect_navigate().returning(|_, _| Ok(Some(200)));
        session.expect_wait_auto().returning(|_| Ok(()));
        session
            .expect_extract()
            .returning(|_| Err(ScrapeError::Serialization("bad utf-8".into())));
        session.expect_close().times(1).returning(|| Ok(()));

        let err = controller_with(session)
            .capture(&request(WaitPlan::NetworkIdle), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Extraction(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_factory_failure_is_browser_error() {
        let mut factory = MockFactory::new();
        factory
            .expect_open()
            .returning(|| Err(ScrapeError::Io("chrome binary missing".into())));
        let controller = SessionController::new(
            Arc::new(factory),
            Duration::from_secs(30),
            Duration::from_secs(60),
        );

        let err = controller
            .capture(&request(WaitPlan::NetworkIdle), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Browser(_)));
    }

    #[tokio::test]
    async fn test_soft_limit_before_open_skips_session() {
        let mut factory = MockFactory::new();
        factory.expect_open().never();
        let controller = SessionController::new(
            Arc::new(factory),
            Duration::from_secs(30),
            Duration::from_secs(60),
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = controller
            .capture(&request(WaitPlan::NetworkIdle), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::TimeLimitExceeded(_)));
    }
}
