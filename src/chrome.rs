//! Chrome-backed [`BrowserSession`]
//!
//! Every session leases a pooled Chrome instance, opens its own incognito
//! browser context and a single page inside it, and disposes of both on close.

use crate::{
    random_user_agent, standard_headers, BrowserLease, BrowserPool, BrowserSession, Config,
    ExtractionToggles, PageArtifacts, ResourceFilter, ScrapeError, SessionFactory, Viewport,
};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FailRequestParams, RequestPattern,
    RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{
    ErrorReason, EventResponseReceived, Headers, ResourceType, SetExtraHttpHeadersParams,
    SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, EventLifecycleEvent, SetLifecycleEventsEnabledParams,
};
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(100);

const TEXT_SCRIPT: &str = "document.body ? document.body.innerText : ''";

pub struct ChromeSessionFactory {
    pool: BrowserPool,
    viewport: Viewport,
    user_agents: Vec<String>,
    filter: ResourceFilter,
}

impl ChromeSessionFactory {
    pub fn new(pool: BrowserPool, config: &Config) -> Self {
        Self {
            pool,
            viewport: config.viewport.clone(),
            user_agents: config.user_agents.clone(),
            filter: ResourceFilter::from_settings(&config.optimization),
        }
    }

    pub fn pool(&self) -> &BrowserPool {
        &self.pool
    }
}

#[async_trait]
impl SessionFactory for ChromeSessionFactory {
    async fn open(&self) -> Result<Box<dyn BrowserSession>, ScrapeError> {
        let mut lease = self.pool.get_browser().await?;

        let context_id = {
            let browser = lease.browser.lock().await;
            browser
                .execute(CreateBrowserContextParams::default())
                .await
                .map(|response| response.result.browser_context_id)
        };
        let context_id = match context_id {
            Ok(id) => id,
            Err(e) => {
                lease.mark_failed();
                return Err(ScrapeError::Browser(format!(
                    "failed to create browser context: {e}"
                )));
            }
        };

        let page = {
            let browser = lease.browser.lock().await;
            let params = CreateTargetParams::builder()
                .url("about:blank")
                .browser_context_id(context_id.clone())
                .build()
                .map_err(ScrapeError::Browser)?;
            browser.new_page(params).await
        };

        let (idle_tx, idle_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(None);
        let mut session = ChromeSession {
            page: None,
            context_id: Some(context_id),
            lease: Some(lease),
            network_idle: idle_rx,
            document_status: status_rx,
            listeners: Vec::new(),
        };

        match page {
            Ok(page) => session.page = Some(page),
            Err(e) => {
                let _ = session.close().await;
                return Err(ScrapeError::Browser(format!("failed to open page: {e}")));
            }
        }

        if let Err(e) = self.configure(&mut session, idle_tx, status_tx).await {
            let _ = session.close().await;
            return Err(e);
        }

        Ok(Box::new(session))
    }
}

impl ChromeSessionFactory {
    /// Fingerprint, viewport, resource blocking and the listeners the render
    /// waits depend on.
    async fn configure(
        &self,
        session: &mut ChromeSession,
        idle_tx: watch::Sender<bool>,
        status_tx: watch::Sender<Option<u16>>,
    ) -> Result<(), ScrapeError> {
        let page = session.page()?.clone();

        if let Some(user_agent) = random_user_agent(&self.user_agents) {
            page.execute(SetUserAgentOverrideParams::new(user_agent.to_string()))
                .await
                .map_err(browser_error)?;
        }

        let headers: serde_json::Map<String, serde_json::Value> = standard_headers()
            .into_iter()
            .map(|(name, value)| (name.to_string(), serde_json::Value::from(value)))
            .collect();
        page.execute(SetExtraHttpHeadersParams::new(Headers::new(
            serde_json::Value::Object(headers),
        )))
        .await
        .map_err(browser_error)?;

        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(self.viewport.width)
            .height(self.viewport.height)
            .device_scale_factor(self.viewport.device_scale_factor)
            .mobile(self.viewport.mobile)
            .build()
            .map_err(ScrapeError::Browser)?;
        page.execute(metrics).await.map_err(browser_error)?;

        page.execute(SetLifecycleEventsEnabledParams::new(true))
            .await
            .map_err(browser_error)?;

        let mut lifecycle = page
            .event_listener::<EventLifecycleEvent>()
            .await
            .map_err(browser_error)?;
        session.listeners.push(tokio::spawn(async move {
            while let Some(event) = lifecycle.next().await {
                match event.name.as_str() {
                    "init" => {
                        let _ = idle_tx.send(false);
                    }
                    "networkIdle" => {
                        let _ = idle_tx.send(true);
                    }
                    _ => {}
                }
            }
        }));

        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(browser_error)?;
        session.listeners.push(tokio::spawn(async move {
            while let Some(event) = responses.next().await {
                if event.r#type == ResourceType::Document {
                    let _ = status_tx.send(u16::try_from(event.response.status).ok());
                }
            }
        }));

        let patterns: Vec<RequestPattern> = self
            .filter
            .blocked_resources()
            .iter()
            .filter_map(|name| cdp_resource_type(name))
            .map(|resource_type| RequestPattern {
                url_pattern: None,
                resource_type: Some(resource_type),
                request_stage: Some(RequestStage::Request),
            })
            .collect();

        if !patterns.is_empty() {
            let mut paused = page
                .event_listener::<EventRequestPaused>()
                .await
                .map_err(browser_error)?;
            let filter = self.filter.clone();
            let interceptor = page.clone();
            session.listeners.push(tokio::spawn(async move {
                while let Some(event) = paused.next().await {
                    let outcome = if filter.should_block(&resource_type_name(&event.resource_type))
                    {
                        interceptor
                            .execute(FailRequestParams::new(
                                event.request_id.clone(),
                                ErrorReason::BlockedByClient,
                            ))
                            .await
                            .map(|_| ())
                    } else {
                        interceptor
                            .execute(ContinueRequestParams::new(event.request_id.clone()))
                            .await
                            .map(|_| ())
                    };
                    if let Err(e) = outcome {
                        debug!("Request interception failed: {}", e);
                    }
                }
            }));

            page.execute(EnableParams {
                patterns: Some(patterns),
                handle_auth_requests: None,
            })
            .await
            .map_err(browser_error)?;
        }

        Ok(())
    }
}

pub struct ChromeSession {
    page: Option<Page>,
    context_id: Option<BrowserContextId>,
    lease: Option<BrowserLease>,
    network_idle: watch::Receiver<bool>,
    document_status: watch::Receiver<Option<u16>>,
    listeners: Vec<JoinHandle<()>>,
}

impl ChromeSession {
    fn page(&self) -> Result<&Page, ScrapeError> {
        self.page
            .as_ref()
            .ok_or_else(|| ScrapeError::Browser("session is closed".to_string()))
    }

    async fn screenshot(&self) -> Result<Vec<u8>, ScrapeError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        self.page()?
            .screenshot(params)
            .await
            .map_err(|e| ScrapeError::Extraction(format!("screenshot failed: {e}")))
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&mut self, url: &str, limit: Duration) -> Result<Option<u16>, ScrapeError> {
        let page = self.page()?;
        match timeout(limit, page.goto(url)).await {
            Ok(Ok(_)) => Ok(*self.document_status.borrow()),
            Ok(Err(e)) => Err(ScrapeError::Network(format!("failed to load {url}: {e}"))),
            Err(_) => Err(ScrapeError::Network(format!(
                "navigation to {url} timed out after {limit:?}"
            ))),
        }
    }

    async fn wait_auto(&mut self, limit: Duration) -> Result<(), ScrapeError> {
        match timeout(limit, self.network_idle.wait_for(|idle| *idle)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(ScrapeError::Browser(
                "page event stream closed while waiting for network idle".to_string(),
            )),
            Err(_) => Err(ScrapeError::RenderTimeout {
                timeout: limit,
                message: "waiting for network idle".to_string(),
            }),
        }
    }

    async fn wait_fixed_delay(&mut self, delay: Duration) -> Result<(), ScrapeError> {
        sleep(delay).await;
        Ok(())
    }

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        limit: Duration,
    ) -> Result<(), ScrapeError> {
        let page = self.page()?;
        let deadline = Instant::now() + limit;
        loop {
            if page.find_element(selector).await.is_ok() {
                return Ok(());
            }
            if Instant::now() + SELECTOR_POLL_INTERVAL > deadline {
                return Err(ScrapeError::RenderTimeout {
                    timeout: limit,
                    message: format!("selector '{selector}' did not appear"),
                });
            }
            sleep(SELECTOR_POLL_INTERVAL).await;
        }
    }

    async fn extract(&mut self, toggles: ExtractionToggles) -> Result<PageArtifacts, ScrapeError> {
        let page = self.page()?;
        let mut artifacts = PageArtifacts {
            http_status: *self.document_status.borrow(),
            ..Default::default()
        };

        if toggles.html {
            artifacts.html = Some(
                page.content()
                    .await
                    .map_err(|e| ScrapeError::Extraction(format!("html: {e}")))?,
            );
        }

        if toggles.text {
            let text = page
                .evaluate(TEXT_SCRIPT)
                .await
                .map_err(|e| ScrapeError::Extraction(format!("text: {e}")))?
                .into_value::<String>()
                .map_err(|e| ScrapeError::Extraction(format!("text: {e}")))?;
            artifacts.text = Some(text);
        }

        if toggles.screenshot {
            artifacts.screenshot = Some(self.screenshot().await?);
        }

        artifacts.page_title = page.get_title().await.unwrap_or_default();
        artifacts.final_url = page.url().await.unwrap_or_default();
        Ok(artifacts)
    }

    async fn close(&mut self) -> Result<(), ScrapeError> {
        for listener in self.listeners.drain(..) {
            listener.abort();
        }

        let mut first_error = None;

        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                first_error.get_or_insert(ScrapeError::Browser(format!("closing page: {e}")));
            }
        }

        if let Some(mut lease) = self.lease.take() {
            if let Some(context_id) = self.context_id.take() {
                let disposed = lease
                    .browser
                    .lock()
                    .await
                    .execute(DisposeBrowserContextParams::new(context_id))
                    .await;
                if let Err(e) = disposed {
                    lease.mark_failed();
                    first_error.get_or_insert(ScrapeError::Browser(format!(
                        "disposing browser context: {e}"
                    )));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        for listener in self.listeners.drain(..) {
            listener.abort();
        }

        if self.page.is_none() && self.context_id.is_none() {
            return;
        }

        warn!("Browser session dropped without close, cleaning up in background");
        let page = self.page.take();
        let context_id = self.context_id.take();
        let lease = self.lease.take();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Some(page) = page {
                    let _ = page.close().await;
                }
                if let (Some(lease), Some(context_id)) = (lease, context_id) {
                    let _ = lease
                        .browser
                        .lock()
                        .await
                        .execute(DisposeBrowserContextParams::new(context_id))
                        .await;
                }
            });
        }
    }
}

fn browser_error(err: chromiumoxide::error::CdpError) -> ScrapeError {
    ScrapeError::Browser(err.to_string())
}

/// Lowercase resource type name as used by [`ResourceFilter`].
fn resource_type_name(resource_type: &ResourceType) -> String {
    format!("{resource_type:?}").to_ascii_lowercase()
}

fn cdp_resource_type(name: &str) -> Option<ResourceType> {
    match name {
        "document" => Some(ResourceType::Document),
        "stylesheet" => Some(ResourceType::Stylesheet),
        "image" => Some(ResourceType::Image),
        "media" => Some(ResourceType::Media),
        "font" => Some(ResourceType::Font),
        "script" => Some(ResourceType::Script),
        "xhr" => Some(ResourceType::Xhr),
        "fetch" => Some(ResourceType::Fetch),
        "websocket" => Some(ResourceType::WebSocket),
        "manifest" => Some(ResourceType::Manifest),
        "other" => Some(ResourceType::Other),
        _ => None,
    }
}
