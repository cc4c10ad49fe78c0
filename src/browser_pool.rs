//! Browser pool management for concurrent Chrome instances
//!
//! Chrome processes are expensive to start, so a fixed set of instances is
//! shared across capture attempts. Isolation between attempts comes from a
//! fresh browser context per session, not from a fresh process. Instances are
//! recycled after a configured number of sessions and restarted when their
//! DevTools connection dies.

use crate::{create_browser_config_with_instance_id, Config, Metrics, ScrapeError};
use chromiumoxide::browser::Browser;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type HandlerTask = tokio::task::JoinHandle<Result<(), chromiumoxide::error::CdpError>>;

/// Current status of a browser instance in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Instance is ready and available for use
    Healthy,
    /// Instance is serving a session
    Busy,
    /// Instance is being replaced
    Restarting,
    /// Instance could not be replaced and needs another restart
    Failed,
}

/// Usage counters that decide when an instance is replaced
#[derive(Debug, Clone, Copy)]
pub struct InstanceUsage {
    pub sessions_served: usize,
    pub failure_count: usize,
    pub created_at: Instant,
    pub last_used: Instant,
}

impl InstanceUsage {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            sessions_served: 0,
            failure_count: 0,
            created_at: now,
            last_used: now,
        }
    }

    /// True once the instance has served its session budget.
    pub fn should_recycle(&self, max_sessions: usize) -> bool {
        self.sessions_served >= max_sessions
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }
}

impl Default for InstanceUsage {
    fn default() -> Self {
        Self::new()
    }
}

/// Represents a single Chrome browser instance in the pool
#[derive(Debug)]
pub struct BrowserInstance {
    pub id: usize,
    pub browser: Arc<Mutex<Browser>>,
    /// Task polling the DevTools connection; finished means the browser is gone
    pub handler: HandlerTask,
    pub usage: InstanceUsage,
    pub status: InstanceStatus,
}

impl BrowserInstance {
    pub fn new(id: usize, browser: Browser, handler: HandlerTask) -> Self {
        Self {
            id,
            browser: Arc::new(Mutex::new(browser)),
            handler,
            usage: InstanceUsage::new(),
            status: InstanceStatus::Healthy,
        }
    }

    pub fn mark_used(&mut self) {
        self.usage.last_used = Instant::now();
        self.usage.sessions_served += 1;
        self.status = InstanceStatus::Busy;
    }

    pub fn mark_available(&mut self) {
        self.status = InstanceStatus::Healthy;
    }

    pub fn mark_failed(&mut self) {
        self.usage.failure_count += 1;
        self.status = InstanceStatus::Failed;
    }

    pub fn is_alive(&self) -> bool {
        !self.handler.is_finished() && self.status != InstanceStatus::Failed
    }

    pub async fn shutdown(self) {
        if let Err(e) = self.browser.lock().await.close().await {
            debug!("Browser instance {} close failed: {}", self.id, e);
        }
        self.handler.abort();
    }
}

/// Exclusive use of one pooled browser for one session
///
/// Dropping the lease hands the instance back to the pool.
pub struct BrowserLease {
    pub browser: Arc<Mutex<Browser>>,
    pub instance_id: usize,
    pool: BrowserPool,
    permit: Option<OwnedSemaphorePermit>,
    failed: bool,
}

impl BrowserLease {
    /// Marks the instance for a restart before it is used again.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        let pool = self.pool.clone();
        let instance_id = self.instance_id;
        let failed = self.failed;
        let permit = self.permit.take();

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                pool.return_browser(instance_id, failed).await;
                drop(permit);
            });
        }
    }
}

pub struct BrowserPool {
    instances: Arc<Mutex<Vec<BrowserInstance>>>,
    available: Arc<Mutex<VecDeque<usize>>>,
    semaphore: Arc<Semaphore>,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl BrowserPool {
    pub async fn new(config: Arc<Config>, metrics: Arc<Metrics>) -> Result<Self, ScrapeError> {
        let pool = Self {
            instances: Arc::new(Mutex::new(Vec::new())),
            available: Arc::new(Mutex::new(VecDeque::new())),
            semaphore: Arc::new(Semaphore::new(config.browser_pool_size)),
            config,
            metrics,
            shutdown: CancellationToken::new(),
        };

        pool.initialize_instances().await?;
        pool.start_health_check_task();

        Ok(pool)
    }

    async fn initialize_instances(&self) -> Result<(), ScrapeError> {
        let mut instances = self.instances.lock().await;
        let mut available = self.available.lock().await;

        for i in 0..self.config.browser_pool_size {
            // Staggered launches avoid profile directory races
            if i > 0 {
                sleep(Duration::from_millis(500)).await;
            }

            match self.create_browser_instance(i).await {
                Ok(instance) => {
                    instances.push(instance);
                    available.push_back(i);
                    info!("Browser instance {} created successfully", i);
                }
                Err(e) => {
                    error!("Failed to create browser instance {}: {}", i, e);
                    for instance in instances.drain(..) {
                        instance.shutdown().await;
                    }
                    return Err(e);
                }
            }
        }

        info!(
            "Browser pool initialized with {} instances",
            instances.len()
        );
        Ok(())
    }

    async fn create_browser_instance(&self, id: usize) -> Result<BrowserInstance, ScrapeError> {
        let browser_config = create_browser_config_with_instance_id(&self.config, Some(id))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| ScrapeError::Browser(format!("failed to launch Chrome: {e}")))?;

        // The handler stream drives all DevTools traffic and must be polled
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("Browser {} handler error: {}", id, e);
                    return Err(e);
                }
            }
            debug!("Browser {} handler stream ended", id);
            Ok(())
        });

        Ok(BrowserInstance::new(id, browser, handler_task))
    }

    /// Waits for a free instance and leases it.
    pub async fn get_browser(&self) -> Result<BrowserLease, ScrapeError> {
        if self.shutdown.is_cancelled() {
            return Err(ScrapeError::Browser(
                "browser pool is shutting down".to_string(),
            ));
        }

        let permit = self.semaphore.clone().acquire_owned().await?;

        let instance_id = self
            .available
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| ScrapeError::Browser("no browser instance available".to_string()))?;

        let mut instances = self.instances.lock().await;
        let instance = match instances.get_mut(instance_id) {
            Some(instance) => instance,
            None => {
                return Err(ScrapeError::Browser(format!(
                    "unknown browser instance {instance_id}"
                )))
            }
        };

        let recycle = instance
            .usage
            .should_recycle(self.config.max_sessions_per_browser);
        if !instance.is_alive() || recycle {
            if recycle {
                debug!(
                    "Recycling browser instance {} after {} sessions",
                    instance_id, instance.usage.sessions_served
                );
            } else {
                warn!(
                    "Browser instance {} is not responding, restarting",
                    instance_id
                );
            }

            if let Err(e) = self.replace_instance(instance).await {
                drop(instances);
                self.available.lock().await.push_back(instance_id);
                return Err(e);
            }
        }

        instance.mark_used();
        Ok(BrowserLease {
            browser: instance.browser.clone(),
            instance_id,
            pool: self.clone(),
            permit: Some(permit),
            failed: false,
        })
    }

    pub async fn return_browser(&self, instance_id: usize, failed: bool) {
        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.get_mut(instance_id) {
            if failed {
                instance.mark_failed();
            } else {
                instance.mark_available();
            }
            self.available.lock().await.push_back(instance_id);
        }
    }

    /// Swaps a dead or worn-out instance for a freshly launched one.
    async fn replace_instance(&self, instance: &mut BrowserInstance) -> Result<(), ScrapeError> {
        instance.status = InstanceStatus::Restarting;

        if let Err(e) = instance.browser.lock().await.close().await {
            debug!("Closing browser instance {} failed: {}", instance.id, e);
        }
        instance.handler.abort();

        match self.create_browser_instance(instance.id).await {
            Ok(new_instance) => {
                *instance = new_instance;
                self.metrics.record_browser_restart();
                info!("Browser instance {} restarted", instance.id);
                Ok(())
            }
            Err(e) => {
                instance.mark_failed();
                error!("Failed to restart browser instance {}: {}", instance.id, e);
                Err(e)
            }
        }
    }

    fn start_health_check_task(&self) {
        let pool = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = pool.shutdown.cancelled() => break,
                    _ = interval.tick() => pool.health_check().await,
                }
            }
            debug!("Browser pool health check stopped");
        });
    }

    /// Restarts idle instances whose browser has gone away.
    async fn health_check(&self) {
        let idle: Vec<usize> = self.available.lock().await.iter().copied().collect();
        let mut instances = self.instances.lock().await;

        for instance_id in idle {
            let Some(instance) = instances.get_mut(instance_id) else {
                continue;
            };
            if instance.status == InstanceStatus::Busy || instance.is_alive() {
                continue;
            }

            warn!(
                "Browser instance {} failed health check (failures={}, age={:?})",
                instance_id,
                instance.usage.failure_count,
                instance.usage.age()
            );
            if self.replace_instance(instance).await.is_ok() {
                instance.mark_available();
            }
        }
    }

    pub async fn shutdown(&self) {
        info!("Shutting down browser pool...");
        self.shutdown.cancel();

        // Give in-flight leases a moment to come back
        for _ in 0..10 {
            if self.available.lock().await.len() == self.instances.lock().await.len() {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }

        let mut instances = self.instances.lock().await;
        for instance in instances.drain(..) {
            instance.shutdown().await;
        }
        self.available.lock().await.clear();

        info!("Browser pool shutdown complete");
    }

    pub async fn get_stats(&self) -> BrowserPoolStats {
        let instances = self.instances.lock().await;
        let available = self.available.lock().await;

        let mut stats = BrowserPoolStats {
            total_instances: instances.len(),
            available_instances: available.len(),
            ..Default::default()
        };

        for instance in instances.iter() {
            stats.sessions_served += instance.usage.sessions_served;
            match instance.status {
                InstanceStatus::Healthy => stats.healthy_instances += 1,
                InstanceStatus::Busy => stats.busy_instances += 1,
                InstanceStatus::Failed => stats.failed_instances += 1,
                InstanceStatus::Restarting => {}
            }
        }

        stats
    }
}

impl Clone for BrowserPool {
    fn clone(&self) -> Self {
        Self {
            instances: self.instances.clone(),
            available: self.available.clone(),
            semaphore: self.semaphore.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BrowserPoolStats {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub busy_instances: usize,
    pub failed_instances: usize,
    pub available_instances: usize,
    pub sessions_served: usize,
}
