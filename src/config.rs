//! Configuration management with serde serialization/deserialization
//!
//! This module provides the engine configuration: worker and browser pool
//! sizing, time limits, retry policy, result tiering and the browser launch
//! settings derived from it.

use crate::ScrapeError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for the capture engine
///
/// # Examples
///
/// ```rust
/// use scrapeflow::Config;
///
/// // Use default configuration
/// let config = Config::default();
///
/// // Smaller deployment
/// let config = Config {
///     worker_pool_size: 2,
///     browser_pool_size: 1,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Number of workers pulling tasks from the broker (default: 5)
    ///
    /// Bounds how many jobs execute at the same time.
    pub worker_pool_size: usize,

    /// Number of Chrome instances kept in the pool (default: 5)
    pub browser_pool_size: usize,

    /// Sessions served by one Chrome instance before it is recycled (default: 10)
    pub max_sessions_per_browser: usize,

    /// Budget for the initial page navigation (default: 30 seconds)
    pub navigation_timeout: Duration,

    /// Budget for the render wait (default: 60 seconds)
    pub rendering_timeout: Duration,

    /// Cooperative limit after which an attempt starts tearing down (default: 240 seconds)
    pub soft_time_limit: Duration,

    /// Wall-clock limit after which an attempt is abandoned (default: 300 seconds)
    pub hard_time_limit: Duration,

    /// Retry budget and backoff schedule
    pub retry: RetryConfig,

    /// Text smaller than this many bytes is stored inline on the job record (default: 100 KiB)
    pub inline_text_limit: usize,

    /// How often the status stream re-reads a job (default: 2 seconds)
    pub status_poll_interval: Duration,

    /// Browser viewport configuration
    pub viewport: Viewport,

    /// Resource blocking and browser feature settings
    pub optimization: OptimizationSettings,

    /// Encoding of stored screenshots (default: PNG)
    pub screenshot_format: OutputFormat,

    /// User agents rotated across sessions
    pub user_agents: Vec<String>,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Memory limit per Chrome instance in bytes (default: 1GB)
    pub memory_limit: Option<usize>,

    /// Root directory of the filesystem object store
    pub storage_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_pool_size: 5,
            browser_pool_size: 5,
            max_sessions_per_browser: 10,
            navigation_timeout: Duration::from_secs(30),
            rendering_timeout: Duration::from_secs(60),
            soft_time_limit: Duration::from_secs(240),
            hard_time_limit: Duration::from_secs(300),
            retry: RetryConfig::default(),
            inline_text_limit: 100 * 1024,
            status_poll_interval: Duration::from_secs(2),
            viewport: Viewport::default(),
            optimization: OptimizationSettings::default(),
            screenshot_format: OutputFormat::Png,
            user_agents: default_user_agents(),
            chrome_path: None,
            memory_limit: Some(1024 * 1024 * 1024), // 1GB
            storage_root: PathBuf::from("scrapeflow-data"),
        }
    }
}

impl Config {
    /// Loads a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ScrapeError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ScrapeError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|e| {
            ScrapeError::Configuration(format!("invalid config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ScrapeError> {
        let fail = |message: &str| Err(ScrapeError::Configuration(message.to_string()));

        if self.worker_pool_size == 0 {
            return fail("worker_pool_size must be greater than 0");
        }
        if self.browser_pool_size == 0 {
            return fail("browser_pool_size must be greater than 0");
        }
        if self.max_sessions_per_browser == 0 {
            return fail("max_sessions_per_browser must be greater than 0");
        }
        if self.navigation_timeout.is_zero() || self.rendering_timeout.is_zero() {
            return fail("navigation and rendering timeouts must be greater than 0");
        }
        if self.soft_time_limit.is_zero() || self.soft_time_limit >= self.hard_time_limit {
            return fail("soft_time_limit must be greater than 0 and below hard_time_limit");
        }
        if self.retry.backoff_schedule.is_empty() {
            return fail("retry.backoff_schedule must not be empty");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return fail("retry.jitter_ratio must be between 0 and 1");
        }
        if self.inline_text_limit == 0 {
            return fail("inline_text_limit must be greater than 0");
        }
        if self.status_poll_interval.is_zero() {
            return fail("status_poll_interval must be greater than 0");
        }
        if self.user_agents.is_empty() {
            return fail("user_agents must contain at least one entry");
        }
        Ok(())
    }
}

/// Retry budget for retryable capture failures
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (default: 3)
    pub max_retries: u32,

    /// Delay before each retry, indexed by attempt and clamped to the last entry
    pub backoff_schedule: Vec<Duration>,

    /// Upper bound of the random jitter added to each delay, as a fraction of it
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_schedule: vec![
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(45),
            ],
            jitter_ratio: 0.2,
        }
    }
}

/// Browser viewport configuration
///
/// # Examples
///
/// ```rust
/// use scrapeflow::Viewport;
///
/// let mobile = Viewport {
///     width: 375,
///     height: 667,
///     device_scale_factor: 2.0,
///     mobile: true,
/// };
/// assert!(mobile.mobile);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1920)
    pub width: u32,

    /// Viewport height in pixels (default: 1080)
    pub height: u32,

    /// Device pixel ratio (default: 1.0)
    pub device_scale_factor: f64,

    /// Whether to emulate a mobile device (default: false)
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }
}

/// Browser-side settings applied to every session
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OptimizationSettings {
    /// Resource types aborted during navigation
    /// (default: image, stylesheet, font, media)
    pub blocked_resource_types: Vec<String>,

    /// Enable JavaScript execution (default: true)
    pub enable_javascript: bool,

    /// Disable browser plugins (default: true)
    pub disable_plugins: bool,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self {
            blocked_resource_types: ["image", "stylesheet", "font", "media"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            enable_javascript: true,
            disable_plugins: true,
        }
    }
}

/// Supported encodings for stored screenshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// PNG format - lossless compression, best quality
    Png,
    /// JPEG format - lossy compression, smaller files
    Jpeg,
    /// WebP format - modern compression, good balance of size and quality
    Webp,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Webp => "webp",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Webp => "image/webp",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = ScrapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(OutputFormat::Png),
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "webp" => Ok(OutputFormat::Webp),
            other => Err(ScrapeError::Configuration(format!(
                "unsupported screenshot format '{other}'"
            ))),
        }
    }
}

pub fn default_user_agents() -> Vec<String> {
    [
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Generate Chrome arguments with unique instance ID for browser pool isolation
///
/// Each pooled instance gets its own user data directory, temp directory and
/// debugging port so concurrent instances never share a profile singleton.
///
/// # Examples
///
/// ```rust
/// use scrapeflow::{Config, get_chrome_args_with_instance_id};
///
/// let config = Config::default();
/// let args = get_chrome_args_with_instance_id(&config, Some(0));
/// assert!(args.iter().any(|arg| arg == "--headless"));
/// ```
pub fn get_chrome_args_with_instance_id(
    config: &Config,
    instance_id: Option<usize>,
) -> Vec<String> {
    let unique_id = match instance_id {
        Some(id) => format!("{}-{}", std::process::id(), id),
        None => format!("{}-{}", std::process::id(), uuid::Uuid::new_v4()),
    };

    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--disable-features=ProcessSingleton,TranslateUI".to_string(),
        "--no-process-singleton-dialog".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        ),
        format!("--user-data-dir=/tmp/scrapeflow-chromium-{}", unique_id),
        format!(
            "--remote-debugging-port={}",
            9222 + instance_id.unwrap_or(0)
        ),
        format!("--temp-dir=/tmp/scrapeflow-temp-{}", unique_id),
    ];

    if let Some(memory_limit) = config.memory_limit {
        args.push(format!(
            "--js-flags=--max-old-space-size={}",
            memory_limit / 1024 / 1024
        ));
    }

    if !config.optimization.enable_javascript {
        args.push("--disable-javascript".to_string());
    }

    if config.optimization.disable_plugins {
        args.push("--disable-plugins".to_string());
    }

    args
}

pub fn create_browser_config_with_instance_id(
    config: &Config,
    instance_id: Option<usize>,
) -> Result<chromiumoxide::browser::BrowserConfig, ScrapeError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(config.viewport.width, config.viewport.height)
        .args(get_chrome_args_with_instance_id(config, instance_id));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(ScrapeError::Browser)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.inline_text_limit, 102_400);
        assert_eq!(config.user_agents.len(), 5);
    }

    #[test]
    fn test_validation_rejects_bad_limits() {
        let config = Config {
            soft_time_limit: Duration::from_secs(300),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ScrapeError::Configuration(_))
        ));

        let config = Config {
            worker_pool_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            user_agents: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.backoff_schedule.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"worker_pool_size": 2, "screenshot_format": "webp", "retry": {"max_retries": 1}}"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.worker_pool_size, 2);
        assert_eq!(config.screenshot_format, OutputFormat::Webp);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.backoff_schedule.len(), 3);
        assert_eq!(config.browser_pool_size, 5);
    }

    #[test]
    fn test_chrome_args_are_isolated_per_instance() {
        let config = Config::default();
        let first = get_chrome_args_with_instance_id(&config, Some(0));
        let second = get_chrome_args_with_instance_id(&config, Some(1));
        assert!(first.contains(&"--remote-debugging-port=9222".to_string()));
        assert!(second.contains(&"--remote-debugging-port=9223".to_string()));
        assert!(first.iter().any(|arg| arg.starts_with("--user-data-dir=")));
        assert_ne!(first, second);
    }

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("JPG".parse::<OutputFormat>().unwrap(), OutputFormat::Jpeg);
        assert_eq!(OutputFormat::Webp.content_type(), "image/webp");
        assert!("gif".parse::<OutputFormat>().is_err());
    }
}
