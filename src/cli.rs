use crate::{
    ArtifactKind, BrowserPool, ChromeSessionFactory, Config, Disposition, FsObjectStore, JobEngine,
    JobId, JobRecord, JobRequest, JobService, JobStatus, MemoryBroker, MemoryJobRepository,
    Metrics, PrometheusExporter, RenderStrategy, SystemClock, WorkerPool,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "scrapeflow")]
#[command(about = "Headless-browser page capture engine")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Number of workers")]
    pub workers: Option<usize>,

    #[arg(long, help = "Browser pool size")]
    pub browsers: Option<usize>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Root directory of the artifact store")]
    pub storage_dir: Option<PathBuf>,

    #[arg(long, help = "Serve Prometheus metrics on this port")]
    pub metrics_port: Option<u16>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture a single URL and follow its status
    Capture {
        #[arg(short, long, help = "URL to capture")]
        url: String,

        #[arg(
            long,
            default_value = "auto",
            help = "Render strategy (auto, fixed_delay, wait_for_element)"
        )]
        strategy: RenderStrategy,

        #[arg(
            long,
            default_value = "0",
            help = "Seconds to wait for the fixed_delay strategy"
        )]
        wait: u32,

        #[arg(long, help = "CSS selector for the wait_for_element strategy")]
        selector: Option<String>,

        #[arg(long, help = "Skip text extraction")]
        no_text: bool,

        #[arg(long, help = "Skip HTML extraction")]
        no_html: bool,

        #[arg(long, help = "Skip the screenshot")]
        no_screenshot: bool,

        #[arg(
            short,
            long,
            default_value = "output",
            help = "Directory for artifacts and job.json"
        )]
        output: PathBuf,
    },

    /// Capture every URL listed in a file
    Batch {
        #[arg(short, long, help = "Input file containing URLs (one per line)")]
        input: PathBuf,

        #[arg(short, long, help = "Output directory, one subdirectory per job")]
        output: PathBuf,

        #[arg(
            long,
            default_value = "auto",
            help = "Render strategy (auto, fixed_delay, wait_for_element)"
        )]
        strategy: RenderStrategy,

        #[arg(
            long,
            default_value = "0",
            help = "Seconds to wait for the fixed_delay strategy"
        )]
        wait: u32,
    },

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

impl Cli {
    /// File configuration (or defaults) with command-line overrides applied.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(workers) = self.workers {
            config.worker_pool_size = workers;
        }
        if let Some(browsers) = self.browsers {
            config.browser_pool_size = browsers;
        }
        if let Some(chrome_path) = &self.chrome_path {
            config.chrome_path = Some(chrome_path.clone());
        }
        if let Some(storage_dir) = &self.storage_dir {
            config.storage_root = storage_dir.clone();
        }

        config.validate().context("invalid configuration")?;

        info!("Configuration loaded successfully");
        info!("Workers: {}", config.worker_pool_size);
        info!("Browser pool size: {}", config.browser_pool_size);
        info!("Artifact store: {}", config.storage_root.display());
        Ok(config)
    }
}

/// In-process deployment of the engine: gateway, broker, workers and browsers.
pub struct CliRunner {
    pub service: Arc<JobService>,
    broker: Arc<MemoryBroker>,
    workers: WorkerPool,
    sessions: Arc<ChromeSessionFactory>,
}

impl CliRunner {
    pub async fn start(config: Config, metrics_port: Option<u16>) -> Result<Self> {
        if let Some(port) = metrics_port {
            PrometheusExporter::new(port)
                .start()
                .context("failed to start metrics exporter")?;
        }

        let config = Arc::new(config);
        let metrics = Arc::new(Metrics::new());
        let clock = Arc::new(SystemClock);

        let pool = BrowserPool::new(config.clone(), metrics.clone())
            .await
            .context("failed to start browser pool")?;
        let sessions = Arc::new(ChromeSessionFactory::new(pool, &config));

        fs::create_dir_all(&config.storage_root)
            .await
            .with_context(|| format!("cannot create {}", config.storage_root.display()))?;
        let store = Arc::new(FsObjectStore::new(config.storage_root.clone()));
        let repo = Arc::new(MemoryJobRepository::new());
        let broker = Arc::new(MemoryBroker::new(clock.clone()));

        let engine = Arc::new(JobEngine::new(
            &config,
            repo.clone(),
            broker.clone(),
            sessions.clone(),
            store.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let workers = WorkerPool::start(config.worker_pool_size, engine, broker.clone());
        let service = Arc::new(JobService::new(
            &config,
            repo,
            broker.clone(),
            store,
            clock,
            metrics,
        ));

        Ok(Self {
            service,
            broker,
            workers,
            sessions,
        })
    }

    pub async fn run(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Capture {
                url,
                strategy,
                wait,
                selector,
                no_text,
                no_html,
                no_screenshot,
                output,
            } => {
                let request = JobRequest {
                    url,
                    wait_time: wait,
                    render_strategy: strategy,
                    wait_for_selector: selector,
                    extract_text: !no_text,
                    extract_html: !no_html,
                    capture_screenshot: !no_screenshot,
                };
                self.run_capture(request, &output).await
            }
            Commands::Batch {
                input,
                output,
                strategy,
                wait,
            } => self.run_batch(&input, &output, strategy, wait).await,
            Commands::Validate { config } => validate_config_file(&config),
        }
    }

    pub async fn run_capture(&self, request: JobRequest, output: &Path) -> Result<()> {
        let job = self.service.create_job(request).await?;
        println!("Created job {}", job.id);

        let job = self.follow(job.id, true).await?;
        self.save_job(&job, output).await?;

        match job.status {
            JobStatus::Completed => {
                println!("Job {} completed:", job.id);
                println!("  URL: {}", job.url);
                if let Some(final_url) = &job.final_url {
                    println!("  Final URL: {final_url}");
                }
                if let Some(title) = &job.page_title {
                    println!("  Title: {title}");
                }
                if let Some(status) = job.http_status {
                    println!("  HTTP status: {status}");
                }
                println!("  Output: {}", output.display());
                Ok(())
            }
            status => bail!(
                "job {} ended {}: {}",
                job.id,
                status,
                job.error_message.as_deref().unwrap_or("no error recorded")
            ),
        }
    }

    pub async fn run_batch(
        &self,
        input: &Path,
        output: &Path,
        strategy: RenderStrategy,
        wait: u32,
    ) -> Result<()> {
        let content = fs::read_to_string(input)
            .await
            .with_context(|| format!("cannot read {}", input.display()))?;
        let urls = read_urls(&content);
        info!("Loaded {} URLs from {}", urls.len(), input.display());

        let mut jobs = Vec::with_capacity(urls.len());
        let mut error_count = 0;
        for url in urls {
            let request = JobRequest {
                url: url.clone(),
                wait_time: wait,
                render_strategy: strategy,
                ..Default::default()
            };
            match self.service.create_job(request).await {
                Ok(job) => jobs.push(job.id),
                Err(e) => {
                    error_count += 1;
                    warn!("Skipping {}: {}", url, e);
                }
            }
        }

        let finished = futures::future::join_all(jobs.into_iter().map(|job_id| async move {
            let job = self.follow(job_id, false).await?;
            self.save_job(&job, &output.join(job_id.to_string()))
                .await?;
            Ok::<JobRecord, anyhow::Error>(job)
        }))
        .await;

        let mut success_count = 0;
        for result in finished {
            match result {
                Ok(job) if job.status == JobStatus::Completed => success_count += 1,
                Ok(job) => {
                    error_count += 1;
                    warn!(
                        "Job {} for {} ended {}: {}",
                        job.id,
                        job.url,
                        job.status,
                        job.error_message.as_deref().unwrap_or("")
                    );
                }
                Err(e) => {
                    error_count += 1;
                    error!("{:#}", e);
                }
            }
        }

        info!(
            "Batch processing completed. Success: {}, Errors: {}",
            success_count, error_count
        );
        println!("Batch finished: {success_count} completed, {error_count} failed");
        Ok(())
    }

    /// Streams status events until the job is terminal and returns its record.
    async fn follow(&self, job_id: JobId, print: bool) -> Result<JobRecord> {
        let mut events = self.service.stream_status(job_id, CancellationToken::new());
        while let Some(event) = events.next().await {
            if print {
                println!("{}", event.to_json());
            }
            if let Some(error) = event.error {
                bail!("status stream for job {job_id} failed: {error}");
            }
        }
        Ok(self.service.get_job(job_id).await?)
    }

    /// Writes `job.json` and every artifact the job produced into `dir`.
    async fn save_job(&self, job: &JobRecord, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("cannot create {}", dir.display()))?;

        let record = serde_json::to_vec_pretty(job)?;
        fs::write(dir.join("job.json"), record).await?;

        if job.status != JobStatus::Completed {
            return Ok(());
        }

        for kind in [
            ArtifactKind::Screenshot,
            ArtifactKind::Html,
            ArtifactKind::Text,
        ] {
            let produced = match kind {
                ArtifactKind::Text => job.text_content.is_some() || job.text_path.is_some(),
                _ => job.artifact_path(kind).is_some(),
            };
            if !produced {
                continue;
            }

            let artifact = self
                .service
                .fetch_artifact(job.id, kind, Disposition::Download)
                .await
                .with_context(|| format!("cannot fetch {} of job {}", kind.as_str(), job.id))?;
            let path = dir.join(&artifact.filename);
            fs::write(&path, &artifact.bytes).await?;
            info!("Saved {}", path.display());
        }
        Ok(())
    }

    /// Stops the workers after their current job, then the browsers.
    pub async fn shutdown(self) {
        self.workers.shutdown().await;
        self.broker.close();
        let stats = self.sessions.pool().get_stats().await;
        info!(
            "Browser pool served {} sessions across {} instances",
            stats.sessions_served, stats.total_instances
        );
        self.sessions.pool().shutdown().await;
    }
}

pub fn validate_config_file(path: &Path) -> Result<()> {
    println!("Validating configuration: {}", path.display());

    let config = Config::from_file(path)?;

    println!("Configuration is valid:");
    println!("  Workers: {}", config.worker_pool_size);
    println!("  Browser pool size: {}", config.browser_pool_size);
    println!(
        "  Sessions per browser: {}",
        config.max_sessions_per_browser
    );
    println!(
        "  Time limits: soft {:?}, hard {:?}",
        config.soft_time_limit, config.hard_time_limit
    );
    println!(
        "  Retries: {} ({:?})",
        config.retry.max_retries, config.retry.backoff_schedule
    );
    println!("  Screenshot format: {:?}", config.screenshot_format);
    println!(
        "  Viewport: {}x{}",
        config.viewport.width, config.viewport.height
    );

    Ok(())
}

/// Non-empty lines that are not `#` comments.
pub fn read_urls(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.to_string())
        .collect()
}

pub fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_urls_skips_comments_and_blanks() {
        let urls = read_urls("https://a.example\n\n# note\n  https://b.example  \n");
        assert_eq!(urls, vec!["https://a.example", "https://b.example"]);
    }

    #[test]
    fn test_capture_args() {
        let cli = Cli::try_parse_from([
            "scrapeflow",
            "--workers",
            "2",
            "capture",
            "--url",
            "https://example.com",
            "--strategy",
            "wait_for_element",
            "--selector",
            "#app",
            "--no-screenshot",
        ])
        .unwrap();

        assert_eq!(cli.workers, Some(2));
        match cli.command {
            Commands::Capture {
                strategy,
                selector,
                no_screenshot,
                no_text,
                ..
            } => {
                assert_eq!(strategy, RenderStrategy::WaitForSelector);
                assert_eq!(selector.as_deref(), Some("#app"));
                assert!(no_screenshot);
                assert!(!no_text);
            }
            _ => panic!("expected capture command"),
        }
    }

    #[test]
    fn test_overrides_applied_and_validated() {
        let cli = Cli::try_parse_from([
            "scrapeflow",
            "--workers",
            "3",
            "--storage-dir",
            "/tmp/artifacts",
            "validate",
            "--config",
            "x.json",
        ])
        .unwrap();
        let config = cli.load_config().unwrap();
        assert_eq!(config.worker_pool_size, 3);
        assert_eq!(config.storage_root, PathBuf::from("/tmp/artifacts"));

        let cli = Cli::try_parse_from(["scrapeflow", "--workers", "0", "validate", "-c", "x.json"])
            .unwrap();
        assert!(cli.load_config().is_err());
    }
}
