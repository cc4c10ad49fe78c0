//! # scrapeflow
//!
//! Job orchestration engine for headless-browser page capture. Callers submit
//! a URL with render and extraction options; workers drive an isolated browser
//! session per attempt, store the HTML, text and screenshot results, retry
//! transient failures with backoff, and record a single terminal status per job.
//!
//! ## Pipeline
//!
//! | Stage | Component | Notes |
//! |-------|-----------|-------|
//! | Submission | [`JobService`] | Validates, records a Pending job, queues a [`JobTask`] |
//! | Delivery | [`TaskBroker`] | At-least-once, acknowledged after the terminal commit |
//! | Execution | [`JobEngine`] / [`WorkerPool`] | One job per worker, soft and hard time limits |
//! | Capture | [`SessionController`] | Navigate, wait, extract over a [`BrowserSession`] |
//! | Retry | [`RetryController`] | Scheduled backoff with jitter, bounded retry budget |
//! | Results | [`ResultStore`] | Small text inline, everything else in the [`ObjectStore`] |
//! | Status | [`StatusStreamer`] | Polled events until the job is terminal |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scrapeflow::{Config, JobRequest, MemoryBroker, MemoryJobRepository, MemoryObjectStore,
//!     Metrics, JobService, SystemClock};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let clock = Arc::new(SystemClock);
//!     let service = JobService::new(
//!         &config,
//!         Arc::new(MemoryJobRepository::new()),
//!         Arc::new(MemoryBroker::new(clock.clone())),
//!         Arc::new(MemoryObjectStore::new()),
//!         clock,
//!         Arc::new(Metrics::noop()),
//!     );
//!
//!     let job = service
//!         .create_job(JobRequest {
//!             url: "https://example.com".to_string(),
//!             ..Default::default()
//!         })
//!         .await?;
//!     println!("Queued job {}", job.id);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! scrapeflow capture --url https://example.com --output out/
//! scrapeflow batch --input urls.txt --output out/ --strategy fixed_delay --wait 3
//! scrapeflow validate --config scrapeflow.json
//! ```

/// Configuration and settings
pub mod config;

/// Error types and failure classification
pub mod error;

/// Job record and lifecycle state machine
pub mod job;

/// Injectable time source
pub mod clock;

/// Job record persistence
pub mod repository;

/// Task queue with acknowledgements and delayed redelivery
pub mod broker;

/// Retry and backoff decisions
pub mod retry;

/// Browser session abstraction and capture controller
pub mod session;

/// Browser pool management for Chrome instances
pub mod browser_pool;

/// Chrome-backed browser sessions
pub mod chrome;

/// Object store and result tiering
pub mod storage;

/// Worker execution engine
pub mod engine;

/// Status streaming
pub mod status;

/// Submission gateway
pub mod gateway;

/// Metrics collection
pub mod metrics;

/// Command-line interface implementation
pub mod cli;

/// Utility functions and helpers
pub mod utils;


pub use broker::*;
pub use browser_pool::*;
pub use chrome::*;
pub use cli::*;
pub use clock::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use gateway::*;
pub use job::*;
pub use metrics::*;
pub use repository::*;
pub use retry::*;
pub use session::*;
pub use status::*;
pub use storage::*;
pub use utils::*;
