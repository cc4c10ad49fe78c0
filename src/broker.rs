//! Task delivery between the submission gateway and the workers
//!
//! Delivery is at-least-once: a task stays in the broker's unacked ledger from
//! the moment a worker dequeues it until the worker acknowledges it, and can be
//! redelivered from there if the worker disappears.

use crate::{Clock, JobId, ScrapeError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Message referencing the job a worker should execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTask {
    pub job_id: JobId,
}

impl JobTask {
    pub fn new(job_id: JobId) -> Self {
        Self { job_id }
    }
}

/// A task handed to one worker, identified by its delivery tag
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub task: JobTask,
    pub redelivered: bool,
}

#[async_trait]
pub trait TaskBroker: Send + Sync {
    async fn enqueue(&self, task: JobTask) -> Result<(), ScrapeError>;

    /// Makes the task visible to workers after `delay`.
    async fn enqueue_after(&self, task: JobTask, delay: Duration) -> Result<(), ScrapeError>;

    /// Waits for the next task. `None` once the broker is closed.
    async fn dequeue(&self) -> Option<Delivery>;

    async fn ack(&self, tag: u64) -> Result<(), ScrapeError>;

    /// Hands an unacknowledged task back for redelivery.
    async fn reject(&self, tag: u64) -> Result<(), ScrapeError>;
}

type QueueItem = (JobTask, bool);

pub struct MemoryBroker {
    sender: mpsc::UnboundedSender<QueueItem>,
    receiver: Mutex<mpsc::UnboundedReceiver<QueueItem>>,
    unacked: DashMap<u64, JobTask>,
    next_tag: AtomicU64,
    clock: Arc<dyn Clock>,
    closed: CancellationToken,
}

impl MemoryBroker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            unacked: DashMap::new(),
            next_tag: AtomicU64::new(1),
            clock,
            closed: CancellationToken::new(),
        }
    }

    /// Redelivers every task a worker took but never acknowledged, the way a
    /// broker reacts to a consumer that went away mid-task.
    pub fn recover_unacked(&self) -> usize {
        let tags: Vec<u64> = self.unacked.iter().map(|entry| *entry.key()).collect();
        let mut recovered = 0;
        for tag in tags {
            if let Some((_, task)) = self.unacked.remove(&tag) {
                if self.sender.send((task, true)).is_ok() {
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            warn!("Redelivering {} unacknowledged task(s)", recovered);
        }
        recovered
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.len()
    }

    /// Stops handing out tasks; pending `dequeue` calls return `None`.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn push(&self, task: JobTask, redelivered: bool) -> Result<(), ScrapeError> {
        if self.is_closed() {
            return Err(ScrapeError::Broker("broker is closed".to_string()));
        }
        self.sender
            .send((task, redelivered))
            .map_err(|e| ScrapeError::Broker(e.to_string()))
    }
}

#[async_trait]
impl TaskBroker for MemoryBroker {
    async fn enqueue(&self, task: JobTask) -> Result<(), ScrapeError> {
        debug!("Enqueued job {}", task.job_id);
        self.push(task, false)
    }

    async fn enqueue_after(&self, task: JobTask, delay: Duration) -> Result<(), ScrapeError> {
        if self.is_closed() {
            return Err(ScrapeError::Broker("broker is closed".to_string()));
        }

        let sender = self.sender.clone();
        let clock = self.clock.clone();
        let closed = self.closed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = closed.cancelled() => {
                    warn!("Broker closed before delayed redelivery of job {}", task.job_id);
                }
                _ = clock.sleep(delay) => {
                    if sender.send((task, true)).is_err() {
                        warn!("Dropped delayed redelivery of job {}", task.job_id);
                    }
                }
            }
        });

        debug!(
            "Scheduled job {} for redelivery in {:?}",
            task.job_id, delay
        );
        Ok(())
    }

    async fn dequeue(&self) -> Option<Delivery> {
        let (task, redelivered) = {
            let mut receiver = self.receiver.lock().await;
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return None,
                item = receiver.recv() => item?,
            }
        };

        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        self.unacked.insert(tag, task);
        Some(Delivery {
            tag,
            task,
            redelivered,
        })
    }

    async fn ack(&self, tag: u64) -> Result<(), ScrapeError> {
        self.unacked
            .remove(&tag)
            .map(|_| ())
            .ok_or_else(|| ScrapeError::Broker(format!("unknown delivery tag {tag}")))
    }

    async fn reject(&self, tag: u64) -> Result<(), ScrapeError> {
        let (_, task) = self
            .unacked
            .remove(&tag)
            .ok_or_else(|| ScrapeError::Broker(format!("unknown delivery tag {tag}")))?;
        self.push(task, true)
    }
}
