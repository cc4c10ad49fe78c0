//! Job record persistence
//!
//! The engine only needs atomic read and read-modify-write access to a single
//! record, plus a paginated listing for the gateway. [`MemoryJobRepository`]
//! is the in-process backend used by the CLI and the tests.

use crate::{JobId, JobRecord, JobStatus, ScrapeError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Mutation applied to a record under the repository's per-record lock.
///
/// Returning an error leaves the stored record unchanged.
pub type JobMutation = Box<dyn FnOnce(&mut JobRecord) -> Result<(), ScrapeError> + Send>;

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQuery {
    /// 1-based page number
    pub page: u32,
    pub limit: u32,
    pub status: Option<JobStatus>,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
            status: None,
        }
    }
}

impl JobQuery {
    pub fn validate(&self) -> Result<(), ScrapeError> {
        if self.page == 0 {
            return Err(ScrapeError::Validation("page must be >= 1".to_string()));
        }
        if self.limit == 0 || self.limit > MAX_PAGE_LIMIT {
            return Err(ScrapeError::Validation(format!(
                "limit must be between 1 and {MAX_PAGE_LIMIT}"
            )));
        }
        Ok(())
    }

    fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.limit as usize
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPage {
    pub items: Vec<JobRecord>,
    pub total: usize,
    pub page: u32,
    pub limit: u32,
    pub pages: usize,
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn insert(&self, record: JobRecord) -> Result<(), ScrapeError>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, ScrapeError>;

    /// Atomically applies `mutation` and returns the stored result.
    async fn update(&self, id: JobId, mutation: JobMutation) -> Result<JobRecord, ScrapeError>;

    /// Newest first, optionally filtered by status.
    async fn list(&self, query: &JobQuery) -> Result<JobPage, ScrapeError>;
}

#[derive(Debug, Default)]
pub struct MemoryJobRepository {
    jobs: DashMap<JobId, JobRecord>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn insert(&self, record: JobRecord) -> Result<(), ScrapeError> {
        use dashmap::mapref::entry::Entry;

        match self.jobs.entry(record.id) {
            Entry::Occupied(_) => Err(ScrapeError::Conflict(format!(
                "job {} already exists",
                record.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, ScrapeError> {
        Ok(self.jobs.get(&id).map(|entry| entry.value().clone()))
    }

    async fn update(&self, id: JobId, mutation: JobMutation) -> Result<JobRecord, ScrapeError> {
        let mut entry = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| ScrapeError::NotFound(id.to_string()))?;

        let mut next = entry.value().clone();
        mutation(&mut next)?;
        *entry.value_mut() = next.clone();
        Ok(next)
    }

    async fn list(&self, query: &JobQuery) -> Result<JobPage, ScrapeError> {
        query.validate()?;

        let mut matching: Vec<JobRecord> = self
            .jobs
            .iter()
            .filter(|entry| query.status.map_or(true, |status| entry.status == status))
            .map(|entry| entry.value().clone())
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len();
        let limit = query.limit as usize;
        let items = matching
            .into_iter()
            .skip(query.offset())
            .take(limit)
            .collect();

        Ok(JobPage {
            items,
            total,
            page: query.page,
            limit: query.limit,
            pages: std::cmp::max(1, (total + limit - 1) / limit),
        })
    }
}
