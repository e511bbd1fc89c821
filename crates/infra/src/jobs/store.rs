//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use reconcile_core::{CompanyId, DomainError};

use super::types::{DeadLetterEntry, Job, JobId, JobStatus};

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    fn get(&self, company_id: CompanyId, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Claim the oldest ready job and mark it running.
    fn claim_next(&self) -> Result<Option<Job>, JobStoreError>;

    /// Move a job to the dead-letter queue.
    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError>;

    fn list_dead_letters(&self, company_id: CompanyId) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    /// Counts across all companies; used to wait for workers to drain.
    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job)
    }

    fn get(&self, company_id: CompanyId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(company_id, job_id)
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next()
    }

    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError> {
        (**self).dead_letter(job, reason)
    }

    fn list_dead_letters(&self, company_id: CompanyId) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        (**self).list_dead_letters(company_id)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<JobStoreError> for DomainError {
    fn from(err: JobStoreError) -> Self {
        DomainError::transient(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

impl JobStats {
    /// Nothing queued or in flight.
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.running == 0 && self.failed == 0
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterEntry>>,
}

fn poisoned<T>(_: T) -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, company_id: CompanyId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs
            .get(&job_id)
            .filter(|job| job.company_id == company_id)
            .cloned())
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if !jobs.contains_key(&job.id) {
            return Err(JobStoreError::NotFound(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let now = Utc::now();

        // Oldest first
        let next = jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .min_by_key(|j| (j.created_at, j.id.0))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.mark_running();
                job.clone()
            })
        }))
    }

    fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let mut dls = self.dead_letters.write().map_err(poisoned)?;

        if !matches!(job.status, JobStatus::DeadLettered { .. }) {
            job.mark_dead(reason.clone());
        }
        jobs.insert(job.id, job.clone());
        dls.insert(job.id, DeadLetterEntry::new(job, reason));
        Ok(())
    }

    fn list_dead_letters(&self, company_id: CompanyId) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let dls = self.dead_letters.read().map_err(poisoned)?;
        let mut result: Vec<_> = dls
            .values()
            .filter(|e| e.job.company_id == company_id)
            .cloned()
            .collect();
        result.sort_by_key(|e| e.dead_lettered_at);
        Ok(result)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
                JobStatus::DeadLettered { .. } => stats.dead_lettered += 1,
            }
        }
        Ok(stats)
    }
}
