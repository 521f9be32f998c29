//! Job storage: the store contract and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::types::{AttemptLog, FailureAction, Job, JobId, LeaseRequest, NewJob};

/// Durable job table.
///
/// Leasing is the only coordination between workers: [`JobStore::lease`] must update
/// every requested row or none, and only rows that are still unleased (or whose lease
/// has expired) at `now`. Outcome methods take the lease token (`locked_at`) the worker
/// was granted and return `false` without writing when that lease is gone.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job; it becomes eligible at `now + delay`.
    async fn dispatch(&self, job: NewJob) -> Result<JobId, JobStoreError>;

    /// Insert several jobs in one write.
    async fn dispatch_many(&self, jobs: Vec<NewJob>) -> Result<Vec<JobId>, JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Available jobs of `queue` with one of `job_types`, oldest `dispatched_at` first.
    async fn find_candidates(
        &self,
        queue: &str,
        job_types: &[String],
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Lease all requested jobs with `locked_at = now`, or none of them.
    ///
    /// Returns [`JobStoreError::LeaseConflict`] when another worker got to any of them
    /// first.
    async fn lease(
        &self,
        requests: &[LeaseRequest],
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Mark a leased job completed.
    async fn complete(
        &self,
        id: JobId,
        lease: DateTime<Utc>,
        log: AttemptLog,
    ) -> Result<bool, JobStoreError>;

    /// Record a failed attempt and clear the lease.
    async fn fail(
        &self,
        id: JobId,
        lease: DateTime<Utc>,
        log: AttemptLog,
        action: FailureAction,
    ) -> Result<bool, JobStoreError>;

    /// Clear the lease without counting an attempt.
    async fn release(&self, id: JobId, lease: DateTime<Utc>) -> Result<bool, JobStoreError>;

    /// Jobs of a queue in dispatch order, finished ones included.
    async fn list_queue(&self, queue: &str, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    async fn stats(&self, queue: &str, now: DateTime<Utc>) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("lease conflict: {leased} of {requested} jobs leased")]
    LeaseConflict { requested: usize, leased: usize },
    #[error("job row could not be decoded: {0}")]
    Decode(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    /// Waiting to run, including delayed jobs and jobs with an expired lease.
    pub pending: usize,
    /// Holding a live lease.
    pub leased: usize,
    pub completed: usize,
    pub dead_lettered: usize,
}

/// In-memory job store for tests/dev.
///
/// One mutex guards the whole table, so every method behaves like a single
/// transaction.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .lock()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".to_string()))
    }

    fn holding<'a>(
        jobs: &'a mut HashMap<JobId, Job>,
        id: JobId,
        lease: DateTime<Utc>,
    ) -> Result<Option<&'a mut Job>, JobStoreError> {
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if job.locked_at != Some(lease) || job.is_finished() {
            return Ok(None);
        }
        Ok(Some(job))
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn dispatch(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        let job = Job::from_new(job, super::types::now());
        let id = job.id;
        self.table()?.insert(id, job);
        Ok(id)
    }

    async fn dispatch_many(&self, jobs: Vec<NewJob>) -> Result<Vec<JobId>, JobStoreError> {
        let at = super::types::now();
        let mut table = self.table()?;
        Ok(jobs
            .into_iter()
            .map(|new| {
                let job = Job::from_new(new, at);
                let id = job.id;
                table.insert(id, job);
                id
            })
            .collect())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.table()?.get(&id).cloned())
    }

    async fn find_candidates(
        &self,
        queue: &str,
        job_types: &[String],
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let table = self.table()?;
        let mut candidates: Vec<&Job> = table
            .values()
            .filter(|j| j.queue == queue && job_types.contains(&j.job_type) && j.is_available(now))
            .collect();
        candidates.sort_by_key(|j| (j.dispatched_at, j.id));
        Ok(candidates.into_iter().take(limit).cloned().collect())
    }

    async fn lease(
        &self,
        requests: &[LeaseRequest],
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut table = self.table()?;

        let leasable = requests
            .iter()
            .filter(|r| {
                table
                    .get(&r.job_id)
                    .is_some_and(|j| !j.is_finished() && j.is_unleased(now))
            })
            .count();
        if leasable != requests.len() {
            return Err(JobStoreError::LeaseConflict {
                requested: requests.len(),
                leased: leasable,
            });
        }

        let mut leased = Vec::with_capacity(requests.len());
        for request in requests {
            if let Some(job) = table.get_mut(&request.job_id) {
                job.locked_at = Some(now);
                job.timeout_at = Some(request.timeout_at);
                leased.push(job.clone());
            }
        }
        Ok(leased)
    }

    async fn complete(
        &self,
        id: JobId,
        lease: DateTime<Utc>,
        log: AttemptLog,
    ) -> Result<bool, JobStoreError> {
        let mut table = self.table()?;
        let Some(job) = Self::holding(&mut table, id, lease)? else {
            return Ok(false);
        };
        job.completed_at = Some(log.finished_at);
        job.locked_at = None;
        job.timeout_at = None;
        job.attempt_logs.push(log);
        Ok(true)
    }

    async fn fail(
        &self,
        id: JobId,
        lease: DateTime<Utc>,
        log: AttemptLog,
        action: FailureAction,
    ) -> Result<bool, JobStoreError> {
        let mut table = self.table()?;
        let Some(job) = Self::holding(&mut table, id, lease)? else {
            return Ok(false);
        };
        match action {
            FailureAction::Retry => {}
            FailureAction::RetryAt(at) => job.dispatched_at = at,
            FailureAction::DeadLetter => job.dead_lettered_at = Some(log.finished_at),
        }
        job.locked_at = None;
        job.timeout_at = None;
        job.attempts_count += 1;
        job.attempt_logs.push(log);
        Ok(true)
    }

    async fn release(&self, id: JobId, lease: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let mut table = self.table()?;
        let Some(job) = Self::holding(&mut table, id, lease)? else {
            return Ok(false);
        };
        job.locked_at = None;
        job.timeout_at = None;
        Ok(true)
    }

    async fn list_queue(&self, queue: &str, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let table = self.table()?;
        let mut jobs: Vec<&Job> = table.values().filter(|j| j.queue == queue).collect();
        jobs.sort_by_key(|j| (j.dispatched_at, j.id));
        Ok(jobs.into_iter().take(limit).cloned().collect())
    }

    async fn stats(&self, queue: &str, now: DateTime<Utc>) -> Result<JobStats, JobStoreError> {
        let table = self.table()?;
        let mut stats = JobStats::default();
        for job in table.values().filter(|j| j.queue == queue) {
            if job.completed_at.is_some() {
                stats.completed += 1;
            } else if job.dead_lettered_at.is_some() {
                stats.dead_lettered += 1;
            } else if job.is_unleased(now) {
                stats.pending += 1;
            } else {
                stats.leased += 1;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
impl InMemoryJobStore {
    /// Move every unfinished, unleased job of `job_type` to `now`. Returns how many moved.
    pub(crate) fn make_due(&self, job_type: &str) -> Result<usize, JobStoreError> {
        let now = super::types::now();
        let mut table = self.table()?;
        let mut moved = 0;
        for job in table
            .values_mut()
            .filter(|j| j.job_type == job_type && !j.is_finished() && j.is_unleased(now))
        {
            if job.dispatched_at > now {
                job.dispatched_at = now;
                moved += 1;
            }
        }
        Ok(moved)
    }
}
