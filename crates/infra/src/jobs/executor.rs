//! Lease-based job executor.
//!
//! Each queue is polled on its own task. A poll selects up to `concurrency` available
//! jobs of registered types, leases them in one all-or-nothing write, runs their
//! handlers concurrently and records every outcome against the lease token the worker
//! was granted. A slow queue never holds up another.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

use super::registry::JobRegistry;
use super::store::{JobStore, JobStoreError};
use super::types::{self, AttemptLog, FailureAction, Job, JobResult, LeaseRequest, RetryPolicy};

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// Name for logging
    pub name: String,
    /// Queues polled, each independently
    pub queues: Vec<String>,
    /// Maximum jobs leased per queue per cycle
    pub concurrency: usize,
    /// Sleep after a poll of a queue that found no work
    pub poll_interval: Duration,
    /// Sleep after losing a lease race
    pub conflict_backoff: Duration,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            name: "job-executor".to_string(),
            queues: vec!["default".to_string()],
            concurrency: 10,
            poll_interval: Duration::from_secs(1),
            conflict_backoff: Duration::from_millis(50),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    /// Queue polls, summed over every queue.
    pub cycles: u64,
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_released: u64,
    pub leases_lost: u64,
    pub lease_conflicts: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control a spawned executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Stop polling, wait for in-flight jobs to finish and return the final stats.
    pub async fn shutdown(mut self) -> ExecutorStats {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "job executor task ended abnormally");
            }
        }
        snapshot(&self.stats)
    }

    pub fn stats(&self) -> ExecutorStats {
        snapshot(&self.stats)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Failed,
    DeadLettered,
    Released,
    LeaseLost,
}

/// Polls a [`JobStore`] and runs jobs with the handlers of a [`JobRegistry`].
#[derive(Clone)]
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    config: JobExecutorConfig,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutor {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<JobRegistry>, config: JobExecutorConfig) -> Self {
        Self {
            store,
            registry,
            config,
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    pub fn config(&self) -> &JobExecutorConfig {
        &self.config
    }

    pub fn stats(&self) -> ExecutorStats {
        snapshot(&self.stats)
    }

    /// Poll every queue on its own task until shutdown is signalled.
    pub async fn process(self, shutdown: watch::Receiver<bool>) {
        info!(
            executor = %self.config.name,
            queues = ?self.config.queues,
            job_types = ?self.registry.job_types(),
            "job executor started"
        );
        let started = Instant::now();

        let mut pollers = JoinSet::new();
        for queue in self.config.queues.clone() {
            let executor = self.clone();
            let shutdown = shutdown.clone();
            pollers.spawn(async move { executor.poll_queue(queue, started, shutdown).await });
        }
        while let Some(joined) = pollers.join_next().await {
            if let Err(e) = joined {
                error!(executor = %self.config.name, error = %e, "queue poller ended abnormally");
            }
        }

        info!(executor = %self.config.name, "job executor stopped");
    }

    async fn poll_queue(&self, queue: String, started: Instant, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.bump(|s| s.uptime_secs = started.elapsed().as_secs());

            let processed = match self.run_queue(&queue).await {
                Ok(n) => n,
                Err(e) => {
                    error!(executor = %self.config.name, queue = %queue, error = %e, "queue poll failed");
                    0
                }
            };

            if processed == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Run [`JobExecutor::process`] on the tokio runtime.
    pub fn spawn(self) -> JobExecutorHandle {
        let (shutdown, rx) = watch::channel(false);
        let stats = self.stats.clone();
        let join = tokio::spawn(self.process(rx));
        JobExecutorHandle {
            shutdown,
            join: Some(join),
            stats,
        }
    }

    /// Poll every configured queue once, concurrently. Returns the number of jobs run.
    pub async fn run_cycle(&self) -> Result<usize, JobStoreError> {
        let mut polls = JoinSet::new();
        for queue in self.config.queues.clone() {
            let executor = self.clone();
            polls.spawn(async move { executor.run_queue(&queue).await });
        }

        let mut processed = 0;
        let mut failure = None;
        while let Some(joined) = polls.join_next().await {
            match joined {
                Ok(Ok(n)) => processed += n,
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(e) => error!(executor = %self.config.name, error = %e, "queue poll ended abnormally"),
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(processed),
        }
    }

    /// Run cycles until one finds no work, at most `max_cycles` times.
    pub async fn drain(&self, max_cycles: usize) -> Result<usize, JobStoreError> {
        let mut total = 0;
        for _ in 0..max_cycles {
            let processed = self.run_cycle().await?;
            if processed == 0 {
                break;
            }
            total += processed;
        }
        Ok(total)
    }

    async fn run_queue(&self, queue: &str) -> Result<usize, JobStoreError> {
        self.bump(|s| s.cycles += 1);
        let job_types = self.registry.job_types();
        if job_types.is_empty() {
            return Ok(0);
        }

        let now = types::now();
        let candidates = self
            .store
            .find_candidates(queue, &job_types, self.config.concurrency, now)
            .await?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let requests: Vec<LeaseRequest> = candidates
            .iter()
            .map(|job| LeaseRequest {
                job_id: job.id,
                timeout_at: types::after(now, self.registry.options(&job.job_type).lease),
            })
            .collect();

        let leased = match self.store.lease(&requests, now).await {
            Ok(leased) => leased,
            Err(JobStoreError::LeaseConflict { requested, leased }) => {
                debug!(queue, requested, leased, "lost lease race; backing off");
                self.bump(|s| s.lease_conflicts += 1);
                tokio::time::sleep(self.config.conflict_backoff).await;
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let count = leased.len();
        self.bump(|s| s.current_running += count);

        let mut running = JoinSet::new();
        for job in leased {
            let executor = self.clone();
            let span = tracing::info_span!(
                "job",
                job_id = %job.id,
                job_type = %job.job_type,
                queue = %job.queue,
                attempt = job.attempts_count + 1
            );
            running.spawn(async move { executor.execute_job(job).await }.instrument(span));
        }

        while let Some(joined) = running.join_next().await {
            let outcome = match joined {
                Ok(Ok(outcome)) => Some(outcome),
                Ok(Err(e)) => {
                    // The lease runs out and another cycle picks the job up again.
                    error!(queue, error = %e, "failed to record job outcome");
                    None
                }
                Err(e) => {
                    error!(queue, error = %e, "job task ended abnormally");
                    None
                }
            };
            self.bump(|s| {
                s.current_running = s.current_running.saturating_sub(1);
                s.jobs_processed += 1;
                match outcome {
                    Some(Outcome::Succeeded) => s.jobs_succeeded += 1,
                    Some(Outcome::Failed) => s.jobs_failed += 1,
                    Some(Outcome::DeadLettered) => {
                        s.jobs_failed += 1;
                        s.jobs_dead_lettered += 1;
                    }
                    Some(Outcome::Released) => s.jobs_released += 1,
                    Some(Outcome::LeaseLost) => s.leases_lost += 1,
                    None => {}
                }
            });
        }

        Ok(count)
    }

    async fn execute_job(&self, job: Job) -> Result<Outcome, JobStoreError> {
        let Some(lease) = job.locked_at else {
            warn!("leased job carries no lease token");
            return Ok(Outcome::LeaseLost);
        };

        let Some(registered) = self.registry.get(&job.job_type) else {
            warn!("no handler for job type; releasing");
            return Ok(if self.store.release(job.id, lease).await? {
                Outcome::Released
            } else {
                Outcome::LeaseLost
            });
        };

        let attempt = job.attempts_count + 1;
        let started = Utc::now();
        let handler = registered.handler.clone();
        let task_job = job.clone();
        let joined = tokio::spawn(
            async move { handler.run(&task_job).await }.in_current_span(),
        )
        .await;

        let result = match joined {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => JobResult::Failure(e.to_string()),
            Err(e) if e.is_panic() => {
                JobResult::Failure(format!("handler panicked: {}", panic_message(e.into_panic())))
            }
            Err(e) => JobResult::Failure(format!("handler task failed: {e}")),
        };

        match result {
            JobResult::Success(output) => {
                let log = AttemptLog::success(attempt, started, output);
                let duration_ms = log.duration_ms();
                if self.store.complete(job.id, lease, log).await? {
                    debug!(duration_ms, "job completed");
                    Ok(Outcome::Succeeded)
                } else {
                    warn!("lease lost before completion was recorded");
                    Ok(Outcome::LeaseLost)
                }
            }
            JobResult::Failure(error) => {
                self.record_failure(&job, lease, attempt, started, error, None, &registered.options.retry)
                    .await
            }
            JobResult::RetryAfter { error, delay } => {
                self.record_failure(
                    &job,
                    lease,
                    attempt,
                    started,
                    error,
                    Some(delay),
                    &registered.options.retry,
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_failure(
        &self,
        job: &Job,
        lease: DateTime<Utc>,
        attempt: u32,
        started: DateTime<Utc>,
        error: String,
        requested_delay: Option<Duration>,
        policy: &RetryPolicy,
    ) -> Result<Outcome, JobStoreError> {
        let action = if !policy.should_retry(attempt) {
            FailureAction::DeadLetter
        } else {
            let backoff = policy.delay_for_attempt(attempt);
            let delay = requested_delay.map_or(backoff, |d| d.max(backoff));
            if delay.is_zero() {
                FailureAction::Retry
            } else {
                FailureAction::RetryAt(types::after(types::now(), delay))
            }
        };

        let log = AttemptLog::failure(attempt, started, error.clone());
        if !self.store.fail(job.id, lease, log, action).await? {
            warn!(error = %error, "lease lost before failure was recorded");
            return Ok(Outcome::LeaseLost);
        }

        match action {
            FailureAction::DeadLetter => {
                warn!(error = %error, "job dead-lettered");
                Ok(Outcome::DeadLettered)
            }
            FailureAction::Retry => {
                debug!(error = %error, "job failed; eligible again");
                Ok(Outcome::Failed)
            }
            FailureAction::RetryAt(at) => {
                debug!(error = %error, retry_at = %at, "job failed; retry scheduled");
                Ok(Outcome::Failed)
            }
        }
    }

    fn bump(&self, f: impl FnOnce(&mut ExecutorStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

fn snapshot(stats: &Mutex<ExecutorStats>) -> ExecutorStats {
    stats.lock().map(|s| s.clone()).unwrap_or_default()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
