//! Job-type registry: handlers and per-type options, built once at startup.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;

use super::store::JobStoreError;
use super::types::{Job, JobResult, JobTypeOptions};
use crate::mail::MailError;
use crate::store::StoreError;

/// Error returned by a handler; recorded as a failed attempt.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Jobs(#[from] JobStoreError),

    #[error(transparent)]
    Mail(#[from] MailError),

    #[error("{0}")]
    Other(String),
}

/// Executes one job type.
///
/// Handlers must tolerate running more than once for the same job: a lease can expire
/// while the first run is still in flight.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &Job) -> Result<JobResult, JobError>;
}

/// Adapts an async closure taking the job by value into a [`JobHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JobResult, JobError>> + Send + 'static,
{
    async fn run(&self, job: &Job) -> Result<JobResult, JobError> {
        (self.0)(job.clone()).await
    }
}

#[derive(Clone)]
pub struct RegisteredJob {
    pub handler: Arc<dyn JobHandler>,
    pub options: JobTypeOptions,
}

/// Maps job type names to handlers.
///
/// Populated before the executor starts and shared read-only as `Arc<JobRegistry>`.
#[derive(Default, Clone)]
pub struct JobRegistry {
    jobs: HashMap<String, RegisteredJob>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler with default options; replaces an earlier registration.
    pub fn register<H>(&mut self, job_type: impl Into<String>, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.register_with(job_type, JobTypeOptions::default(), handler)
    }

    pub fn register_with<H>(
        &mut self,
        job_type: impl Into<String>,
        options: JobTypeOptions,
        handler: H,
    ) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.jobs.insert(
            job_type.into(),
            RegisteredJob {
                handler: Arc::new(handler),
                options,
            },
        );
        self
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JobResult, JobError>> + Send + 'static,
    {
        self.register(job_type, FnHandler(f))
    }

    pub fn get(&self, job_type: &str) -> Option<&RegisteredJob> {
        self.jobs.get(job_type)
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.jobs.contains_key(job_type)
    }

    pub fn options(&self, job_type: &str) -> JobTypeOptions {
        self.jobs
            .get(job_type)
            .map(|r| r.options.clone())
            .unwrap_or_default()
    }

    /// Registered type names, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.jobs.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{NewJob, RetryPolicy};
    use chrono::Utc;
    use std::time::Duration;

    #[tokio::test]
    async fn closure_handlers_run() {
        let mut registry = JobRegistry::new();
        registry
            .register_fn("b.echo", |job: Job| async move { Ok(JobResult::output(job.payload)) })
            .register_fn("a.noop", |_job: Job| async { Ok(JobResult::success()) });

        assert_eq!(registry.job_types(), vec!["a.noop".to_string(), "b.echo".to_string()]);

        let job = Job::from_new(NewJob::new("b.echo", "q", serde_json::json!({"x": 1})), Utc::now());
        let result = registry.get("b.echo").unwrap().handler.run(&job).await.unwrap();
        assert_eq!(result, JobResult::Success(serde_json::json!({"x": 1})));
    }

    #[test]
    fn options_default_for_unknown_types() {
        let mut registry = JobRegistry::new();
        let options = JobTypeOptions::default()
            .with_lease(Duration::from_secs(60))
            .with_retry(RetryPolicy::fixed(3, Duration::from_secs(1)));
        registry.register_with("slow", options.clone(), FnHandler(|_job: Job| async {
            Ok(JobResult::success())
        }));

        assert_eq!(registry.options("slow"), options);
        assert_eq!(registry.options("missing"), JobTypeOptions::default());
        assert!(!registry.contains("missing"));
    }
}
