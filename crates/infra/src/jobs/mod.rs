//! Durable job queue with lease-based polling.
//!
//! ## Design
//!
//! - Jobs are rows: type, queue, JSON payload, dispatch time, lease columns, attempt log
//! - Workers poll per queue and lease a batch in one conditional write
//! - Expired leases are reclaimed by any worker; handlers must tolerate re-execution
//! - Failures retry per job type (unlimited and immediate unless configured)
//! - Rows are never deleted
//!
//! ## Components
//!
//! - `JobStore`: persistence contract (`InMemoryJobStore`, `PostgresJobStore`)
//! - `JobRegistry`: job type -> handler and options, built once at startup
//! - `JobExecutor`: the polling loop

pub mod executor;
pub mod postgres;
pub mod registry;
pub mod store;
pub mod types;

pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle};
pub use postgres::PostgresJobStore;
pub use registry::{FnHandler, JobError, JobHandler, JobRegistry, RegisteredJob};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    AttemptLog, BackoffStrategy, FailureAction, Job, JobId, JobResult, JobTypeOptions,
    LeaseRequest, NewJob, RetryPolicy, DEFAULT_LEASE,
};
