//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default lease granted to a worker for one job.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(15);

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current time at the precision Postgres stores (microseconds).
///
/// Lease tokens are compared by equality, so every timestamp written as a lease
/// must survive a database round trip unchanged.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub(crate) fn after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    #[default]
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy for one job type.
///
/// The default retries forever with no delay: a failed job is eligible again as soon
/// as its lease is cleared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts before the job is dead-lettered; `None` never gives up.
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl RetryPolicy {
    pub fn unlimited() -> Self {
        Self {
            max_attempts: None,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * f64::from(attempt)).min(max_ms),
        };

        // Deterministic jitter derived from the attempt number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((f64::from(attempt) * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether a job that has failed `attempts` times may run again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }
}

/// Per-job-type execution options.
#[derive(Debug, Clone, PartialEq)]
pub struct JobTypeOptions {
    pub lease: Duration,
    pub retry: RetryPolicy,
}

impl Default for JobTypeOptions {
    fn default() -> Self {
        Self {
            lease: DEFAULT_LEASE,
            retry: RetryPolicy::default(),
        }
    }
}

impl JobTypeOptions {
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Record of one execution attempt, appended to the job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptLog {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AttemptLog {
    pub fn success(attempt: u32, started_at: DateTime<Utc>, output: serde_json::Value) -> Self {
        Self {
            attempt,
            started_at,
            finished_at: Utc::now(),
            success: true,
            output: (!output.is_null()).then_some(output),
            error: None,
        }
    }

    pub fn failure(attempt: u32, started_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            attempt,
            started_at,
            finished_at: Utc::now(),
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// A persisted job row.
///
/// Rows are never deleted. A job is available when it is neither completed nor
/// dead-lettered, its `dispatched_at` has passed and it holds no live lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub queue: String,
    pub payload: serde_json::Value,
    /// Earliest time the job may run.
    pub dispatched_at: DateTime<Utc>,
    /// Lease start; doubles as the lease token.
    pub locked_at: Option<DateTime<Utc>>,
    /// Lease expiry.
    pub timeout_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    /// Failed attempts so far.
    pub attempts_count: u32,
    pub attempt_logs: Vec<AttemptLog>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub(crate) fn from_new(new: NewJob, at: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            dispatched_at: after(at, new.delay),
            job_type: new.job_type,
            queue: new.queue,
            payload: new.payload,
            locked_at: None,
            timeout_at: None,
            completed_at: None,
            dead_lettered_at: None,
            attempts_count: 0,
            attempt_logs: Vec::new(),
            created_at: at,
        }
    }

    /// Not locked, or the lease has expired.
    pub fn is_unleased(&self, now: DateTime<Utc>) -> bool {
        match (self.locked_at, self.timeout_at) {
            (None, _) => true,
            (Some(_), Some(timeout)) => timeout < now,
            (Some(_), None) => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.completed_at.is_some() || self.dead_lettered_at.is_some()
    }

    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        !self.is_finished() && self.dispatched_at <= now && self.is_unleased(now)
    }

    /// Decode the payload into the handler's payload type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// A job to be dispatched.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub delay: Duration,
}

impl NewJob {
    pub fn new(
        job_type: impl Into<String>,
        queue: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            queue: queue.into(),
            payload,
            delay: Duration::ZERO,
        }
    }

    /// Serialize a typed payload.
    pub fn typed<T: Serialize>(
        job_type: impl Into<String>,
        queue: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(job_type, queue, serde_json::to_value(payload)?))
    }

    /// Hold the job back for `delay` after dispatch.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Lease request for one candidate job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseRequest {
    pub job_id: JobId,
    pub timeout_at: DateTime<Utc>,
}

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Eligible again as soon as the lease is cleared.
    Retry,
    /// Eligible again from the given time.
    RetryAt(DateTime<Utc>),
    /// Stop retrying.
    DeadLetter,
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    /// Completed; the output is kept in the attempt log.
    Success(serde_json::Value),
    /// Failed; retried according to the job type's policy.
    Failure(String),
    /// Failed; retry no earlier than `delay` from now.
    RetryAfter { error: String, delay: Duration },
}

impl JobResult {
    pub fn success() -> Self {
        Self::Success(serde_json::Value::Null)
    }

    pub fn output(value: serde_json::Value) -> Self {
        Self::Success(value)
    }

    pub fn retry_after(error: impl Into<String>, delay: Duration) -> Self {
        Self::RetryAfter {
            error: error.into(),
            delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_retries_forever_without_delay() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(10_000));
        assert_eq!(policy.delay_for_attempt(7), Duration::ZERO);
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10))
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(10));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            max_delay: Duration::from_secs(10),
            ..RetryPolicy::fixed(5, Duration::from_millis(100))
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn availability_follows_dispatch_time_and_lease() {
        let t0 = now();
        let mut job = Job::from_new(
            NewJob::new("t", "q", serde_json::json!({})).delayed(Duration::from_secs(10)),
            t0,
        );

        assert!(!job.is_available(t0));
        let later = after(t0, Duration::from_secs(10));
        assert!(job.is_available(later));

        job.locked_at = Some(later);
        job.timeout_at = Some(after(later, DEFAULT_LEASE));
        assert!(!job.is_available(after(later, Duration::from_secs(15))));
        assert!(job.is_available(after(later, Duration::from_secs(16))));

        job.completed_at = Some(later);
        assert!(!job.is_available(after(later, Duration::from_secs(60))));
    }

    #[test]
    fn now_is_truncated_to_microseconds() {
        let t = now();
        assert_eq!(t.timestamp_subsec_nanos() % 1_000, 0);
    }
}
