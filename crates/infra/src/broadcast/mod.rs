//! Broadcast AB-test scheduling.
//!
//! - `jobs`: payloads and job type names of the `broadcasts` queue
//! - `scheduler`: the producer entry point and the handlers

pub mod jobs;
pub mod scheduler;

use std::sync::Arc;

use thiserror::Error;

use mailpulse_broadcasts::PartitionError;
use mailpulse_core::{BroadcastId, DomainError};
use mailpulse_segments::SegmentError;

pub use jobs::{
    PickWinner, ScheduleBroadcast, SendBatch, SendFinalSample, PICK_WINNER, QUEUE, SCHEDULE,
    SEND_BATCH, SEND_FINAL_SAMPLE,
};
pub use scheduler::{
    BroadcastScheduler, BroadcastSettings, DEFAULT_BATCH_SIZE, DEFAULT_WINNER_GRACE,
    NO_WINNER_RETRY,
};

use crate::jobs::{FnHandler, Job, JobError, JobRegistry, JobStoreError, JobTypeOptions};
use crate::store::StoreError;

/// The broadcast cannot be sent as configured. Retrying does not help.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Segment(#[from] SegmentError),
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("broadcast {0} not found")]
    NotFound(BroadcastId),

    #[error("invalid broadcast: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("broadcast {0} was modified concurrently")]
    Conflict(BroadcastId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Jobs(#[from] JobStoreError),

    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<BroadcastError> for JobError {
    fn from(err: BroadcastError) -> Self {
        match err {
            BroadcastError::Store(e) => JobError::Store(e),
            BroadcastError::Jobs(e) => JobError::Jobs(e),
            BroadcastError::Payload(e) => JobError::Payload(e),
            other => JobError::Other(other.to_string()),
        }
    }
}

/// Register the broadcast job types.
pub fn register(
    registry: &mut JobRegistry,
    scheduler: Arc<BroadcastScheduler>,
    options: JobTypeOptions,
) {
    let s = scheduler.clone();
    registry.register_with(
        SCHEDULE,
        options.clone(),
        FnHandler(move |job: Job| {
            let s = s.clone();
            async move { s.schedule(job.payload_as()?).await }
        }),
    );

    let s = scheduler.clone();
    registry.register_with(
        SEND_BATCH,
        options.clone(),
        FnHandler(move |job: Job| {
            let s = s.clone();
            async move { s.send_batch(job.payload_as()?).await }
        }),
    );

    let s = scheduler.clone();
    registry.register_with(
        SEND_FINAL_SAMPLE,
        options.clone(),
        FnHandler(move |job: Job| {
            let s = s.clone();
            async move { s.send_final_sample(job.payload_as()?).await }
        }),
    );

    let s = scheduler;
    registry.register_with(
        PICK_WINNER,
        options,
        FnHandler(move |job: Job| {
            let s = s.clone();
            async move { s.pick_winner(job.payload_as()?).await }
        }),
    );
}
