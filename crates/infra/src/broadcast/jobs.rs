//! Job types and payloads of the broadcast queue.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use mailpulse_core::{BroadcastId, ContactId, VariantId};

use crate::jobs::NewJob;

pub const QUEUE: &str = "broadcasts";

pub const SCHEDULE: &str = "broadcast.schedule";
pub const SEND_BATCH: &str = "broadcast.send_batch";
pub const SEND_FINAL_SAMPLE: &str = "broadcast.send_final_sample";
pub const PICK_WINNER: &str = "broadcast.pick_winner";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleBroadcast {
    pub broadcast_id: BroadcastId,
}

/// One batch of a variant slice. `variant_id` is `None` for a plain broadcast, which
/// sends its own content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendBatch {
    pub broadcast_id: BroadcastId,
    #[serde(default)]
    pub variant_id: Option<VariantId>,
    pub contact_ids: Vec<ContactId>,
}

/// One batch of the final sample; sent with the winning variant's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendFinalSample {
    pub broadcast_id: BroadcastId,
    pub contact_ids: Vec<ContactId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickWinner {
    pub broadcast_id: BroadcastId,
}

impl ScheduleBroadcast {
    pub fn job(&self) -> Result<NewJob, serde_json::Error> {
        NewJob::typed(SCHEDULE, QUEUE, self)
    }
}

impl SendBatch {
    pub fn job(&self) -> Result<NewJob, serde_json::Error> {
        NewJob::typed(SEND_BATCH, QUEUE, self)
    }
}

impl SendFinalSample {
    pub fn job(&self, delay: Duration) -> Result<NewJob, serde_json::Error> {
        Ok(NewJob::typed(SEND_FINAL_SAMPLE, QUEUE, self)?.delayed(delay))
    }
}

impl PickWinner {
    pub fn job(&self, delay: Duration) -> Result<NewJob, serde_json::Error> {
        Ok(NewJob::typed(PICK_WINNER, QUEUE, self)?.delayed(delay))
    }
}
