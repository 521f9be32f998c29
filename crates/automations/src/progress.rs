//! Per-contact progress through an automation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mailpulse_core::{ContactId, StepId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContactStepStatus {
    Completed,
}

impl ContactStepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactStepStatus::Completed => "COMPLETED",
        }
    }
}

/// Completion record for one contact at one step.
///
/// The store keeps at most one row per `(contact_id, step_id)`; an existing row means
/// the step has already run for the contact and re-deliveries are absorbed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactAutomationStep {
    pub contact_id: ContactId,
    pub step_id: StepId,
    pub status: ContactStepStatus,
    /// Branch the contact left the step on; `None` when its path stopped here.
    #[serde(default)]
    pub branch: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContactAutomationStep {
    pub fn completed(contact_id: ContactId, step_id: StepId, branch: Option<u32>) -> Self {
        let now = Utc::now();
        Self {
            contact_id,
            step_id,
            status: ContactStepStatus::Completed,
            branch,
            created_at: now,
            updated_at: now,
        }
    }
}
