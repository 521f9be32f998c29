//! Job types and payloads of the automation queue.

use serde::{Deserialize, Serialize};

use mailpulse_core::{AutomationId, ContactId, StepId};

use crate::jobs::NewJob;

pub const QUEUE: &str = "automations";

pub const RUN_WORKFLOW: &str = "automation.run_workflow";
pub const RUN_STEP: &str = "automation.run_step";
pub const FAN_OUT_STEP: &str = "automation.fan_out_step";
pub const ENROLL_AUDIENCE: &str = "automation.enroll_audience";

/// Enter one contact into an automation through its trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunWorkflow {
    pub automation_id: AutomationId,
    pub contact_id: ContactId,
}

/// Run one step for one contact and advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStep {
    pub step_id: StepId,
    pub contact_id: ContactId,
}

/// Enqueue `RunStep` for every contact waiting at a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutStep {
    pub step_id: StepId,
}

/// Enqueue `RunWorkflow` for every contact of the automation's audience.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollAudience {
    pub automation_id: AutomationId,
}

impl RunWorkflow {
    pub fn job(&self) -> Result<NewJob, serde_json::Error> {
        NewJob::typed(RUN_WORKFLOW, QUEUE, self)
    }
}

impl RunStep {
    pub fn job(&self) -> Result<NewJob, serde_json::Error> {
        NewJob::typed(RUN_STEP, QUEUE, self)
    }
}

impl FanOutStep {
    pub fn job(&self) -> Result<NewJob, serde_json::Error> {
        NewJob::typed(FAN_OUT_STEP, QUEUE, self)
    }
}

impl EnrollAudience {
    pub fn job(&self) -> Result<NewJob, serde_json::Error> {
        NewJob::typed(ENROLL_AUDIENCE, QUEUE, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_use_snake_case_keys() {
        let step_id = StepId::new();
        let contact_id = ContactId::new();
        let job = RunStep { step_id, contact_id }.job().unwrap();

        assert_eq!(job.job_type, RUN_STEP);
        assert_eq!(job.queue, QUEUE);
        assert_eq!(
            job.payload,
            serde_json::json!({"step_id": step_id, "contact_id": contact_id})
        );
    }
}
