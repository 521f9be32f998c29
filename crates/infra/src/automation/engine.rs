//! Handlers of the automation queue.
//!
//! Progress is recorded per `(contact, step)`; a step that already has a row is never
//! run again for the contact, so every handler here is safe to re-deliver.

use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use mailpulse_automations::{
    select_child, AutomationStep, AutomationTree, StepOutcome, TreeError, TriggerConfig,
    BRANCH_DEFAULT,
};
use mailpulse_core::{AutomationId, ContactId, StepId};
use mailpulse_segments::{compile_optional, Predicate};

use super::jobs::{EnrollAudience, FanOutStep, RunStep, RunWorkflow};
use super::runners::{RunnerRegistry, StepBuildError, StepContext};
use crate::jobs::{JobError, JobId, JobResult, JobStore, JobStoreError, NewJob};
use crate::mail::MailSender;
use crate::store::{StoreError, Stores};

pub const DEFAULT_PAGE_SIZE: usize = 75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutomationSettings {
    /// Contacts read per page by the fan-out and enrolment scans.
    pub page_size: usize,
}

impl Default for AutomationSettings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Why an automation cannot be activated.
#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("automation {0} not found")]
    NotFound(AutomationId),

    #[error("automation {0} is inactive")]
    Inactive(AutomationId),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("step {step} has unregistered subtype {subtype}")]
    UnknownSubtype { step: StepId, subtype: String },

    #[error("step {step} is misconfigured: {source}")]
    InvalidStep {
        step: StepId,
        #[source]
        source: StepBuildError,
    },

    #[error("trigger {step} is misconfigured: {reason}")]
    InvalidTrigger { step: StepId, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Jobs(#[from] JobStoreError),

    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

fn trigger_predicate(trigger: &AutomationStep) -> Result<Predicate, String> {
    let config: TriggerConfig = trigger.config_as().map_err(|e| e.to_string())?;
    compile_optional(config.filter.as_ref()).map_err(|e| e.to_string())
}

fn done(reason: &str) -> JobResult {
    JobResult::output(json!({ "skipped": reason }))
}

pub struct AutomationEngine {
    stores: Stores,
    jobs: Arc<dyn JobStore>,
    mail: Arc<dyn MailSender>,
    runners: RunnerRegistry,
    settings: AutomationSettings,
}

impl AutomationEngine {
    pub fn new(
        stores: Stores,
        jobs: Arc<dyn JobStore>,
        mail: Arc<dyn MailSender>,
        runners: RunnerRegistry,
        settings: AutomationSettings,
    ) -> Self {
        Self {
            stores,
            jobs,
            mail,
            runners,
            settings,
        }
    }

    pub fn settings(&self) -> AutomationSettings {
        self.settings
    }

    /// Validate the automation's step tree and every step's configuration, then
    /// dispatch `enroll_audience`.
    ///
    /// Nothing is dispatched when validation fails.
    pub async fn activate(&self, automation_id: AutomationId) -> Result<JobId, ActivationError> {
        let automation = self
            .stores
            .automations
            .get_automation(automation_id)
            .await?
            .ok_or(ActivationError::NotFound(automation_id))?;
        if !automation.active {
            return Err(ActivationError::Inactive(automation_id));
        }

        let steps = self.stores.automations.steps(automation_id).await?;
        let tree = AutomationTree::new(automation_id, steps)?;
        self.validate_steps(&tree)?;

        let job_id = self
            .jobs
            .dispatch(EnrollAudience { automation_id }.job()?)
            .await?;
        info!(automation_id = %automation_id, steps = tree.len(), job_id = %job_id, "automation activated");
        Ok(job_id)
    }

    fn validate_steps(&self, tree: &AutomationTree) -> Result<(), ActivationError> {
        let trigger = tree.trigger();
        trigger_predicate(trigger).map_err(|reason| ActivationError::InvalidTrigger {
            step: trigger.id,
            reason,
        })?;

        for step in tree.walk().into_iter().filter(|s| !s.is_trigger()) {
            match self.runners.build(step) {
                None => {
                    return Err(ActivationError::UnknownSubtype {
                        step: step.id,
                        subtype: step.subtype.clone(),
                    });
                }
                Some(Err(source)) => {
                    return Err(ActivationError::InvalidStep {
                        step: step.id,
                        source,
                    });
                }
                Some(Ok(_)) => {}
            }
        }
        Ok(())
    }

    /// Evaluate the trigger for one contact and start the workflow on a match.
    pub async fn run_workflow(&self, payload: RunWorkflow) -> Result<JobResult, JobError> {
        let RunWorkflow {
            automation_id,
            contact_id,
        } = payload;

        let Some(automation) = self.stores.automations.get_automation(automation_id).await? else {
            return Ok(done("automation not found"));
        };
        if !automation.active {
            return Ok(done("automation inactive"));
        }
        let Some(trigger) = self.stores.automations.trigger_step(automation_id).await? else {
            return Ok(done("automation has no trigger"));
        };
        let Some(contact) = self.stores.contacts.get_contact(contact_id).await? else {
            return Ok(done("contact not found"));
        };
        if contact.audience_id != automation.audience_id {
            return Ok(done("contact outside the automation's audience"));
        }
        if self
            .stores
            .automations
            .progress(contact_id, trigger.id)
            .await?
            .is_some()
        {
            return Ok(done("already enrolled"));
        }

        let predicate = match trigger_predicate(&trigger) {
            Ok(predicate) => predicate,
            Err(error) => {
                warn!(step_id = %trigger.id, %error, "trigger cannot be evaluated");
                return Ok(done("invalid trigger"));
            }
        };
        if !predicate.matches(&contact) {
            return Ok(JobResult::output(json!({ "matched": false })));
        }

        if !self
            .stores
            .automations
            .record_completion(contact_id, trigger.id, Some(BRANCH_DEFAULT))
            .await?
        {
            return Ok(done("already enrolled"));
        }

        let next = self.advance(&trigger, contact_id, StepOutcome::next()).await?;
        info!(
            automation_id = %automation_id,
            contact_id = %contact_id,
            "contact entered automation"
        );
        Ok(JobResult::output(json!({ "matched": true, "next": next })))
    }

    /// Run one step for one contact, record it, and move to the selected child.
    pub async fn run_step(&self, payload: RunStep) -> Result<JobResult, JobError> {
        let RunStep {
            step_id,
            contact_id,
        } = payload;

        if self
            .stores
            .automations
            .progress(contact_id, step_id)
            .await?
            .is_some()
        {
            return Ok(done("step already completed"));
        }
        let Some(step) = self.stores.automations.get_step(step_id).await? else {
            return Ok(done("step not found"));
        };
        let Some(contact) = self.stores.contacts.get_contact(contact_id).await? else {
            return Ok(done("contact not found"));
        };

        let runner = match self.runners.build(&step) {
            None => {
                warn!(step_id = %step_id, subtype = %step.subtype, "no runner registered for subtype");
                return Ok(done("unregistered subtype"));
            }
            Some(Err(error)) => {
                warn!(step_id = %step_id, %error, "step cannot be built");
                return Ok(done("invalid step configuration"));
            }
            Some(Ok(runner)) => runner,
        };

        let ctx = StepContext {
            contact: &contact,
            step: &step,
            stores: &self.stores,
            mail: self.mail.as_ref(),
        };
        let outcome = runner.run(&ctx).await?;

        if !self
            .stores
            .automations
            .record_completion(contact_id, step_id, outcome.followed_branch())
            .await?
        {
            // A concurrent run recorded the step first and owns the advance.
            return Ok(done("step already completed"));
        }

        let next = self.advance(&step, contact_id, outcome).await?;
        debug!(step_id = %step_id, contact_id = %contact_id, subtype = %step.subtype, "step completed");
        Ok(JobResult::output(json!({ "subtype": step.subtype, "next": next })))
    }

    /// Enqueue `run_step` for every contact that left the step's parent on the step's
    /// branch but has not reached the step.
    pub async fn fan_out_step(&self, payload: FanOutStep) -> Result<JobResult, JobError> {
        let Some(step) = self.stores.automations.get_step(payload.step_id).await? else {
            return Ok(done("step not found"));
        };
        let Some(parent) = step.parent_id else {
            return Ok(done("step has no parent"));
        };

        let page_size = self.settings.page_size.max(1);
        let mut cursor: Option<ContactId> = None;
        let mut enqueued = 0usize;
        loop {
            let page = self
                .stores
                .automations
                .pending_at_step(parent, step.branch_index, step.id, cursor, page_size)
                .await?;
            let Some(last) = page.last().copied() else {
                break;
            };

            let jobs = page
                .iter()
                .map(|contact_id| {
                    RunStep {
                        step_id: step.id,
                        contact_id: *contact_id,
                    }
                    .job()
                })
                .collect::<Result<Vec<NewJob>, _>>()?;
            enqueued += self.jobs.dispatch_many(jobs).await?.len();

            if page.len() < page_size {
                break;
            }
            cursor = Some(last);
        }

        info!(step_id = %step.id, enqueued, "fan-out finished");
        Ok(JobResult::output(json!({ "enqueued": enqueued })))
    }

    /// Enqueue `run_workflow` for every contact of the automation's audience that
    /// matches the trigger.
    pub async fn enroll_audience(&self, payload: EnrollAudience) -> Result<JobResult, JobError> {
        let automation_id = payload.automation_id;
        let Some(automation) = self.stores.automations.get_automation(automation_id).await? else {
            return Ok(done("automation not found"));
        };
        if !automation.active {
            return Ok(done("automation inactive"));
        }
        let Some(trigger) = self.stores.automations.trigger_step(automation_id).await? else {
            return Ok(done("automation has no trigger"));
        };
        let predicate = match trigger_predicate(&trigger) {
            Ok(predicate) => predicate,
            Err(error) => {
                warn!(step_id = %trigger.id, %error, "trigger cannot be evaluated");
                return Ok(done("invalid trigger"));
            }
        };

        let page_size = self.settings.page_size.max(1);
        let mut cursor: Option<ContactId> = None;
        let mut enqueued = 0usize;
        loop {
            let page = self
                .stores
                .contacts
                .page_audience(automation.audience_id, &predicate, cursor, page_size)
                .await?;
            let Some(last) = page.last().map(|c| c.id) else {
                break;
            };

            let jobs = page
                .iter()
                .map(|contact| {
                    RunWorkflow {
                        automation_id,
                        contact_id: contact.id,
                    }
                    .job()
                })
                .collect::<Result<Vec<NewJob>, _>>()?;
            enqueued += self.jobs.dispatch_many(jobs).await?.len();

            if page.len() < page_size {
                break;
            }
            cursor = Some(last);
        }

        info!(automation_id = %automation_id, enqueued, "audience enrolled");
        Ok(JobResult::output(json!({ "enqueued": enqueued })))
    }

    /// Enqueue the child selected by `outcome`. Returns the child's step id, if any.
    async fn advance(
        &self,
        step: &AutomationStep,
        contact_id: ContactId,
        outcome: StepOutcome,
    ) -> Result<Option<String>, JobError> {
        let StepOutcome::Continue { branch, delay } = outcome else {
            return Ok(None);
        };
        let children = self.stores.automations.children(step.id).await?;
        let Some(child) = select_child(&children, branch) else {
            return Ok(None);
        };

        let mut job = RunStep {
            step_id: child.id,
            contact_id,
        }
        .job()?;
        if let Some(delay) = delay {
            job = job.delayed(delay);
        }
        self.jobs.dispatch(job).await?;
        Ok(Some(child.id.to_string()))
    }
}

impl std::fmt::Debug for AutomationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutomationEngine")
            .field("runners", &self.runners)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
