//! Step runners.
//!
//! A runner is built per execution from the step's configuration by a constructor
//! registered under the step's subtype. New step kinds register a constructor; the
//! `run_step` handler never changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use mailpulse_automations::{
    subtype, AutomationStep, IfElseConfig, SendEmailConfig, StepConfigError, StepOutcome,
    TagConfig, WaitConfig, BRANCH_ELSE, BRANCH_THEN,
};
use mailpulse_broadcasts::EmailContent;
use mailpulse_core::{Contact, TagId};
use mailpulse_segments::{compile, Predicate, SegmentError};

use crate::jobs::JobError;
use crate::mail::{MailSender, OutboundEmail};
use crate::store::Stores;

/// A step could not be turned into a runner. Retrying does not help.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StepBuildError {
    #[error(transparent)]
    Config(#[from] StepConfigError),

    #[error(transparent)]
    Segment(#[from] SegmentError),
}

/// Everything a runner may touch while running for one contact.
pub struct StepContext<'a> {
    pub contact: &'a Contact,
    pub step: &'a AutomationStep,
    pub stores: &'a Stores,
    pub mail: &'a dyn MailSender,
}

#[async_trait::async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, JobError>;
}

pub type RunnerConstructor =
    Arc<dyn Fn(&AutomationStep) -> Result<Box<dyn StepRunner>, StepBuildError> + Send + Sync>;

/// Subtype -> runner constructor.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    constructors: HashMap<String, RunnerConstructor>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in subtype.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register(subtype::ACTION_ADD_TAG, |step| {
                let config: TagConfig = step.config_as()?;
                Ok(Box::new(AddTag(config.tag_id)))
            })
            .register(subtype::ACTION_REMOVE_TAG, |step| {
                let config: TagConfig = step.config_as()?;
                Ok(Box::new(RemoveTag(config.tag_id)))
            })
            .register(subtype::ACTION_SEND_EMAIL, |step| {
                let config: SendEmailConfig = step.config_as()?;
                Ok(Box::new(SendEmail(EmailContent {
                    from: config.from,
                    subject: config.subject,
                    html: config.html,
                    text: config.text,
                })))
            })
            .register(subtype::RULE_IF_ELSE, |step| {
                let config: IfElseConfig = step.config_as()?;
                Ok(Box::new(IfElse(compile(&config.filter)?)))
            })
            .register(subtype::RULE_WAIT, |step| {
                let config: WaitConfig = step.config_as()?;
                Ok(Box::new(Wait(config.duration())))
            })
            .register(subtype::END, |_| Ok(Box::new(End)));
        registry
    }

    /// Register a constructor; replaces an earlier one for the same subtype.
    pub fn register<F>(&mut self, subtype: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&AutomationStep) -> Result<Box<dyn StepRunner>, StepBuildError> + Send + Sync + 'static,
    {
        self.constructors.insert(subtype.into(), Arc::new(constructor));
        self
    }

    pub fn contains(&self, subtype: &str) -> bool {
        self.constructors.contains_key(subtype)
    }

    /// `None` when no constructor is registered for the step's subtype.
    pub fn build(&self, step: &AutomationStep) -> Option<Result<Box<dyn StepRunner>, StepBuildError>> {
        self.constructors.get(&step.subtype).map(|c| c(step))
    }
}

impl std::fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut subtypes: Vec<&String> = self.constructors.keys().collect();
        subtypes.sort();
        f.debug_struct("RunnerRegistry")
            .field("subtypes", &subtypes)
            .finish()
    }
}

struct AddTag(TagId);

#[async_trait::async_trait]
impl StepRunner for AddTag {
    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, JobError> {
        ctx.stores.contacts.add_tag(ctx.contact.id, self.0).await?;
        Ok(StepOutcome::next())
    }
}

struct RemoveTag(TagId);

#[async_trait::async_trait]
impl StepRunner for RemoveTag {
    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, JobError> {
        ctx.stores.contacts.remove_tag(ctx.contact.id, self.0).await?;
        Ok(StepOutcome::next())
    }
}

struct SendEmail(EmailContent);

#[async_trait::async_trait]
impl StepRunner for SendEmail {
    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, JobError> {
        if !ctx.contact.subscribed {
            tracing::debug!(step_id = %ctx.step.id, contact_id = %ctx.contact.id, "contact unsubscribed, email skipped");
            return Ok(StepOutcome::next());
        }
        let message_id = ctx
            .mail
            .send(&OutboundEmail::to_contact(&self.0, ctx.contact))
            .await?;
        tracing::debug!(
            step_id = %ctx.step.id,
            contact_id = %ctx.contact.id,
            message_id = %message_id,
            "automation email sent"
        );
        Ok(StepOutcome::next())
    }
}

struct IfElse(Predicate);

#[async_trait::async_trait]
impl StepRunner for IfElse {
    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, JobError> {
        let branch = if self.0.matches(ctx.contact) {
            BRANCH_THEN
        } else {
            BRANCH_ELSE
        };
        Ok(StepOutcome::branch(branch))
    }
}

struct Wait(Duration);

#[async_trait::async_trait]
impl StepRunner for Wait {
    async fn run(&self, _ctx: &StepContext<'_>) -> Result<StepOutcome, JobError> {
        Ok(StepOutcome::after(self.0))
    }
}

struct End;

#[async_trait::async_trait]
impl StepRunner for End {
    async fn run(&self, _ctx: &StepContext<'_>) -> Result<StepOutcome, JobError> {
        Ok(StepOutcome::Stop)
    }
}
