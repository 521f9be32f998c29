//! Automation workflow execution.
//!
//! - `jobs`: payloads and job type names of the `automations` queue
//! - `runners`: subtype -> step runner constructors
//! - `engine`: the handlers

pub mod engine;
pub mod jobs;
pub mod runners;

use std::sync::Arc;

pub use engine::{ActivationError, AutomationEngine, AutomationSettings, DEFAULT_PAGE_SIZE};
pub use jobs::{
    EnrollAudience, FanOutStep, RunStep, RunWorkflow, ENROLL_AUDIENCE, FAN_OUT_STEP, QUEUE,
    RUN_STEP, RUN_WORKFLOW,
};
pub use runners::{RunnerConstructor, RunnerRegistry, StepBuildError, StepContext, StepRunner};

use crate::jobs::{FnHandler, Job, JobRegistry, JobTypeOptions};

/// Register the automation job types.
pub fn register(registry: &mut JobRegistry, engine: Arc<AutomationEngine>, options: JobTypeOptions) {
    let e = engine.clone();
    registry.register_with(
        RUN_WORKFLOW,
        options.clone(),
        FnHandler(move |job: Job| {
            let e = e.clone();
            async move { e.run_workflow(job.payload_as()?).await }
        }),
    );

    let e = engine.clone();
    registry.register_with(
        RUN_STEP,
        options.clone(),
        FnHandler(move |job: Job| {
            let e = e.clone();
            async move { e.run_step(job.payload_as()?).await }
        }),
    );

    let e = engine.clone();
    registry.register_with(
        FAN_OUT_STEP,
        options.clone(),
        FnHandler(move |job: Job| {
            let e = e.clone();
            async move { e.fan_out_step(job.payload_as()?).await }
        }),
    );

    let e = engine;
    registry.register_with(
        ENROLL_AUDIENCE,
        options,
        FnHandler(move |job: Job| {
            let e = e.clone();
            async move { e.enroll_audience(job.payload_as()?).await }
        }),
    );
}
